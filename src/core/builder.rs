use std::time::Duration;

use crate::cluster::{join_host_port, Cluster, PoolConfig};
use crate::{Error, Result};

/// Options applied whenever a connection to a cluster node is dialed.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use slotlink::DialOptions;
///
/// let options = DialOptions::new()
///     .connect_timeout(Duration::from_secs(2))
///     .password("secret")
///     .client_name("billing");
/// assert_eq!(options.get_connect_timeout(), Some(Duration::from_secs(2)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) client_name: Option<String>,
    pub(crate) tls: bool,
}

impl DialOptions {
    /// Creates options with no timeouts, no authentication and no TLS.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum time to wait for the TCP (and TLS) handshake.
    #[inline]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the read timeout for replies. `None` means no timeout.
    #[inline]
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the write timeout for commands. `None` means no timeout.
    #[inline]
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the username for ACL authentication.
    #[inline]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password sent with AUTH after connecting.
    #[inline]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the connection name displayed in `CLIENT LIST`.
    #[inline]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Enables or disables TLS. Requires the `tls` feature to dial.
    #[inline]
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// Returns the configured connect timeout.
    #[inline]
    pub fn get_connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }
}

/// Builder for configuring and creating a [`Cluster`].
///
/// Building performs no network I/O; call [`Cluster::refresh`] to load the
/// slot mapping.
///
/// # Example
///
/// ```no_run
/// use slotlink::ClusterBuilder;
///
/// # #[tokio::main]
/// # async fn main() -> slotlink::Result<()> {
/// let cluster = ClusterBuilder::new()
///     .startup_nodes(["127.0.0.1:7000", "redis://127.0.0.1:7001"])
///     .build()?;
/// cluster.refresh().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ClusterBuilder {
    startup_nodes: Vec<String>,
    dial_options: DialOptions,
    pool_config: PoolConfig,
}

impl ClusterBuilder {
    /// Creates a new [`ClusterBuilder`].
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds startup nodes used to discover the topology.
    ///
    /// Accepts `host:port`, `redis://host:port` and `rediss://host:port`.
    pub fn startup_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.startup_nodes.extend(nodes.into_iter().map(Into::into));
        self
    }

    /// Sets the options used to dial every node.
    #[inline]
    pub fn dial_options(mut self, options: DialOptions) -> Self {
        self.dial_options = options;
        self
    }

    /// Sets the per-node pool configuration.
    #[inline]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Builds the [`Cluster`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if no startup node is given or an
    /// address cannot be parsed.
    pub fn build(mut self) -> Result<Cluster> {
        let mut nodes: Vec<String> = Vec::with_capacity(self.startup_nodes.len());
        for raw in &self.startup_nodes {
            let (address, tls) = normalize_address(raw)?;
            if tls {
                self.dial_options.tls = true;
            }
            if !nodes.contains(&address) {
                nodes.push(address);
            }
        }

        if nodes.is_empty() {
            return Err(Error::InvalidArgument {
                message: "no startup nodes provided".to_string(),
            });
        }

        if self.dial_options.tls && !cfg!(feature = "tls") {
            return Err(Error::InvalidArgument {
                message: "TLS requested but the `tls` feature is disabled".to_string(),
            });
        }

        Ok(Cluster::from_parts(nodes, self.dial_options, self.pool_config))
    }
}

/// Normalizes a startup address to `host:port`.
///
/// Returns the address and whether the `rediss` scheme asked for TLS.
pub(crate) fn normalize_address(raw: &str) -> Result<(String, bool)> {
    let raw = raw.trim();
    let invalid = || Error::InvalidArgument {
        message: format!("invalid node address: {raw:?}"),
    };

    if raw.contains("://") {
        let parsed = url::Url::parse(raw).map_err(|_| invalid())?;
        let tls = match parsed.scheme() {
            "redis" => false,
            "rediss" => true,
            _ => {
                return Err(Error::InvalidArgument {
                    message: "invalid scheme, expected redis:// or rediss://".to_string(),
                })
            }
        };
        let host = parsed.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let port = parsed.port().unwrap_or(6379);
        return Ok((format!("{host}:{port}"), tls));
    }

    let (host, port) = raw.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Ok((join_host_port(host, port), false))
}
