use std::sync::{Arc, OnceLock};

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::{Error, Result};

/// Internal TLS connector wrapper using rustls.
#[derive(Clone)]
pub struct TlsConnectorInner {
    connector: TlsConnector,
}

impl TlsConnectorInner {
    /// Creates a new TLS connector with default secure configuration.
    ///
    /// Uses `webpki-roots` for Mozilla's root certificates and `ring` as the crypto provider.
    pub fn new() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Returns the process-wide connector shared by every node pool.
    pub fn shared() -> &'static Self {
        static CONNECTOR: OnceLock<TlsConnectorInner> = OnceLock::new();
        CONNECTOR.get_or_init(Self::new)
    }

    /// Performs the TLS handshake on an established TCP stream.
    ///
    /// `address` is the `host:port` the stream was dialed with; the host part
    /// is used for SNI and certificate verification.
    pub async fn connect(&self, stream: TcpStream, address: &str) -> Result<TlsStream<TcpStream>> {
        let host = address
            .rsplit_once(':')
            .map_or(address, |(host, _)| host)
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let server_name = ServerName::try_from(host).map_err(|_| Error::InvalidArgument {
            message: format!("invalid TLS server name in {address}"),
        })?;
        let stream = self.connector.connect(server_name, stream).await?;
        Ok(stream)
    }
}
