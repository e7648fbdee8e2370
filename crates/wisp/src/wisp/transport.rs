use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::time;
use tokio_rustls::TlsConnector;

use crate::wisp::error::TransportError;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

pub mod tcp;
pub mod tls;
pub mod ws;

/// Opens one raw byte stream to the remote server (normally plain TCP).
///
/// Injected into [`TransportDialer`] so tests can substitute in-memory pipes.
#[async_trait]
pub trait RawConnector: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream, TransportError>;
}

/// Establishes one physical, obfuscated connection to the remote server.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_server(&self) -> Result<BoxedStream, TransportError>;
}

#[derive(Debug, Clone)]
pub struct WsOptions {
    pub url: String,
    pub subprotocol: &'static str,
}

pub struct TransportDialer {
    raw: Arc<dyn RawConnector>,
    tls: TlsConnector,
    server_name: ServerName<'static>,
    ws: Option<WsOptions>,
    handshake_timeout: Duration,
}

impl TransportDialer {
    pub fn new(
        raw: Arc<dyn RawConnector>,
        tls_config: rustls::ClientConfig,
        server_name: ServerName<'static>,
        ws: Option<WsOptions>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            raw,
            tls: TlsConnector::from(Arc::new(tls_config)),
            server_name,
            ws,
            handshake_timeout,
        }
    }

    pub async fn dial_raw(&self) -> Result<BoxedStream, TransportError> {
        self.raw.connect().await
    }

    pub async fn dial_tls(&self) -> Result<BoxedStream, TransportError> {
        let raw = self.dial_raw().await?;
        // A failed handshake drops (and so closes) the raw connection.
        let conn = time::timeout(
            self.handshake_timeout,
            self.tls.connect(self.server_name.clone(), raw),
        )
        .await
        .map_err(|_| TransportError::timeout("tls handshake", self.handshake_timeout))?
        .map_err(TransportError::Tls)?;
        Ok(Box::new(conn))
    }

    pub async fn dial_wss(&self, ws: &WsOptions) -> Result<BoxedStream, TransportError> {
        let upgrade = async {
            let tls = self.dial_tls().await?;
            ws::connect(&ws.url, ws.subprotocol, tls).await
        };
        let conn = time::timeout(self.handshake_timeout, upgrade)
            .await
            .map_err(|_| TransportError::timeout("websocket upgrade", self.handshake_timeout))??;
        Ok(Box::new(conn))
    }
}

#[async_trait]
impl Dialer for TransportDialer {
    async fn dial_server(&self) -> Result<BoxedStream, TransportError> {
        match &self.ws {
            Some(ws) => self.dial_wss(ws).await,
            None => self.dial_tls().await,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::PipeConnector, *};
    use rcgen::{CertifiedKey, generate_simple_self_signed};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsAcceptor;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn acceptor() -> TlsAcceptor {
        let CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(["localhost".to_string()]).unwrap();
        let cert_der: CertificateDer<'static> = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
        let cfg = rustls::ServerConfig::builder_with_provider(tls::provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();
        TlsAcceptor::from(Arc::new(cfg))
    }

    fn dialer(
        serve: impl Fn(tokio::io::DuplexStream) + Send + Sync + 'static,
        skip_verify: bool,
        ws: Option<WsOptions>,
    ) -> TransportDialer {
        TransportDialer::new(
            Arc::new(PipeConnector { serve }),
            tls::client_config(skip_verify).unwrap(),
            tls::server_name("localhost").unwrap(),
            ws,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn tls_dial_reaches_echo_server() {
        let acc = acceptor();
        let d = dialer(
            move |io| {
                let acc = acc.clone();
                tokio::spawn(async move {
                    if let Ok(s) = acc.accept(io).await {
                        super::testing::echo(s).await;
                    }
                });
            },
            true,
            None,
        );

        let mut c = d.dial_server().await.unwrap();
        c.write_all(b"ping").await.unwrap();
        c.flush().await.unwrap();
        let mut buf = [0u8; 4];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn untrusted_certificate_fails_without_skip_verify() {
        let acc = acceptor();
        let d = dialer(
            move |io| {
                let acc = acc.clone();
                tokio::spawn(async move {
                    let _ = acc.accept(io).await;
                });
            },
            false,
            None,
        );

        let err = d.dial_server().await.err().expect("self-signed cert must be rejected");
        assert!(matches!(err, TransportError::Tls(_)), "got {err}");
    }

    #[tokio::test]
    async fn wss_dial_upgrades_with_subprotocol() {
        let acc = acceptor();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<Option<String>>();
        let seen_tx = std::sync::Mutex::new(Some(seen_tx));
        let d = dialer(
            move |io| {
                let acc = acc.clone();
                let tx = seen_tx.lock().unwrap().take();
                tokio::spawn(async move {
                    let tls = acc.accept(io).await.unwrap();
                    let mut proto = None;
                    let cb = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                        if let Some(p) = req.headers().get("Sec-WebSocket-Protocol") {
                            proto = p.to_str().ok().map(str::to_string);
                            resp.headers_mut().insert("Sec-WebSocket-Protocol", p.clone());
                        }
                        Ok(resp)
                    };
                    let ws = tokio_tungstenite::accept_hdr_async(tls, cb).await.unwrap();
                    if let Some(tx) = tx {
                        let _ = tx.send(proto);
                    }
                    super::testing::echo(ws::WsStream::new(ws)).await;
                });
            },
            true,
            Some(WsOptions {
                url: "wss://localhost/ws".into(),
                subprotocol: ws::subprotocol(false),
            }),
        );

        let mut c = d.dial_server().await.unwrap();
        c.write_all(b"over-ws").await.unwrap();
        c.flush().await.unwrap();
        let mut buf = [0u8; 7];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over-ws");
        assert_eq!(seen_rx.await.unwrap().as_deref(), Some(ws::SUBPROTOCOL_RAW));
    }
}
