use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time;

use crate::wisp::{
    error::TransportError,
    net::{self, ConnectHook},
    resolver::Resolver,
    transport::{BoxedStream, RawConnector},
};

/// Plain TCP connector for the remote server address.
pub struct TcpConnector {
    host: String,
    port: u16,
    addr: String,
    resolver: Arc<dyn Resolver>,
    hook: Arc<dyn ConnectHook>,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        resolver: Arc<dyn Resolver>,
        hook: Arc<dyn ConnectHook>,
        timeout: Duration,
    ) -> Self {
        let host = host.into();
        let addr = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Self {
            host,
            port,
            addr,
            resolver,
            hook,
            timeout,
        }
    }

    async fn connect_inner(&self) -> Result<BoxedStream, TransportError> {
        let addrs = self
            .resolver
            .resolve(&self.host, self.port)
            .await
            .map_err(|source| TransportError::Resolve {
                host: self.host.clone(),
                source,
            })?;

        let mut last_err = None;
        for sa in addrs {
            let socket = net::new_socket_for(sa.ip()).map_err(TransportError::Socket)?;
            self.hook
                .before_connect(&socket)
                .await
                .map_err(TransportError::Socket)?;
            match socket.connect(sa).await {
                Ok(c) => return Ok(Box::new(c)),
                Err(err) => {
                    tracing::debug!(addr = %sa, err = %err, "dial: connect attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(TransportError::Dial {
            addr: self.addr.clone(),
            source: last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses")),
        })
    }
}

#[async_trait]
impl RawConnector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        time::timeout(self.timeout, self.connect_inner())
            .await
            .map_err(|_| TransportError::timeout("tcp connect", self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wisp::{net::SocketTuning, resolver::SystemResolver};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    fn connector(host: &str, port: u16) -> TcpConnector {
        TcpConnector::new(
            host,
            port,
            Arc::new(SystemResolver),
            Arc::new(SocketTuning::default()),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn connects_to_loopback() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            s.write_all(b"hi").await.unwrap();
        });

        let mut c = connector("127.0.0.1", port).connect().await.unwrap();
        let mut buf = [0u8; 2];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn refused_connection_is_a_dial_error() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        drop(ln);

        let err = connector("127.0.0.1", port)
            .connect()
            .await
            .err()
            .expect("connect must fail");
        assert!(matches!(err, TransportError::Dial { .. }), "got {err}");
    }
}
