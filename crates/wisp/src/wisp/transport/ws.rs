//! WebSocket transport.
//!
//! The remote peer learns whether the connection carries multiplexed sessions
//! from the single subprotocol token announced in the upgrade request. Once
//! upgraded, the WebSocket is exposed as a plain byte stream.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Error as WsError, Message, client::IntoClientRequest, http::HeaderValue,
    },
};

use crate::wisp::error::TransportError;

pub const SUBPROTOCOL_MUX: &str = "wisp-mux";
pub const SUBPROTOCOL_RAW: &str = "wisp-raw";

pub fn subprotocol(mux: bool) -> &'static str {
    if mux { SUBPROTOCOL_MUX } else { SUBPROTOCOL_RAW }
}

/// Upgrade `io` (already TLS-wrapped) to a WebSocket at `url`.
pub async fn connect<S>(
    url: &str,
    subprotocol: &'static str,
    io: S,
) -> Result<WsStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut req = url.into_client_request()?;
    req.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(subprotocol),
    );
    let (ws, _resp) = tokio_tungstenite::client_async(req, io).await?;
    Ok(WsStream::new(ws))
}

pin_project! {
    /// Byte-stream view of a WebSocket: one binary message per write.
    pub struct WsStream<S> {
        #[pin]
        inner: WebSocketStream<S>,
        pending: Bytes,
        eof: bool,
    }
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            eof: false,
        }
    }
}

fn is_closed(err: &WsError) -> bool {
    matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

fn to_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if *this.eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => *this.pending = data,
                Some(Ok(Message::Close(_))) | None => *this.eof = true,
                // Pings are answered by tungstenite; text and pongs carry no payload for us.
                Some(Ok(_)) => {}
                Some(Err(err)) if is_closed(&err) => *this.eof = true,
                Some(Err(err)) => return Poll::Ready(Err(to_io(err))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        ready!(this.inner.as_mut().poll_ready(cx)).map_err(to_io)?;
        this.inner
            .as_mut()
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx).map_err(to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(self.project().inner.poll_close(cx)) {
            Err(err) if !is_closed(&err) => Poll::Ready(Err(to_io(err))),
            _ => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[tokio::test]
    async fn announces_subprotocol_and_carries_bytes() {
        let (client_io, server_io) = duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let mut seen = None;
            let cb = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                let proto = req
                    .headers()
                    .get("Sec-WebSocket-Protocol")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                seen = Some((req.uri().path().to_string(), proto.clone()));
                if let Some(p) = proto {
                    resp.headers_mut()
                        .insert("Sec-WebSocket-Protocol", p.parse().unwrap());
                }
                Ok(resp)
            };
            let ws = tokio_tungstenite::accept_hdr_async(server_io, cb).await.unwrap();
            let mut s = WsStream::new(ws);
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
            s.flush().await.unwrap();
            seen.unwrap()
        });

        let mut c = connect("wss://example.com/tunnel", SUBPROTOCOL_MUX, client_io)
            .await
            .unwrap();
        c.write_all(b"hello").await.unwrap();
        c.flush().await.unwrap();
        let mut back = [0u8; 5];
        c.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"hello");

        let (path, proto) = server.await.unwrap();
        assert_eq!(path, "/tunnel");
        assert_eq!(proto.as_deref(), Some(SUBPROTOCOL_MUX));
    }

    #[tokio::test]
    async fn close_frame_reads_as_eof() {
        let (client_io, server_io) = duplex(64 * 1024);

        tokio::spawn(async move {
            let cb = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                if let Some(p) = req.headers().get("Sec-WebSocket-Protocol") {
                    resp.headers_mut().insert("Sec-WebSocket-Protocol", p.clone());
                }
                Ok(resp)
            };
            let ws = tokio_tungstenite::accept_hdr_async(server_io, cb).await.unwrap();
            let mut s = WsStream::new(ws);
            s.write_all(b"bye").await.unwrap();
            s.shutdown().await.unwrap();
            // Keep the transport open until the client drops its end.
            let mut sink = Vec::new();
            let _ = s.read_to_end(&mut sink).await;
        });

        let mut c = connect("wss://example.com/", SUBPROTOCOL_RAW, client_io)
            .await
            .unwrap();
        let mut got = Vec::new();
        c.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");
    }

    #[test]
    fn subprotocol_tokens_differ() {
        assert_eq!(subprotocol(true), SUBPROTOCOL_MUX);
        assert_eq!(subprotocol(false), SUBPROTOCOL_RAW);
        assert_ne!(SUBPROTOCOL_MUX, SUBPROTOCOL_RAW);
    }
}
