use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Instant,
};

use futures_util::StreamExt;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::wisp::{error::SessionError, mux::MuxOptions, transport::BoxedStream};

/// State shared between a session handle, its driver task and its streams.
#[derive(Debug)]
struct Shared {
    started: Instant,
    open: AtomicUsize,
    idle_since_ms: AtomicU64,
    last_read_ms: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            open: AtomicUsize::new(0),
            idle_since_ms: AtomicU64::new(0),
            last_read_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Reserve one stream slot unless `max` are already open.
    fn try_acquire(&self, max: usize) -> Result<(), SessionError> {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| SessionError::TooManyStreams)
    }

    fn release(&self) {
        if self.open.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle_since_ms.store(self.now_ms(), Ordering::Release);
        }
    }

    fn idle_reason(&self, opts: &MuxOptions) -> Option<&'static str> {
        let now = self.now_ms();
        let limit = opts.idle_timeout.as_millis() as u64;
        if now.saturating_sub(self.last_read_ms.load(Ordering::Acquire)) >= limit {
            return Some("no inbound traffic");
        }
        if self.open.load(Ordering::Acquire) == 0
            && now.saturating_sub(self.idle_since_ms.load(Ordering::Acquire)) >= limit
        {
            return Some("no open streams");
        }
        None
    }
}

/// One physical transport connection carrying multiplexed streams.
pub struct Session {
    id: u64,
    max_streams: usize,
    control: tokio::sync::Mutex<tokio_yamux::Control>,
    shared: Arc<Shared>,
    task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("open_streams", &self.open_streams())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start a yamux client session on `conn`.
    pub fn client(id: u64, conn: BoxedStream, opts: MuxOptions) -> Self {
        let shared = Arc::new(Shared::new());
        let io = ActivityStream {
            inner: conn,
            shared: shared.clone(),
        };
        let session = tokio_yamux::Session::new_client(io, opts.yamux_config());
        let control = session.control();
        let task = tokio::spawn(drive(id, session, shared.clone(), opts));

        Self {
            id,
            max_streams: opts.max_streams,
            control: tokio::sync::Mutex::new(control),
            shared,
            task,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn open_streams(&self) -> usize {
        self.shared.open.load(Ordering::Acquire)
    }

    pub async fn open_stream(&self) -> Result<MuxStream, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.shared.try_acquire(self.max_streams)?;
        // Dropping the slot on any early return gives the reservation back.
        let slot = StreamSlot {
            shared: self.shared.clone(),
        };

        let mut ctrl = self.control.lock().await;
        let inner = ctrl
            .open_stream()
            .await
            .map_err(|e| SessionError::Open(e.to_string()))?;
        Ok(MuxStream { inner, _slot: slot })
    }

    /// Tear down the physical connection. Open streams fail afterwards.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.task.abort();
    }

    /// Stops the driver without marking the session closed, leaving a handle
    /// whose next open fails.
    #[cfg(test)]
    pub(crate) async fn stop_driver(&self) {
        self.task.abort();
        while !self.task.is_finished() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn drive(
    id: u64,
    mut session: tokio_yamux::Session<ActivityStream>,
    shared: Arc<Shared>,
    opts: MuxOptions,
) {
    let mut tick = tokio::time::interval(opts.check_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            next = session.next() => match next {
                // The remote never opens streams towards us; refuse by dropping.
                Some(Ok(st)) => drop(st),
                Some(Err(_)) => break "session error",
                None => break "remote closed",
            },
            _ = tick.tick() => {
                if let Some(reason) = shared.idle_reason(&opts) {
                    break reason;
                }
            }
        }
    };

    shared.closed.store(true, Ordering::Release);
    tracing::debug!(session = id, reason, "mux: session closed");
}

/// Records the time of the last successful inbound read.
struct ActivityStream {
    inner: BoxedStream,
    shared: Arc<Shared>,
}

impl AsyncRead for ActivityStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(res, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.shared
                .last_read_ms
                .store(this.shared.now_ms(), Ordering::Release);
        }
        res
    }
}

impl AsyncWrite for ActivityStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

struct StreamSlot {
    shared: Arc<Shared>,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.shared.release();
    }
}

pin_project! {
    /// A logical stream; frees its session slot when dropped.
    pub struct MuxStream {
        #[pin]
        inner: tokio_yamux::StreamHandle,
        _slot: StreamSlot,
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
