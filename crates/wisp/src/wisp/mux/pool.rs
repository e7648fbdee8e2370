use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;

use crate::wisp::{
    error::{SessionError, TransportError},
    mux::{
        MuxOptions,
        session::{MuxStream, Session},
    },
    transport::Dialer,
};

/// Live multiplexed sessions, keyed by a process-local id.
///
/// Sessions are only ever removed lazily, when an acquire finds them closed or
/// broken. Concurrent acquires may each dial a fresh session even though one
/// would have been enough; the per-session stream limit still holds.
pub struct SessionPool {
    dialer: Arc<dyn Dialer>,
    opts: MuxOptions,
    sessions: DashMap<u64, Arc<Session>>,
    next_id: AtomicU64,
}

impl SessionPool {
    pub fn new(dialer: Arc<dyn Dialer>, opts: MuxOptions) -> Self {
        Self {
            dialer,
            opts,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Open a stream on any session with spare capacity, dialing a new
    /// session when none has.
    pub async fn acquire_stream(&self) -> Result<MuxStream, TransportError> {
        // Snapshot first: no map guard may live across an await.
        let candidates: Vec<Arc<Session>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();

        for sess in candidates {
            if sess.is_closed() {
                self.sessions.remove(&sess.id());
                tracing::debug!(session = sess.id(), "mux: dropped closed session");
                continue;
            }
            match sess.open_stream().await {
                Ok(st) => return Ok(st),
                Err(SessionError::TooManyStreams) => continue,
                Err(err) => {
                    self.evict(&sess);
                    tracing::warn!(session = sess.id(), error = %err, "mux: evicted broken session");
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = self.dialer.dial_server().await?;
        let sess = Arc::new(Session::client(id, conn, self.opts));
        let st = match sess.open_stream().await {
            Ok(st) => st,
            Err(err) => {
                sess.close();
                return Err(err.into());
            }
        };
        self.sessions.insert(id, sess);
        tracing::debug!(session = id, sessions = self.len(), "mux: new session");
        Ok(st)
    }

    fn evict(&self, sess: &Session) {
        self.sessions.remove(&sess.id());
        sess.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wisp::transport::testing::PipeDialer;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pool(dialer: Arc<PipeDialer>, opts: MuxOptions) -> SessionPool {
        SessionPool::new(dialer, opts)
    }

    async fn assert_echo(st: &mut MuxStream, msg: &[u8]) {
        st.write_all(msg).await.unwrap();
        st.flush().await.unwrap();
        let mut buf = vec![0u8; msg.len()];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, msg);
    }

    async fn wait_all_closed(p: &SessionPool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let open = p.sessions.iter().any(|e| !e.value().is_closed());
                if !open {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("sessions should close");
    }

    #[tokio::test]
    async fn reuses_session_until_full() {
        let dialer = PipeDialer::new(true);
        let p = pool(dialer.clone(), MuxOptions::new(3));

        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(p.acquire_stream().await.unwrap());
        }
        assert_eq!(dialer.dials(), 1);
        assert_eq!(p.len(), 1);

        held.push(p.acquire_stream().await.unwrap());
        assert_eq!(dialer.dials(), 2);
        assert_eq!(p.len(), 2);

        for (i, st) in held.iter_mut().enumerate() {
            assert_echo(st, format!("stream-{i}").as_bytes()).await;
        }
    }

    #[tokio::test]
    async fn released_stream_frees_capacity() {
        let dialer = PipeDialer::new(true);
        let p = pool(dialer.clone(), MuxOptions::new(2));

        let a = p.acquire_stream().await.unwrap();
        let _b = p.acquire_stream().await.unwrap();
        drop(a);
        let mut c = p.acquire_stream().await.unwrap();
        assert_eq!(dialer.dials(), 1);
        assert_echo(&mut c, b"again").await;
    }

    #[tokio::test]
    async fn closed_session_is_never_handed_out() {
        let dialer = PipeDialer::new(true);
        let p = pool(dialer.clone(), MuxOptions::new(4));

        drop(p.acquire_stream().await.unwrap());
        dialer.kill_servers();
        wait_all_closed(&p).await;

        let mut st = p.acquire_stream().await.unwrap();
        assert_eq!(dialer.dials(), 2);
        assert_eq!(p.len(), 1);
        assert_echo(&mut st, b"fresh").await;
    }

    #[tokio::test]
    async fn failed_open_evicts_and_redials() {
        let dialer = PipeDialer::new(true);
        let p = pool(dialer.clone(), MuxOptions::new(4));

        drop(p.acquire_stream().await.unwrap());
        let stale: Vec<Arc<Session>> = p.sessions.iter().map(|e| e.value().clone()).collect();
        assert_eq!(stale.len(), 1);
        stale[0].stop_driver().await;
        assert!(!stale[0].is_closed());

        let mut st = p.acquire_stream().await.unwrap();
        assert_eq!(dialer.dials(), 2);
        assert_eq!(p.len(), 1);
        assert!(stale[0].is_closed(), "evicted session must be closed");
        assert!(!p.sessions.contains_key(&stale[0].id()));
        assert_echo(&mut st, b"after evict").await;
    }

    #[tokio::test]
    async fn idle_sessions_are_reaped() {
        let dialer = PipeDialer::new(true);
        let opts = MuxOptions {
            max_streams: 4,
            check_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_millis(200),
        };
        let p = pool(dialer.clone(), opts);

        drop(p.acquire_stream().await.unwrap());
        wait_all_closed(&p).await;

        let _st = p.acquire_stream().await.unwrap();
        assert_eq!(dialer.dials(), 2);
        assert_eq!(p.len(), 1);
    }

    #[tokio::test]
    async fn dial_failure_inserts_nothing() {
        let dialer = PipeDialer::new(true);
        dialer.fail.store(true, Ordering::SeqCst);
        let p = pool(dialer.clone(), MuxOptions::new(4));

        let err = p.acquire_stream().await.err().expect("dial must fail");
        assert!(matches!(err, TransportError::Dial { .. }), "got {err}");
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn concurrent_acquires_respect_stream_limit() {
        let dialer = PipeDialer::new(true);
        let p = Arc::new(pool(dialer.clone(), MuxOptions::new(4)));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let p = p.clone();
            tasks.push(tokio::spawn(async move { p.acquire_stream().await }));
        }
        let mut held = Vec::new();
        for t in tasks {
            held.push(t.await.unwrap().unwrap());
        }

        assert!(dialer.dials() >= 4);
        for e in p.sessions.iter() {
            assert!(e.value().open_streams() <= 4);
        }
        let total: usize = p.sessions.iter().map(|e| e.value().open_streams()).sum();
        assert_eq!(total, 16);
    }
}
