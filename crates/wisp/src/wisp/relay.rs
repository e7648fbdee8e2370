use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wisp::error::{Direction, RelayError};

const BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub uploaded: u64,
    pub downloaded: u64,
}

/// Last time either direction moved bytes.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn quiet_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// Copy bytes between `local` and `remote` in both directions.
///
/// Returns once either side reaches EOF, either side fails, or neither
/// direction has moved a byte for `idle`. Both ends are shut down and dropped
/// before returning.
pub async fn relay<L, R>(local: L, remote: R, idle: Duration) -> Result<RelayStats, RelayError>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut lr, mut lw) = tokio::io::split(local);
    let (mut rr, mut rw) = tokio::io::split(remote);
    let activity = Activity::new();
    let uploaded = AtomicU64::new(0);
    let downloaded = AtomicU64::new(0);

    let res = {
        let up = pump(&mut lr, &mut rw, &activity, &uploaded, Direction::Upload);
        let down = pump(&mut rr, &mut lw, &activity, &downloaded, Direction::Download);
        let watchdog = watch_idle(&activity, idle);
        tokio::select! {
            r = up => r,
            r = down => r,
            e = watchdog => Err(e),
        }
    };

    // Best-effort shutdown.
    let _ = rw.shutdown().await;
    let _ = lw.shutdown().await;

    res.map(|()| RelayStats {
        uploaded: uploaded.load(Ordering::Relaxed),
        downloaded: downloaded.load(Ordering::Relaxed),
    })
}

async fn pump<R, W>(
    r: &mut R,
    w: &mut W,
    activity: &Activity,
    counter: &AtomicU64,
    direction: Direction,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let io_err = |source| RelayError::Io { direction, source };
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = r.read(&mut buf).await.map_err(io_err)?;
        if n == 0 {
            return Ok(());
        }
        activity.touch();
        w.write_all(&buf[..n]).await.map_err(io_err)?;
        w.flush().await.map_err(io_err)?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

async fn watch_idle(activity: &Activity, idle: Duration) -> RelayError {
    loop {
        let quiet = activity.quiet_for();
        if quiet >= idle {
            return RelayError::Idle(idle);
        }
        tokio::time::sleep(idle - quiet).await;
    }
}
