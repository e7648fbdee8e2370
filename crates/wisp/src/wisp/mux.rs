//! Stream multiplexing over physical transport connections.
//!
//! A [`session::Session`] is one yamux client session riding on one dialed
//! connection. The [`pool::SessionPool`] hands out logical streams, reusing
//! sessions that still have capacity and lazily evicting dead ones.

use std::time::Duration;

pub mod pool;
pub mod session;

/// Upper bound for the per-session stream limit accepted by config.
pub const MAX_STREAMS_LIMIT: usize = 16;

/// How often each session checks its own liveness; also the keepalive ping
/// interval.
pub const CHECK_IDLE_INTERVAL: Duration = Duration::from_secs(2);

/// A session with no inbound traffic, or no open streams, for this long is
/// closed.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct MuxOptions {
    pub max_streams: usize,
    pub check_interval: Duration,
    pub idle_timeout: Duration,
}

impl MuxOptions {
    pub fn new(max_streams: usize) -> Self {
        Self {
            max_streams,
            check_interval: CHECK_IDLE_INTERVAL,
            idle_timeout: SESSION_IDLE_TIMEOUT,
        }
    }

    pub(crate) fn yamux_config(&self) -> tokio_yamux::Config {
        tokio_yamux::Config {
            enable_keepalive: true,
            keepalive_interval: self.check_interval,
            connection_write_timeout: self.idle_timeout,
            ..tokio_yamux::Config::default()
        }
    }
}
