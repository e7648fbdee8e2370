use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use rustls::pki_types::ServerName;
use tokio::{net::TcpStream, sync::watch};

use crate::wisp::{
    config::ClientConfig,
    error::{ConfigError, ForwardError, ListenerError},
    mux::{MAX_STREAMS_LIMIT, MuxOptions, pool::SessionPool},
    net::{self, ConnectHook, SocketTuning},
    relay::{RelayStats, relay},
    resolver::{Resolver, SystemResolver, TcpDnsResolver},
    transport::{Dialer, TransportDialer, WsOptions, tcp::TcpConnector, tls, ws},
};

/// Bound on every raw dial and every TLS/WebSocket handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const LISTEN_BACKLOG: u32 = 1024;
const DEFAULT_DNS_PORT: u16 = 53;

/// Configuration after validation.
#[derive(Debug, Clone)]
struct Validated {
    bind_addr: SocketAddr,
    remote_host: String,
    remote_port: u16,
    server_name: String,
    sni: ServerName<'static>,
    ws_path: String,
    fallback_dns: Option<SocketAddr>,
}

fn validate(cfg: &ClientConfig) -> Result<Validated, ConfigError> {
    let bind = cfg.bind_addr.trim();
    if bind.is_empty() {
        return Err(ConfigError::MissingBindAddr);
    }
    let remote = cfg.remote_addr.trim();
    if remote.is_empty() {
        return Err(ConfigError::MissingRemoteAddr);
    }

    let bind_addr = net::normalize_bind_addr(bind)
        .parse::<SocketAddr>()
        .map_err(|e| ConfigError::InvalidAddr {
            field: "bind address",
            value: bind.to_string(),
            reason: e.to_string(),
        })?;

    let (remote_host, remote_port) =
        net::split_host_port(remote).ok_or_else(|| ConfigError::InvalidAddr {
            field: "remote address",
            value: remote.to_string(),
            reason: "expected host:port".into(),
        })?;

    if cfg.timeout.is_zero() {
        return Err(ConfigError::InvalidTimeout(cfg.timeout));
    }

    if !(1..=MAX_STREAMS_LIMIT).contains(&cfg.mux_max_stream) {
        return Err(ConfigError::MuxMaxStreamOutOfRange {
            got: cfg.mux_max_stream,
            max: MAX_STREAMS_LIMIT,
        });
    }

    let server_name = match cfg.server_name.trim() {
        "" => remote_host.to_string(),
        name => name.to_string(),
    };
    let sni = tls::server_name(&server_name)
        .map_err(|_| ConfigError::InvalidServerName(server_name.clone()))?;

    let fallback_dns = match cfg.fallback_dns.trim() {
        "" => None,
        s => Some(parse_dns_server(s).ok_or_else(|| ConfigError::InvalidFallbackDns(s.into()))?),
    };

    let ws_path = match cfg.ws_path.trim() {
        "" => "/".to_string(),
        p if p.starts_with('/') => p.to_string(),
        p => format!("/{p}"),
    };

    Ok(Validated {
        bind_addr,
        remote_host: remote_host.to_string(),
        remote_port,
        server_name,
        sni,
        ws_path,
        fallback_dns,
    })
}

fn parse_dns_server(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    let ip = s.trim_start_matches('[').trim_end_matches(']');
    ip.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT))
}

/// Per-connection work shared by every forwarding task.
#[derive(Clone)]
struct Forwarder {
    dialer: Arc<dyn Dialer>,
    pool: Option<Arc<SessionPool>>,
    timeout: Duration,
}

impl Forwarder {
    async fn forward(&self, conn: TcpStream) -> Result<RelayStats, ForwardError> {
        let stats = match &self.pool {
            Some(pool) => {
                let st = pool.acquire_stream().await?;
                relay(conn, st, self.timeout).await?
            }
            None => {
                let remote = self.dialer.dial_server().await?;
                relay(conn, remote, self.timeout).await?
            }
        };
        Ok(stats)
    }
}

struct ListenerSlot {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

/// Local tunnel endpoint: accepts plaintext TCP and forwards every connection
/// to the remote server.
pub struct Client {
    cfg: ClientConfig,
    validated: Validated,
    hook: Arc<dyn ConnectHook>,
    forwarder: Forwarder,
    listener: tokio::sync::Mutex<Option<ListenerSlot>>,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Result<Self, ConfigError> {
        let validated = validate(&cfg)?;
        let hook: Arc<dyn ConnectHook> = Arc::new(SocketTuning {
            fast_open: cfg.fast_open,
            vpn_mode: cfg.vpn_mode,
        });

        let resolver: Arc<dyn Resolver> = match validated.fallback_dns {
            Some(server) => Arc::new(TcpDnsResolver::new(server, hook.clone())),
            None => Arc::new(SystemResolver),
        };
        let raw = TcpConnector::new(
            validated.remote_host.clone(),
            validated.remote_port,
            resolver,
            hook.clone(),
            HANDSHAKE_TIMEOUT,
        );

        let ws = cfg.ws.then(|| {
            let host = if validated.server_name.contains(':') {
                format!("[{}]", validated.server_name)
            } else {
                validated.server_name.clone()
            };
            WsOptions {
                url: format!("wss://{host}{}", validated.ws_path),
                subprotocol: ws::subprotocol(cfg.mux),
            }
        });

        let dialer = TransportDialer::new(
            Arc::new(raw),
            tls::client_config(cfg.skip_verify)?,
            validated.sni.clone(),
            ws,
            HANDSHAKE_TIMEOUT,
        );

        Ok(Self::build(cfg, validated, hook, Arc::new(dialer)))
    }

    /// Like [`Client::new`] but with a caller-supplied dialer.
    pub fn with_dialer(cfg: ClientConfig, dialer: Arc<dyn Dialer>) -> Result<Self, ConfigError> {
        let validated = validate(&cfg)?;
        let hook = Arc::new(SocketTuning {
            fast_open: cfg.fast_open,
            vpn_mode: cfg.vpn_mode,
        });
        Ok(Self::build(cfg, validated, hook, dialer))
    }

    fn build(
        cfg: ClientConfig,
        validated: Validated,
        hook: Arc<dyn ConnectHook>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let pool = cfg
            .mux
            .then(|| Arc::new(SessionPool::new(dialer.clone(), MuxOptions::new(cfg.mux_max_stream))));
        let forwarder = Forwarder {
            dialer,
            pool,
            timeout: cfg.timeout,
        };
        Self {
            cfg,
            validated,
            hook,
            forwarder,
            listener: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    /// SNI sent to the remote server; derived from the remote host if unset.
    pub fn server_name(&self) -> &str {
        &self.validated.server_name
    }

    /// Address the listener is bound to while serving.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|s| s.addr)
    }

    fn bind(&self) -> Result<tokio::net::TcpListener, ListenerError> {
        let addr = self.validated.bind_addr;
        let bind_err = |source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        };
        let socket = net::new_socket_for(addr.ip()).map_err(bind_err)?;
        self.hook.before_listen(&socket).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_err)
    }

    /// Serve until the listener fails or [`Client::close`] is called.
    ///
    /// Always ends in an error; after `close` it is [`ListenerError::Closed`].
    /// Forwarding tasks already running are left to finish on their own.
    pub async fn start(&self) -> ListenerError {
        let (tx, mut shutdown) = watch::channel(false);
        let (ln, addr) = {
            // Checked and filled under one guard, with the bind in between.
            let mut slot = self.listener.lock().await;
            if let Some(cur) = slot.as_ref() {
                return ListenerError::AlreadyStarted(cur.addr);
            }
            let ln = match self.bind() {
                Ok(ln) => ln,
                Err(err) => return err,
            };
            let addr = match ln.local_addr() {
                Ok(addr) => addr,
                Err(e) => return ListenerError::Accept(e),
            };
            *slot = Some(ListenerSlot { addr, shutdown: tx });
            (ln, addr)
        };

        tracing::info!(
            listen_addr = %addr,
            remote_addr = %self.cfg.remote_addr,
            server_name = %self.validated.server_name,
            ws = self.cfg.ws,
            mux = self.cfg.mux,
            "client: listening"
        );

        let err = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break ListenerError::Closed;
                    }
                }
                res = ln.accept() => match res {
                    Ok((conn, peer)) => self.spawn_forward(conn, peer),
                    Err(e) => break ListenerError::Accept(e),
                }
            }
        };

        if !matches!(err, ListenerError::Closed) {
            self.listener.lock().await.take();
        }
        err
    }

    fn spawn_forward(&self, conn: TcpStream, peer: SocketAddr) {
        if let Err(err) = conn.set_nodelay(true) {
            tracing::debug!(client = %peer, error = %err, "client: set_nodelay failed");
        }
        let fwd = self.forwarder.clone();
        tokio::spawn(async move {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(client = %peer, "client: accepted");
            }
            match fwd.forward(conn).await {
                Ok(stats) => tracing::debug!(
                    client = %peer,
                    uploaded = stats.uploaded,
                    downloaded = stats.downloaded,
                    "client: tunnel closed"
                ),
                Err(ForwardError::Transport(err)) => {
                    tracing::warn!(client = %peer, error = %err, "client: connect to remote failed")
                }
                Err(ForwardError::Relay(err)) => {
                    tracing::debug!(client = %peer, error = %err, "client: tunnel ended")
                }
            }
        });
    }

    /// Stop accepting. A no-op when not serving.
    pub async fn close(&self) {
        if let Some(slot) = self.listener.lock().await.take() {
            let _ = slot.shutdown.send(true);
            tracing::info!(listen_addr = %slot.addr, "client: closed");
        }
    }
}
