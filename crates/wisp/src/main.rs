mod wisp;

use std::time::Duration;

use clap::Parser;

use crate::wisp::config::{ConfigLayer, LogLayer, parse_duration};

#[derive(Debug, Parser)]
#[command(
    name = "wisp",
    version,
    about = "wisp - TLS/WebSocket tunnel client with stream multiplexing (SIP003 compatible)"
)]
struct Cli {
    /// Path to a config file (.toml/.yaml/.yml). Command-line flags and the
    /// SIP003 environment override its values.
    #[arg(long, env = "WISP_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Local listen address, e.g. 127.0.0.1:1080 or :1080.
    #[arg(short = 'b', long, env = "WISP_BIND_ADDR")]
    bind_addr: Option<String>,

    /// Remote server address (host:port).
    #[arg(short = 'r', long, env = "WISP_REMOTE_ADDR")]
    remote_addr: Option<String>,

    /// TLS server name; defaults to the remote host.
    #[arg(short = 'n', long, env = "WISP_SERVER_NAME")]
    server_name: Option<String>,

    /// Do not verify the server certificate.
    #[arg(long, env = "WISP_SKIP_VERIFY")]
    skip_verify: bool,

    /// Upgrade to WebSocket after the TLS handshake.
    #[arg(long, env = "WISP_WS")]
    ws: bool,

    /// WebSocket path.
    #[arg(long, env = "WISP_PATH")]
    path: Option<String>,

    /// Multiplex local connections over shared transport connections.
    #[arg(long, env = "WISP_MUX")]
    mux: bool,

    /// Maximum streams per multiplexed connection (1-16).
    #[arg(long, env = "WISP_MUX_MAX_STREAM")]
    mux_max_stream: Option<usize>,

    /// Idle timeout per tunneled connection, e.g. 300, 90s or 5m.
    #[arg(long, env = "WISP_TIMEOUT", value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// DNS server (IP or IP:port) queried over TCP instead of the system resolver.
    #[arg(long, env = "WISP_FALLBACK_DNS")]
    fallback_dns: Option<String>,

    /// Enable TCP fast open.
    #[arg(long, env = "WISP_FAST_OPEN")]
    fast_open: bool,

    /// Hand outbound sockets to the host VPN service before connecting.
    #[arg(long, env = "WISP_VPN")]
    vpn: bool,

    /// Debug logging.
    #[arg(short = 'v', long, env = "WISP_VERBOSE")]
    verbose: bool,

    /// Log format: text | json.
    #[arg(long, env = "WISP_LOG_FORMAT")]
    log_format: Option<String>,

    /// Log output: stderr | stdout | discard | <file path>.
    #[arg(long, env = "WISP_LOG_OUTPUT")]
    log_output: Option<String>,
}

impl Cli {
    fn into_layer(self) -> (Option<std::path::PathBuf>, ConfigLayer) {
        let log = (self.log_format.is_some() || self.log_output.is_some()).then(|| LogLayer {
            format: self.log_format,
            output: self.log_output,
            ..Default::default()
        });
        let layer = ConfigLayer {
            bind_addr: self.bind_addr,
            remote_addr: self.remote_addr,
            server_name: self.server_name,
            skip_verify: self.skip_verify.then_some(true),
            ws: self.ws.then_some(true),
            path: self.path,
            mux: self.mux.then_some(true),
            mux_max_stream: self.mux_max_stream,
            timeout: self.timeout,
            fallback_dns: self.fallback_dns,
            fast_open: self.fast_open.then_some(true),
            vpn: self.vpn.then_some(true),
            verbose: self.verbose.then_some(true),
            log,
        };
        (self.config, layer)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, layer) = Cli::parse().into_layer();
    wisp::run(config, layer).await
}
