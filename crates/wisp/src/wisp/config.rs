use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Deserializer};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MUX_MAX_STREAM: usize = 4;
pub const DEFAULT_WS_PATH: &str = "/";

/// Client settings as merged from every source. `Client::new` validates them.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub bind_addr: String,
    pub remote_addr: String,
    /// TLS SNI and WebSocket host. Derived from `remote_addr` when empty.
    pub server_name: String,
    pub skip_verify: bool,
    pub ws: bool,
    pub ws_path: String,
    pub mux: bool,
    pub mux_max_stream: usize,
    /// Per-connection idle timeout.
    pub timeout: Duration,
    /// `IP` or `IP:port` of a DNS server queried over TCP instead of the
    /// system resolver.
    pub fallback_dns: String,
    pub fast_open: bool,
    pub vpn_mode: bool,
    pub verbose: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: String::new(),
            remote_addr: String::new(),
            server_name: String::new(),
            skip_verify: false,
            ws: false,
            ws_path: DEFAULT_WS_PATH.to_string(),
            mux: false,
            mux_max_stream: DEFAULT_MUX_MAX_STREAM,
            timeout: DEFAULT_TIMEOUT,
            fallback_dns: String::new(),
            fast_open: false,
            vpn_mode: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

/// One partial source of settings. Unset fields defer to lower layers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ConfigLayer {
    pub bind_addr: Option<String>,
    pub remote_addr: Option<String>,
    pub server_name: Option<String>,
    pub skip_verify: Option<bool>,
    pub ws: Option<bool>,
    pub path: Option<String>,
    pub mux: Option<bool>,
    pub mux_max_stream: Option<usize>,
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub timeout: Option<Duration>,
    pub fallback_dns: Option<String>,
    pub fast_open: Option<bool>,
    pub vpn: Option<bool>,
    pub verbose: Option<bool>,
    pub log: Option<LogLayer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct LogLayer {
    pub level: Option<String>,
    pub format: Option<String>,
    pub output: Option<String>,
    pub add_source: Option<bool>,
}

impl LogLayer {
    fn overlay(self, top: LogLayer) -> LogLayer {
        LogLayer {
            level: top.level.or(self.level),
            format: top.format.or(self.format),
            output: top.output.or(self.output),
            add_source: top.add_source.or(self.add_source),
        }
    }
}

impl ConfigLayer {
    /// Merge `top` over `self`; fields set in `top` win.
    pub fn overlay(self, top: ConfigLayer) -> ConfigLayer {
        let log = match (self.log, top.log) {
            (Some(base), Some(top)) => Some(base.overlay(top)),
            (base, top) => top.or(base),
        };
        ConfigLayer {
            bind_addr: top.bind_addr.or(self.bind_addr),
            remote_addr: top.remote_addr.or(self.remote_addr),
            server_name: top.server_name.or(self.server_name),
            skip_verify: top.skip_verify.or(self.skip_verify),
            ws: top.ws.or(self.ws),
            path: top.path.or(self.path),
            mux: top.mux.or(self.mux),
            mux_max_stream: top.mux_max_stream.or(self.mux_max_stream),
            timeout: top.timeout.or(self.timeout),
            fallback_dns: top.fallback_dns.or(self.fallback_dns),
            fast_open: top.fast_open.or(self.fast_open),
            vpn: top.vpn.or(self.vpn),
            verbose: top.verbose.or(self.verbose),
            log,
        }
    }

    pub fn into_settings(self) -> Settings {
        let d = ClientConfig::default();
        let verbose = self.verbose.unwrap_or(d.verbose);
        let client = ClientConfig {
            bind_addr: self.bind_addr.unwrap_or(d.bind_addr).trim().to_string(),
            remote_addr: self.remote_addr.unwrap_or(d.remote_addr).trim().to_string(),
            server_name: self.server_name.unwrap_or(d.server_name).trim().to_string(),
            skip_verify: self.skip_verify.unwrap_or(d.skip_verify),
            ws: self.ws.unwrap_or(d.ws),
            ws_path: self.path.unwrap_or(d.ws_path),
            mux: self.mux.unwrap_or(d.mux),
            mux_max_stream: self.mux_max_stream.unwrap_or(d.mux_max_stream),
            timeout: self.timeout.unwrap_or(d.timeout),
            fallback_dns: self.fallback_dns.unwrap_or(d.fallback_dns).trim().to_string(),
            fast_open: self.fast_open.unwrap_or(d.fast_open),
            vpn_mode: self.vpn.unwrap_or(d.vpn_mode),
            verbose,
        };

        let l = self.log.unwrap_or_default();
        let dl = LoggingConfig::default();
        let level = match l.level {
            Some(level) => level.trim().to_ascii_lowercase(),
            None if verbose => "debug".into(),
            None => dl.level,
        };
        let logging = LoggingConfig {
            level,
            format: l.format.unwrap_or(dl.format).trim().to_ascii_lowercase(),
            output: l.output.unwrap_or(dl.output).trim().to_string(),
            add_source: l.add_source.unwrap_or(dl.add_source),
        };

        Settings { client, logging }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<ConfigLayer> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let layer: ConfigLayer = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };
    Ok(layer)
}

/// Parse `"90s"`, `"5m"`, `"1h 30m"` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn de_opt_duration<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(d)? {
        None => Ok(None),
        Some(Raw::Secs(n)) => Ok(Some(Duration::from_secs(n))),
        Some(Raw::Text(s)) => parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
