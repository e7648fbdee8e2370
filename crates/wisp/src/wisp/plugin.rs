//! Shadowsocks SIP003 plugin environment.
//!
//! When launched by a shadowsocks client, the local/remote endpoints arrive in
//! `SS_LOCAL_*`/`SS_REMOTE_*` and the plugin options in `SS_PLUGIN_OPTIONS`,
//! e.g. `mux;mux-max-stream=8;server-name=example.com`.

use crate::wisp::{
    config::{ConfigLayer, parse_duration},
    error::ConfigError,
};

pub fn from_env() -> Result<Option<ConfigLayer>, ConfigError> {
    from_vars(|k| std::env::var(k).ok())
}

/// Build a layer from SIP003 variables looked up through `var`. Returns `None`
/// when no SIP003 variable is present.
pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Option<ConfigLayer>, ConfigError> {
    let local_host = var("SS_LOCAL_HOST");
    let local_port = var("SS_LOCAL_PORT");
    let remote_host = var("SS_REMOTE_HOST");
    let remote_port = var("SS_REMOTE_PORT");
    let options = var("SS_PLUGIN_OPTIONS");

    if [&local_host, &local_port, &remote_host, &remote_port, &options]
        .iter()
        .all(|v| v.is_none())
    {
        return Ok(None);
    }

    let mut layer = ConfigLayer {
        bind_addr: join_host_port(local_host, local_port),
        remote_addr: join_host_port(remote_host, remote_port),
        ..Default::default()
    };
    if let Some(opts) = options {
        for (key, value) in parse_options(&opts) {
            apply_option(&mut layer, &key, value)?;
        }
    }
    Ok(Some(layer))
}

fn join_host_port(host: Option<String>, port: Option<String>) -> Option<String> {
    let host = host?;
    let port = port?;
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        Some(format!("[{host}]:{}", port.trim()))
    } else {
        Some(format!("{host}:{}", port.trim()))
    }
}

/// Split `k=v;flag;k2=v\;2` into entries. `\` escapes the next character.
pub fn parse_options(s: &str) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();
    let mut key = String::new();
    let mut value: Option<String> = None;
    let mut chars = s.chars();

    let mut flush = |key: &mut String, value: &mut Option<String>| {
        let k = key.trim();
        if !k.is_empty() {
            out.push((k.to_string(), value.take()));
        }
        key.clear();
        *value = None;
    };

    while let Some(c) = chars.next() {
        let c = match c {
            '\\' => chars.next().unwrap_or('\\'),
            ';' => {
                flush(&mut key, &mut value);
                continue;
            }
            '=' if value.is_none() => {
                value = Some(String::new());
                continue;
            }
            c => c,
        };
        match value.as_mut() {
            Some(v) => v.push(c),
            None => key.push(c),
        }
    }
    flush(&mut key, &mut value);
    out
}

fn apply_option(layer: &mut ConfigLayer, key: &str, value: Option<String>) -> Result<(), ConfigError> {
    let bad = |reason: &str| ConfigError::PluginOption {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let flag = |value: Option<String>| -> Result<bool, ConfigError> {
        match value.as_deref().map(str::trim) {
            None | Some("") | Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(_) => Err(bad("expected a boolean")),
        }
    };
    let text = |value: Option<String>| -> Result<String, ConfigError> {
        value.ok_or_else(|| bad("expected a value"))
    };

    match key {
        "server-name" => layer.server_name = Some(text(value)?),
        "ws" => layer.ws = Some(flag(value)?),
        "path" => layer.path = Some(text(value)?),
        "mux" => layer.mux = Some(flag(value)?),
        "mux-max-stream" => {
            let n = text(value)?
                .trim()
                .parse()
                .map_err(|_| bad("expected a number"))?;
            layer.mux_max_stream = Some(n);
        }
        "timeout" => {
            let d = parse_duration(&text(value)?).map_err(|e| bad(&e))?;
            layer.timeout = Some(d);
        }
        "skip-verify" => layer.skip_verify = Some(flag(value)?),
        "fallback-dns" => layer.fallback_dns = Some(text(value)?),
        "fast-open" => layer.fast_open = Some(flag(value)?),
        "vpn" | "__android_vpn" => layer.vpn = Some(flag(value)?),
        "verbose" => layer.verbose = Some(flag(value)?),
        _ => return Err(bad("unknown option")),
    }
    Ok(())
}
