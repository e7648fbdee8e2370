use std::path::PathBuf;

use anyhow::Context;

use crate::wisp::{
    client::Client,
    config::{self, ConfigLayer},
    logging, plugin,
};

/// Merge config file < SIP003 environment < command line.
pub fn resolve_settings(
    config_path: Option<PathBuf>,
    cli: ConfigLayer,
) -> anyhow::Result<config::Settings> {
    let mut layer = match &config_path {
        Some(p) => config::load_config(p).with_context(|| format!("load config: {}", p.display()))?,
        None => ConfigLayer::default(),
    };
    if let Some(env) = plugin::from_env().context("read SIP003 plugin environment")? {
        layer = layer.overlay(env);
    }
    Ok(layer.overlay(cli).into_settings())
}

pub async fn run(config_path: Option<PathBuf>, cli: ConfigLayer) -> anyhow::Result<()> {
    let settings = resolve_settings(config_path, cli)?;

    let logrt = logging::init(&settings.logging)?;
    let _logrt_guard = logrt; // keep alive

    let client = Client::new(settings.client).context("build client")?;
    let cfg = client.config();
    tracing::info!(
        bind_addr = %cfg.bind_addr,
        remote_addr = %cfg.remote_addr,
        server_name = %client.server_name(),
        ws = cfg.ws,
        mux = cfg.mux,
        mux_max_stream = cfg.mux_max_stream,
        timeout = %humantime::format_duration(cfg.timeout),
        fallback_dns = %cfg.fallback_dns,
        "wisp: starting"
    );

    tokio::select! {
        err = client.start() => {
            return Err(err).context("listener failed");
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
    }

    client.close().await;
    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
