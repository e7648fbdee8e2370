pub mod app;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod mux;
pub mod net;
pub mod plugin;
pub mod relay;
pub mod resolver;
pub mod transport;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    cli: config::ConfigLayer,
) -> anyhow::Result<()> {
    app::run(config_path, cli).await
}
