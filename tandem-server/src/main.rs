use clap::Parser;
use std::path::PathBuf;
use tandem_server::{Server, ServerConfig};

#[derive(Parser)]
#[command(
    name = "tandem-server",
    about = "Collaborative text editing server",
    version
)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    bind: Option<String>,

    /// Log filter such as `info` or `tandem_collab=debug`; defaults to RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(filter) = &cli.log_level {
        logger.parse_filters(filter);
    }
    logger.init();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    log::info!(
        "Starting with {:?} store and {:?} authentication",
        config.store.store_type,
        config.auth.auth_type
    );
    let server = Server::new(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }

    server.curator().close().await;
    log::info!("All documents flushed");
    Ok(())
}
