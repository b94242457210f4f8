//! Serves the local chain archive to node-to-node peers.
//!
//! Opens (or creates) the chunk archive under the given data directory,
//! binds the listen address and answers handshake, chain-sync and
//! block-fetch traffic until interrupted.
//!
//! For usage please refer to the program help: `node-api --help`

use std::sync::Arc;

use color_eyre::eyre::Result;
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use grevy_chain::{ChunkArchive, NetworkParameters};
use grevy_network::{Config, Server};

mod args;

use args::Args;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();
    let args = Args::from_args();

    let params = NetworkParameters::default();
    let archive = Arc::new(ChunkArchive::open(&args.data_dir, params)?);
    let config = Config {
        listen_addr: format!("{}:{}", args.ip, args.port),
        ..Config::default()
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let server = Server::make_default(config, archive, params)?;
        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.shutdown();
            }
        });
        server.run().await?;
        Ok::<(), color_eyre::eyre::Report>(())
    })?;

    info!("clean shutdown");
    Ok(())
}
