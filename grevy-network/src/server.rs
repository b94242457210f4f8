//! The server driver: accepts connections and serves the default
//! mini-protocol handler set from a local chain archive.

use std::sync::Arc;

use thiserror::Error;
use tokio::{
    net::{lookup_host, TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
    time::sleep,
};
use tracing::{debug, info, warn};

use grevy_chain::{ChunkRegistry, NetworkParameters};

use crate::{
    config::Config,
    constants::{ACCEPT_RETRY_DELAY, MIN_COMPRESSION_VERSION},
    multiplexer::{Multiplexer, MultiplexerConfig, MultiplexerError},
    protocol::{
        block_fetch::{BlockFetchConfig, BlockFetchHandler},
        chain_sync::ChainSyncHandler,
        handshake::{HandshakeHandler, VersionData, VersionMap, VersionTable},
        segment::{ChannelMode, MiniProtocol},
    },
    transport::TcpTransport,
};

/// An error starting or running the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listen address did not resolve to anything usable.
    #[error("dns resolution for {0} returned no results")]
    Resolve(String),

    /// The listen address could not be bound.
    #[error("failed to bind the listen address: {0}")]
    Bind(std::io::Error),

    /// An underlying IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration cannot produce a working handler set.
    #[error("invalid server configuration: {0}")]
    Config(String),
}

/// Requests a graceful server shutdown.
///
/// Every connection task observes the request at its next suspension point;
/// `run` returns once all of them have drained.
#[derive(Clone)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    /// Asks the server to stop accepting and drain its connections.
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// A node-to-node server bound to one listen address.
pub struct Server {
    listen_addr: String,
    mux_config: Arc<MultiplexerConfig>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Builds a server with the default handler set {handshake, chain-sync,
    /// block-fetch} serving from `registry`.
    ///
    /// Peers that negotiate a version with compressed batches get them when
    /// `config.block_compression` allows.
    pub fn make_default(
        config: Config,
        registry: Arc<dyn ChunkRegistry>,
        params: NetworkParameters,
    ) -> Result<Self, ServerError> {
        let offered: VersionMap = config
            .version_range()
            .map(|version| {
                (
                    version,
                    VersionData {
                        network_magic: params.magic,
                        initiator_only_diffusion: false,
                        peer_sharing: 0,
                        query: false,
                    },
                )
            })
            .collect();
        let table = VersionTable::new(offered, config.version_max)
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let chain_sync_registry = registry.clone();
        let block_fetch_registry = registry;
        let block_compression = config.block_compression;

        let mux_config = MultiplexerConfig::new()
            .with_handler(
                MiniProtocol::Handshake,
                Box::new(move |_res| Box::new(HandshakeHandler::new(table.clone()))),
            )
            .with_handler(
                MiniProtocol::ChainSync,
                Box::new(move |_res| {
                    Box::new(ChainSyncHandler::new(chain_sync_registry.clone(), params))
                }),
            )
            .with_handler(
                MiniProtocol::BlockFetch,
                Box::new(move |res| {
                    Box::new(BlockFetchHandler::new(
                        block_fetch_registry.clone(),
                        BlockFetchConfig {
                            block_compression: block_compression
                                && res.version >= MIN_COMPRESSION_VERSION,
                        },
                    ))
                }),
            );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Server {
            listen_addr: config.listen_addr,
            mux_config: Arc::new(mux_config),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// A handle that can stop this server from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Binds the listen address and serves until shutdown.
    ///
    /// Pending connection tasks are drained before returning.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = lookup_host(self.listen_addr.as_str())
            .await?
            .next()
            .ok_or_else(|| ServerError::Resolve(self.listen_addr.clone()))?;
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        info!(%addr, "listening for node-to-node connections");

        let mut connections = JoinSet::new();
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let mux_config = self.mux_config.clone();
                        let mut conn_shutdown = self.shutdown_rx.clone();
                        connections.spawn(async move {
                            match handle_connection(stream, mux_config, &mut conn_shutdown).await {
                                Ok(()) => debug!(%peer, "connection finished"),
                                Err(e) => debug!(%peer, error = %e, "connection ended"),
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }

        debug!("draining connection tasks");
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

/// Drives one connection's multiplexer until it leaves the active state.
///
/// Responses are drained before the next request is read, which is the
/// engine's backpressure: a peer cannot queue a second request while a batch
/// is still streaming out.
async fn handle_connection(
    stream: TcpStream,
    config: Arc<MultiplexerConfig>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), MultiplexerError> {
    let transport = Box::new(TcpTransport::new(stream));
    let mut mux = Multiplexer::new(transport, config, ChannelMode::Responder)?;

    let outcome = drive_connection(&mut mux, shutdown).await;
    mux.close().await;
    outcome
}

async fn drive_connection(
    mux: &mut Multiplexer,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), MultiplexerError> {
    while mux.alive() {
        if mux.available_egress() {
            mux.process_egress().await?;
            continue;
        }
        tokio::select! {
            _ = shutdown.changed() => {
                mux.stop();
                break;
            }
            ready = mux.wait_ingress() => {
                ready?;
                mux.process_ingress().await?;
            }
        }
    }
    Ok(())
}
