//! line-relay: a newline-delimited text broadcast relay
//!
//! Every line a client sends is relayed to all connected clients as
//! `<identity> says: <text>`.
//!
//! Features:
//! - TCP or Unix socket listener
//! - Bounded per-client outbound queues with a selectable overflow policy
//! - Dead clients removed from the registry as soon as they fail
//! - Fixed, peer-address, or sequential client identities
//! - Interactive client mode (`connect`)
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod error;
mod relay;
mod server;

use config::{Config, Mode};
use server::Server;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let (mode, config) = Config::load()?;

    // Initialize logging. Stdout belongs to the chat in client mode.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers.max(1));
    }
    let runtime = builder.enable_all().build()?;

    match mode {
        Mode::Serve => runtime.block_on(serve(config)),
        Mode::Connect(endpoint) => {
            runtime.block_on(client::run(&endpoint, config.session.max_line_length))?;
            Ok(())
        }
    }
}

/// Run the relay server until ctrl-c.
async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        max_clients = config.max_clients,
        outbound_capacity = config.session.outbound_capacity,
        overflow = ?config.session.overflow,
        identity = ?config.relay.identity,
        echo_to_sender = config.relay.echo_to_sender,
        "Starting line-relay server"
    );

    let shutdown = CancellationToken::new();
    let server = Server::bind(&config, shutdown.clone())?;
    info!(address = %server.local_endpoint(), "Server listening");

    let signal = shutdown.clone();
    let dispatcher = server.dispatcher();
    tokio::spawn(async move {
        tokio::select! {
            _ = signal.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => {
                        let members = dispatcher.members().await.unwrap_or_default();
                        for member in &members {
                            debug!(conn = %member.id, identity = %member.identity, "Closing session");
                        }
                        info!(sessions = members.len(), "Shutdown requested");
                    }
                    Err(e) => warn!(error = %e, "Cannot listen for ctrl-c, shutting down"),
                }
                signal.cancel();
            }
        }
    });

    server.run().await?;
    Ok(())
}
