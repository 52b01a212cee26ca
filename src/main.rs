//! Runs a standalone node over TCP.
//!
//! Usage: `kadmesh [config.toml]`. Without a file the defaults apply and a fresh key is
//! generated.

use std::{env, error::Error, sync::Arc};

use kadmesh::{
    config::LogFormat, peer::auth::node_id_of, Message, MessageHandler, NetCore, NetworkConfig,
    NetworkError, NodeId, TcpTransport,
};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

// Logs whatever the network delivers.
struct LogHandler;

impl MessageHandler for LogHandler {
    fn handle(&self, from: NodeId, msg: Message) -> Result<(), NetworkError> {
        info!(peer = %from, code = msg.code, len = msg.body.len(), "consensus message");
        Ok(())
    }

    fn publish(&self, topic: &'static str, from: NodeId, msg: Message) {
        info!(peer = %from, topic, len = msg.body.len(), "chain message");
    }
}

fn init_tracing(config: &NetworkConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Plain => fmt().with_env_filter(filter).init(),
        LogFormat::Json => fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = match env::args().nth(1) {
        Some(path) => NetworkConfig::from_toml_file(path)?,
        None => NetworkConfig::default(),
    };
    init_tracing(&config);

    let key = config.signing_key()?;
    let id = node_id_of(&key);
    let (transport, events) = TcpTransport::new(id.net_id());

    let net = NetCore::start(
        &config,
        key,
        Arc::new(transport),
        events,
        Arc::new(LogHandler),
    )?;
    info!(id = %net.local_id(), addr = %net.local_addr(), "node running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    net.shutdown();

    Ok(())
}
