//! herald-demo: runs a single Herald peer over the MQTT reference transport.
//!
//! Joins `--group` (in addition to the implicit `all` group every peer
//! belongs to via discovery), binds an echo listener on `--listen`, and
//! answers with whatever content it received until interrupted.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use herald_core::{HeraldConfig, HeraldHandle, MessageListener, MessageReceived};
use herald_mqtt::{MqttTransport, MqttTransportDirectory};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "herald-demo", about = "Runs a Herald peer over MQTT")]
struct Args {
    /// Stable identity for this peer.
    #[arg(long, env = "HERALD_NODE_UID")]
    node_uid: String,

    #[arg(long, env = "HERALD_NODE_NAME")]
    node_name: Option<String>,

    #[arg(long, env = "HERALD_PEER_NAME")]
    peer_name: Option<String>,

    #[arg(long, env = "HERALD_APPLICATION_ID", default_value = "herald")]
    application_id: String,

    #[arg(long, env = "HERALD_MQTT_HOST", default_value = "localhost")]
    mqtt_host: String,

    #[arg(long, env = "HERALD_MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long, env = "HERALD_MQTT_USERNAME")]
    mqtt_username: Option<String>,

    #[arg(long, env = "HERALD_MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Group to join, in addition to `all` (repeatable).
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Subject filter this demo listens on.
    #[arg(long, default_value = "demo/*")]
    listen: String,
}

struct EchoListener;

impl MessageListener for EchoListener {
    fn herald_message(&self, herald: &HeraldHandle, message: &MessageReceived) {
        tracing::info!(subject = %message.subject, sender = %message.sender, "received message");
        if message.reply_to.is_none() {
            if let Err(err) = herald.reply(message, message.content.clone(), None) {
                tracing::warn!(%err, "failed to echo reply");
            }
        }
    }
}

fn init_logging() {
    let json_logs = std::env::var("HERALD_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("herald_demo=info,herald_core=info,herald_mqtt=info"));
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let mut config = HeraldConfig::new(args.node_uid.clone()).from_env();
    config.node_name = args.node_name.unwrap_or(config.node_name);
    config.peer_name = args.peer_name.unwrap_or(config.peer_name);
    config.application_id = args.application_id;
    config.mqtt_host = args.mqtt_host;
    config.mqtt_port = args.mqtt_port;
    config.mqtt_username = args.mqtt_username;
    config.mqtt_password = args.mqtt_password;

    tracing::info!(uid = %config.node_uid, app = %config.application_id, "starting herald peer");

    let herald = HeraldHandle::new(&config);
    herald.local_peer().set_groups(args.groups);
    herald.register_transport_directory(Arc::new(MqttTransportDirectory::new()));

    let mut filters = HashSet::new();
    filters.insert(args.listen);
    herald.bind_listener(filters, Arc::new(EchoListener));

    let transport = MqttTransport::connect(&config, herald.local_peer(), herald.clone())?;
    herald.bind_transport(transport);

    tracing::info!("herald peer running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    herald.shutdown().await;
    Ok(())
}
