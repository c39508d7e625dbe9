use anyhow::Result;
use screencast_server::adaptation::{AdaptiveController, PresenterReconfigurer};
use screencast_server::admission::{AdmissionControl, MemoryBlockStore};
use screencast_server::audit::MemoryAuditSink;
use screencast_server::auth::AllowAllAuthenticator;
use screencast_server::config::ServerConfig;
use screencast_server::monitoring::{run_status_server, StatusContext};
use screencast_server::quality::{QualityAggregator, QualitySampler};
use screencast_server::relay::RelayEngine;
use screencast_server::room::RoomRegistry;
use screencast_server::signaling::connection::ConnectionRegistry;
use screencast_server::signaling::{MessageHandler, SignalingServer};
use log::info;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let matches = clap::App::new("screencast-server")
        .about("Relays one presenter's live stream to many viewers")
        .arg(
            clap::Arg::new("ws-port")
                .long("ws-port")
                .takes_value(true)
                .help("Session WebSocket port (overrides WS_PORT)"),
        )
        .arg(
            clap::Arg::new("status-port")
                .long("status-port")
                .takes_value(true)
                .help("Status/admin HTTP port (overrides STATUS_PORT)"),
        )
        .get_matches();

    let mut config = ServerConfig::from_env();
    if let Some(port) = matches.value_of("ws-port").and_then(|v| v.parse().ok()) {
        config.ws_port = port;
    }
    if let Some(port) = matches.value_of("status-port").and_then(|v| v.parse().ok()) {
        config.status_port = port;
    }

    let audit = MemoryAuditSink::new(4096);
    let connections = ConnectionRegistry::new();
    let rooms = RoomRegistry::new(config.max_viewers_per_room, audit.clone());
    let relay = RelayEngine::new(rooms.clone(), config.max_frame_size);
    let sampler = QualitySampler::new(config.quality.clone());
    let aggregator = QualityAggregator::new(sampler.clone(), config.adaptation.clone());
    let admission = Arc::new(AdmissionControl::new(
        &config.admission,
        MemoryBlockStore::new(),
        audit.clone(),
    ));
    let producer = PresenterReconfigurer::new(connections.clone());
    let controller = AdaptiveController::new(config.adaptation.clone(), aggregator.clone(), producer);

    tokio::spawn(controller.clone().run());

    let status_ctx = StatusContext {
        rooms: rooms.clone(),
        connections: connections.clone(),
        sampler: sampler.clone(),
        aggregator,
        controller,
        admission: admission.clone(),
        audit,
    };
    let status_port = config.status_port;
    tokio::spawn(run_status_server(status_ctx, status_port));

    let handler = MessageHandler::new(
        connections,
        rooms,
        relay,
        sampler,
        admission,
        Arc::new(AllowAllAuthenticator),
    );
    let server = SignalingServer::bind(handler, config).await?;
    info!("Server ready");
    server.run().await?;
    Ok(())
}
