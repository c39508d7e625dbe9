use crate::config::ServerConfig;
use crate::relay::wire;
use crate::signaling::connection::ConnectionHandle;
use crate::signaling::handler::{now_millis, MessageHandler};
use crate::signaling::messages::{disconnect_reason, ControlMessage};
use crate::utils::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

pub struct SignalingServer {
    listener: TcpListener,
    handler: Arc<MessageHandler>,
    config: ServerConfig,
}

impl SignalingServer {
    /// Binds the session port. Accepting `port 0` keeps the server testable
    /// against an ephemeral port via `local_addr`.
    pub async fn bind(handler: Arc<MessageHandler>, config: ServerConfig) -> Result<Self> {
        let address = format!("0.0.0.0:{}", config.ws_port);
        let listener = TcpListener::bind(&address).await?;
        info!("Session server bound to {}", listener.local_addr()?);
        Ok(Self {
            listener,
            handler,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        while let Ok((stream, addr)) = self.listener.accept().await {
            debug!("New connection from {}", addr);
            let handler = self.handler.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, handler, config).await {
                    warn!("Connection from {} ended with error: {}", addr, e);
                }
            });
        }
        Ok(())
    }
}

/// Owns one connection's lifetime: a writer task draining the outbound
/// channel and the frame queue, a probe ticker, and this read loop. All
/// three end together and funnel into the single cleanup path.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<MessageHandler>,
    config: ServerConfig,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let conn = ConnectionHandle::new(
        Uuid::new_v4().to_string(),
        addr.ip(),
        out_tx,
        config.viewer_queue_capacity,
    );
    handler.connections.register(conn.clone()).await;
    handler.sampler.register(&conn.id).await;
    info!("Connection {} established from {}", conn.id, addr);

    // Writer: control messages and init segments first, then live frames.
    // The bias keeps bootstrap and error traffic ahead of the frame backlog.
    let writer_conn = conn.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = out_rx.recv() => match msg {
                    Some(Message::Close(frame)) => {
                        let _ = ws_sender.send(Message::Close(frame)).await;
                        break;
                    }
                    Some(msg) => {
                        if ws_sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                frame = writer_conn.frames.pop() => match frame {
                    Some(payload) => {
                        let encoded = wire::encode(&payload, false);
                        if ws_sender.send(Message::Binary(encoded)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    // Probe ticker: round-trips a timestamped token and charges silent
    // connections with missed probes instead of letting them coast.
    let probe_conn = conn.clone();
    let probe_sampler = handler.sampler.clone();
    let probe_interval = config.quality.probe_interval;
    let probe_timeout = config.quality.probe_timeout;
    let prober = tokio::spawn(async move {
        let mut interval = tokio::time::interval(probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the client has a
        // moment to finish its handshake.
        interval.tick().await;
        loop {
            interval.tick().await;
            if probe_conn.since_last_pong() > probe_timeout {
                probe_sampler.record_missed_probe(&probe_conn.id).await;
            }
            let ping = ControlMessage::Ping {
                client_timestamp: now_millis(),
            };
            if probe_conn.send_control(&ping).is_err() {
                break;
            }
        }
    });

    let result = read_loop(&mut ws_receiver, &conn, &handler).await;

    prober.abort();
    handler.handle_disconnect(&conn).await;
    // handle_disconnect closed the frame queue; the writer drains and exits.
    let _ = writer.await;
    info!("Connection {} closed", conn.id);
    result
}

async fn read_loop(
    ws_receiver: &mut (impl futures_util::Stream<
        Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>,
    > + Unpin),
    conn: &Arc<ConnectionHandle>,
    handler: &Arc<MessageHandler>,
) -> Result<()> {
    while let Some(msg) = ws_receiver.next().await {
        let msg = msg?;
        let outcome = match msg {
            Message::Text(text) => match serde_json::from_str::<ControlMessage>(&text) {
                Ok(message) => handler.handle_message(conn, message).await,
                // Undecodable control traffic is a transport-level failure.
                Err(e) => Err(Error::Json(e)),
            },
            Message::Binary(data) => handler.handle_frame(conn, data).await,
            Message::Close(_) => break,
            // Transport-level ping/pong is answered by tungstenite itself.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(()),
        };
        if let Err(e) = outcome {
            handler.report_error(conn, &e).await;
            if e.is_fatal() {
                error!("Fatal error on connection {}: {}", conn.id, e);
                conn.close(disconnect_reason::PROTOCOL_ERROR);
                return Err(e);
            }
        }
    }
    Ok(())
}
