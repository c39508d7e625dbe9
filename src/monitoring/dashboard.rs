use crate::adaptation::AdaptiveController;
use crate::admission::AdmissionControl;
use crate::audit::MemoryAuditSink;
use crate::quality::QualityAggregator;
use crate::quality::QualitySampler;
use crate::room::RoomRegistry;
use crate::signaling::ConnectionRegistry;
use log::info;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use warp::Filter;

#[derive(Clone)]
pub struct StatusContext {
    pub rooms: Arc<RoomRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub sampler: Arc<QualitySampler>,
    pub aggregator: Arc<QualityAggregator>,
    pub controller: Arc<AdaptiveController>,
    pub admission: Arc<AdmissionControl>,
    pub audit: Arc<MemoryAuditSink>,
}

#[derive(Serialize)]
struct RoomStatus {
    room_id: String,
    viewer_count: usize,
}

#[derive(Serialize)]
struct RoomsResponse {
    room_count: usize,
    connection_count: usize,
    rooms: Vec<RoomStatus>,
}

#[derive(Deserialize)]
struct BlockRequest {
    ip: IpAddr,
    duration_minutes: i64,
    reason: String,
}

#[derive(Deserialize)]
struct UnblockRequest {
    ip: IpAddr,
}

#[derive(Deserialize)]
struct EnableRequest {
    enabled: bool,
}

/// Thin read/administer surface over the core components. No protocol
/// logic lives here; every route is a synchronous call into a component.
pub async fn run_status_server(ctx: StatusContext, port: u16) {
    let rooms = warp::path!("status" / "rooms")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_rooms);

    let quality = warp::path!("status" / "quality")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_quality);

    let adaptation = warp::path!("status" / "adaptation")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_adaptation);

    let block = warp::path!("admin" / "block")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_block);

    let unblock = warp::path!("admin" / "unblock")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_unblock);

    let blocks = warp::path!("admin" / "blocks")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_blocks);

    let audit = warp::path!("admin" / "audit")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_audit);

    let force = warp::path!("admin" / "adaptation" / "force")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_force);

    let enable = warp::path!("admin" / "adaptation" / "enabled")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_enable);

    let routes = rooms
        .or(quality)
        .or(adaptation)
        .or(block)
        .or(unblock)
        .or(blocks)
        .or(audit)
        .or(force)
        .or(enable);

    info!("Status server listening on port {}", port);
    warp::serve(routes).run(([0, 0, 0, 0], port)).await;
}

fn with_ctx(
    ctx: StatusContext,
) -> impl Filter<Extract = (StatusContext,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

async fn handle_rooms(ctx: StatusContext) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    let rooms = ctx
        .rooms
        .snapshot()
        .await
        .into_iter()
        .map(|(room_id, viewer_count)| RoomStatus {
            room_id,
            viewer_count,
        })
        .collect::<Vec<_>>();
    Ok(warp::reply::json(&RoomsResponse {
        room_count: rooms.len(),
        connection_count: ctx.connections.count().await,
        rooms,
    }))
}

async fn handle_quality(
    ctx: StatusContext,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    let summary = ctx.aggregator.summarize().await;
    let connections = ctx.sampler.reports().await;
    Ok(warp::reply::json(&serde_json::json!({
        "summary": summary,
        "connections": connections,
    })))
}

async fn handle_adaptation(
    ctx: StatusContext,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    Ok(warp::reply::json(&ctx.controller.status()))
}

async fn handle_block(
    req: BlockRequest,
    ctx: StatusContext,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    ctx.admission
        .block_ip(req.ip, req.duration_minutes, &req.reason)
        .await;
    Ok(warp::reply::json(&serde_json::json!({ "blocked": req.ip })))
}

async fn handle_unblock(
    req: UnblockRequest,
    ctx: StatusContext,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    ctx.admission.unblock_ip(req.ip).await;
    Ok(warp::reply::json(&serde_json::json!({ "unblocked": req.ip })))
}

async fn handle_blocks(
    ctx: StatusContext,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    Ok(warp::reply::json(&ctx.admission.list_blocks().await))
}

async fn handle_audit(ctx: StatusContext) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    Ok(warp::reply::json(&ctx.audit.recent(200).await))
}

async fn handle_force(ctx: StatusContext) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    let applied = ctx.controller.force_adaptation().await.unwrap_or(false);
    Ok(warp::reply::json(&serde_json::json!({ "applied": applied })))
}

async fn handle_enable(
    req: EnableRequest,
    ctx: StatusContext,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    ctx.controller.set_enabled(req.enabled);
    Ok(warp::reply::json(&ctx.controller.status()))
}
