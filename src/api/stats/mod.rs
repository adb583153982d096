use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::{
    error::{AppError, AppResult},
    server::AppState,
};

#[derive(Debug, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TotalUsersResponse {
    #[ts(type = "number")]
    pub total: u64,
}

#[derive(Debug, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RoomUsersResponse {
    #[ts(type = "number")]
    pub count: u64,
}

#[derive(Debug, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[ts(type = "number")]
    pub total: u64,
}

#[derive(Debug, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConnectionsResponse {
    #[ts(type = "number")]
    pub connections: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomQuery {
    pub room_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatQuery {
    pub visitor_id: Option<String>,
}

/// GET /stats/total
/// Visitors with a heartbeat inside the TTL
pub async fn total(State(state): State<AppState>) -> AppResult<Json<TotalUsersResponse>> {
    let total = state.stats.total().await?;
    Ok(Json(TotalUsersResponse { total }))
}

/// GET /stats/connections
pub async fn connections(State(state): State<AppState>) -> AppResult<Json<ConnectionsResponse>> {
    let connections = state.stats.connected_total().await?;
    Ok(Json(ConnectionsResponse { connections }))
}

/// GET /stats/room?roomId=
pub async fn room_count(
    State(state): State<AppState>,
    Query(query): Query<RoomQuery>,
) -> AppResult<Json<RoomUsersResponse>> {
    let room_id = query
        .room_id
        .ok_or(AppError::MissingParameter("roomId"))?;
    let count = state.stats.room_count(&room_id).await?;
    Ok(Json(RoomUsersResponse { count }))
}

/// POST /stats/heartbeat?visitorId=
pub async fn heartbeat(
    State(state): State<AppState>,
    Query(query): Query<HeartbeatQuery>,
) -> AppResult<Json<HeartbeatResponse>> {
    let visitor_id = query
        .visitor_id
        .ok_or(AppError::MissingParameter("visitorId"))?;
    let total = state.stats.record_heartbeat(&visitor_id).await?;
    Ok(Json(HeartbeatResponse {
        success: true,
        total,
    }))
}
