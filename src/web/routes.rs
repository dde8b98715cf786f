//! HTTP route handlers
//!
//! Successful responses use the envelope `{"success": true, "message", "data"}`;
//! failures go through [`TrafficError`]'s `IntoResponse`.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, warn};

use super::auth::bearer_token;
use super::display::mask_ip;
use super::middleware::get_real_ip;
use super::AppState;
use crate::db::{
    clamp_days, parse_request_id, parse_source_id, EntityKind, HistoryFilter, RawRequest,
    RawRequestFilter, RawRequestRecord, Series,
};
use crate::error::{TrafficError, TrafficResult};
use crate::report::TrafficReport;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    pub data: T,
}

fn ok<T: Serialize>(message: impl Into<String>, data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        message: message.into(),
        data,
    })
}

#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    /// Kept as text so garbage falls back to the default window instead of a 400
    pub days: Option<String>,
}

impl DaysQuery {
    fn days(&self) -> u32 {
        clamp_days(self.days.as_deref().and_then(|d| d.trim().parse().ok()))
    }
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    #[serde(default)]
    pub custom_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let database = if state.service.healthy().await { "connected" } else { "disconnected" };
    ok(
        "service is running",
        json!({
            "status": "healthy",
            "database": database,
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": Utc::now(),
        }),
    )
    .into_response()
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> TrafficResult<Response> {
    if !state.keys.check_password(&request.password) {
        warn!("Failed login attempt");
        return Err(TrafficError::Unauthorized("wrong password".to_string()));
    }
    let token = state.keys.issue(Utc::now())?;
    info!("Dashboard login");
    let body = json!({ "success": true, "message": "login successful", "token": token });
    Ok(Json(body).into_response())
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> TrafficResult<Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| TrafficError::Unauthorized("missing bearer token".to_string()))?;
    let claims = state.keys.verify(token)?;
    let data = json!({ "user": claims.sub, "expires_at": claims.exp });
    Ok(ok("token is valid", data).into_response())
}

/// Report intake from nodes
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> TrafficResult<Response> {
    let fallback = peer.map(|ConnectInfo(addr)| addr.ip().to_string()).unwrap_or_default();
    let source_ip = get_real_ip(&headers, &fallback);
    info!("Traffic report from {} ({} bytes)", source_ip, body.len());

    let parsed = match TrafficReport::from_json(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            // Acknowledged so the node does not retry a body that will never parse
            warn!("Body from {} is not a traffic report: {}", source_ip, e);
            let data = json!({ "stored": false, "timestamp": Utc::now() });
            return Ok(ok("traffic data received", data).into_response());
        }
    };

    let raw = RawRequest {
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    let mut outcome = state.service.ingest(&source_ip, parsed.report, Some(raw)).await?;
    outcome.skipped += parsed.skipped;
    let data = json!({ "stored": true, "outcome": outcome, "timestamp": Utc::now() });
    Ok(ok("traffic data received", data).into_response())
}

pub async fn list_services(State(state): State<Arc<AppState>>) -> TrafficResult<Response> {
    let mut services = state.service.list_sources().await?;
    for service in &mut services {
        service.ip_address = mask_ip(&service.ip_address);
    }
    Ok(ok("services loaded", services).into_response())
}

pub async fn service_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DaysQuery>,
) -> TrafficResult<Response> {
    let id = parse_source_id(&id)?;
    let mut detail = state.service.source_detail(id, query.days()).await?;
    detail.service.ip_address = mask_ip(&detail.service.ip_address);
    Ok(ok("service detail loaded", detail).into_response())
}

pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> TrafficResult<Response> {
    let id = parse_source_id(&id)?;
    state.service.delete_source(id).await?;
    Ok(ok("service deleted", json!({ "id": id })).into_response())
}

pub async fn rename_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> TrafficResult<Response> {
    let id = parse_source_id(&id)?;
    state.service.rename_source(id, request.custom_name.as_deref()).await?;
    let data = json!({ "id": id, "custom_name": request.custom_name });
    Ok(ok("custom name updated", data).into_response())
}

pub async fn traffic_summary(State(state): State<Arc<AppState>>) -> TrafficResult<Response> {
    let mut summary = state.service.traffic_summary().await?;
    for service in &mut summary.services {
        service.ip_address = mask_ip(&service.ip_address);
    }
    Ok(ok("traffic summary loaded", summary).into_response())
}

pub async fn traffic_history(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<HistoryFilter>,
) -> TrafficResult<Response> {
    let mut records = state.service.history_records(&filter).await?;
    for record in &mut records {
        record.ip_address = mask_ip(&record.ip_address);
    }
    Ok(ok("traffic history loaded", records).into_response())
}

fn mask_raw_request(record: &mut RawRequestRecord) {
    record.service_ip = mask_ip(&record.service_ip);
    record.client_ip = mask_ip(&record.client_ip);
}

pub async fn list_raw_requests(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<RawRequestFilter>,
) -> TrafficResult<Response> {
    let mut records = state.service.raw_requests(&filter).await?;
    records.iter_mut().for_each(mask_raw_request);
    Ok(ok("raw requests loaded", records).into_response())
}

pub async fn raw_request_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> TrafficResult<Response> {
    let id = parse_request_id(&id)?;
    let mut record = state.service.raw_request(id).await?;
    mask_raw_request(&mut record);
    Ok(ok("raw request loaded", record).into_response())
}

async fn source_window(state: &AppState, raw_id: &str, days: u32) -> TrafficResult<Response> {
    let id = parse_source_id(raw_id)?;
    let series = state.service.source_window(id, days).await?;
    Ok(ok(format!("{} day traffic loaded", days), series).into_response())
}

pub async fn weekly_traffic(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> TrafficResult<Response> {
    source_window(&state, &id, 7).await
}

pub async fn monthly_traffic(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> TrafficResult<Response> {
    source_window(&state, &id, 30).await
}

pub async fn trigger_rollover(State(state): State<Arc<AppState>>) -> TrafficResult<Response> {
    let report = state.service.rollover().await?;
    Ok(ok("daily rollover executed", report).into_response())
}

async fn entity_detail(
    state: &AppState,
    kind: EntityKind,
    raw_id: &str,
    key: &str,
    query: &DaysQuery,
) -> TrafficResult<Response> {
    let id = parse_source_id(raw_id)?;
    let mut detail = state.service.entity_detail(id, kind, key, query.days()).await?;
    detail.info.ip_address = mask_ip(&detail.info.ip_address);
    Ok(ok(format!("{} detail loaded", kind.as_str()), detail).into_response())
}

pub async fn port_detail(
    State(state): State<Arc<AppState>>,
    Path((id, tag)): Path<(String, String)>,
    Query(query): Query<DaysQuery>,
) -> TrafficResult<Response> {
    entity_detail(&state, EntityKind::Port, &id, &tag, &query).await
}

pub async fn user_detail(
    State(state): State<Arc<AppState>>,
    Path((id, email)): Path<(String, String)>,
    Query(query): Query<DaysQuery>,
) -> TrafficResult<Response> {
    entity_detail(&state, EntityKind::Client, &id, &email, &query).await
}

/// `date,upload,download,total` rows, one per day
pub fn render_csv(series: &Series) -> TrafficResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let csv_err = |e: csv::Error| TrafficError::Internal(format!("csv rendering failed: {}", e));

    writer.write_record(["date", "upload", "download", "total"]).map_err(csv_err)?;
    let rows = series
        .dates
        .iter()
        .zip(&series.upload_data)
        .zip(&series.download_data);
    for ((date, up), down) in rows {
        writer
            .write_record([date.clone(), up.to_string(), down.to_string(), (up + down).to_string()])
            .map_err(csv_err)?;
    }
    writer
        .into_inner()
        .map_err(|e| TrafficError::Internal(format!("csv rendering failed: {}", e)))
}

/// Keep the download name to characters that are safe in a header
fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn export(
    state: &AppState,
    kind: EntityKind,
    raw_id: &str,
    key: &str,
) -> TrafficResult<Response> {
    let id = parse_source_id(raw_id)?;
    let series = state.service.export_history(id, kind, key).await?;
    info!("Exporting {} days of {} '{}' on service {}", series.len(), kind.as_str(), key, id);
    let body = render_csv(&series)?;

    let disposition = format!(
        "attachment; filename=\"{}-{}-{}.csv\"",
        kind.as_str(),
        id,
        file_stem(key)
    );
    let disposition = HeaderValue::from_str(&disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"export.csv\""));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/csv; charset=utf-8")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

pub async fn export_port(
    State(state): State<Arc<AppState>>,
    Path((id, tag)): Path<(String, String)>,
) -> TrafficResult<Response> {
    export(&state, EntityKind::Port, &id, &tag).await
}

pub async fn export_user(
    State(state): State<Arc<AppState>>,
    Path((id, email)): Path<(String, String)>,
) -> TrafficResult<Response> {
    export(&state, EntityKind::Client, &id, &email).await
}

pub async fn rename_inbound(
    State(state): State<Arc<AppState>>,
    Path((id, tag)): Path<(String, String)>,
    Json(request): Json<RenameRequest>,
) -> TrafficResult<Response> {
    let id = parse_source_id(&id)?;
    let name = request.custom_name.as_deref();
    state.service.rename_entity(id, EntityKind::Port, &tag, name).await?;
    let data = json!({ "service_id": id, "tag": tag, "custom_name": request.custom_name });
    Ok(ok("custom name updated", data).into_response())
}

pub async fn rename_client(
    State(state): State<Arc<AppState>>,
    Path((id, email)): Path<(String, String)>,
    Json(request): Json<RenameRequest>,
) -> TrafficResult<Response> {
    let id = parse_source_id(&id)?;
    let name = request.custom_name.as_deref();
    state.service.rename_entity(id, EntityKind::Client, &email, name).await?;
    let data = json!({ "service_id": id, "email": email, "custom_name": request.custom_name });
    Ok(ok("custom name updated", data).into_response())
}

pub async fn api_not_found() -> Response {
    let body = json!({ "success": false, "error": "API endpoint not found" });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}
