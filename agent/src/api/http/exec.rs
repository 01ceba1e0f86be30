//! Exec and attach HTTP handlers

use axum::{
    body::{to_bytes, Body},
    extract::{Path, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::Query;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::domain::{AttachRequest, ExecRequest};
use crate::service::auth::ACCESS_TOKEN_KEY;
use crate::{AppState, Result};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const MAX_FORM_BYTES: usize = 64 * 1024;

/// Access token carried in the query string or form body
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    #[serde(rename = "access-token")]
    pub access_token: Option<String>,
}

/// Response of the prepare endpoints
#[derive(Debug, Serialize)]
pub struct PrepareResponse {
    pub url: String,
}

fn request_uid() -> String {
    Uuid::new_v4().to_string()
}

fn invalid_request(err: impl std::fmt::Display, uid: &str) -> Response {
    warn!("valid request param err={}, uid={}", err, uid);
    (
        StatusCode::BAD_REQUEST,
        format!("valid request param err={},uid={}", err, uid),
    )
        .into_response()
}

/// Query field first, then the header of the same name
fn access_token(headers: &HeaderMap, query: TokenQuery) -> Option<String> {
    query.access_token.or_else(|| {
        headers
            .get(ACCESS_TOKEN_KEY)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })
}

/// Parameters of a stream request: form body values first, then the query
async fn request_params(
    parts: &Parts,
    body: Body,
) -> std::result::Result<(String, Body), axum::Error> {
    let query = parts.uri.query().unwrap_or_default();
    if !is_form(&parts.headers) {
        return Ok((query.to_string(), body));
    }
    let form = to_bytes(body, MAX_FORM_BYTES).await?;
    let form = String::from_utf8_lossy(&form);
    let params: Vec<&str> = [form.trim(), query]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    Ok((params.join("&"), Body::empty()))
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().starts_with(FORM_CONTENT_TYPE))
        .unwrap_or(false)
}

fn authorize(state: &AppState, headers: &HeaderMap, params: &str, uid: &str) -> Result<()> {
    let query: TokenQuery = serde_html_form::from_str(params).unwrap_or_default();
    let token = access_token(headers, query);
    state.auth.validate(token.as_deref(), uid)
}

/// Run the token gate, then parse and validate the parameters, handing back
/// the reassembled request for stream negotiation
async fn admit<T, V>(
    state: &AppState,
    request: Request,
    uid: &str,
    validate: V,
) -> std::result::Result<(Request, T), Response>
where
    T: DeserializeOwned + Send,
    V: FnOnce(&T) -> std::result::Result<(), crate::domain::ValidationError>,
{
    let (parts, body) = request.into_parts();
    let (params, body) = match request_params(&parts, body).await {
        Ok(read) => read,
        Err(e) => return Err(invalid_request(e, uid)),
    };
    if let Err(e) = authorize(state, &parts.headers, &params, uid) {
        warn!("access token rejected, err={}, uid={}", e, uid);
        return Err(e.into_response());
    }
    let parsed: T = match serde_html_form::from_str(&params) {
        Ok(parsed) => parsed,
        Err(e) => return Err(invalid_request(e, uid)),
    };
    if let Err(e) = validate(&parsed) {
        return Err(invalid_request(e, uid));
    }
    Ok((Request::from_parts(parts, body), parsed))
}

/// Exec in a container over WebSocket or SPDY
pub async fn server_exec(State(state): State<AppState>, request: Request) -> Response {
    let uid = request_uid();
    match admit(&state, request, &uid, ExecRequest::validate).await {
        Ok((request, exec)) => state.streaming.serve_exec(request, exec, uid).await,
        Err(response) => response,
    }
}

/// Attach to a container's primary process over WebSocket or SPDY
pub async fn server_attach(State(state): State<AppState>, request: Request) -> Response {
    let uid = request_uid();
    match admit(&state, request, &uid, AttachRequest::validate).await {
        Ok((request, attach)) => state.streaming.serve_attach(request, attach, uid).await,
        Err(response) => response,
    }
}

/// Store an exec request and return the single-use URL that serves it
pub async fn prepare_exec(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(req): Json<ExecRequest>,
) -> Result<Json<PrepareResponse>> {
    let uid = request_uid();
    state.auth.validate(access_token(&headers, query).as_deref(), &uid)?;
    let url = state.streaming.prepare_exec(req)?;
    Ok(Json(PrepareResponse { url }))
}

/// Store an attach request and return the single-use URL that serves it
pub async fn prepare_attach(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(req): Json<AttachRequest>,
) -> Result<Json<PrepareResponse>> {
    let uid = request_uid();
    state.auth.validate(access_token(&headers, query).as_deref(), &uid)?;
    let url = state.streaming.prepare_attach(req)?;
    Ok(Json(PrepareResponse { url }))
}

pub async fn serve_prepared_exec(
    State(state): State<AppState>,
    Path(token): Path<String>,
    request: Request,
) -> Response {
    match state.streaming.consume_exec(&token) {
        Ok(exec) => state.streaming.serve_exec(request, exec, request_uid()).await,
        Err(e) => e.into_response(),
    }
}

pub async fn serve_prepared_attach(
    State(state): State<AppState>,
    Path(token): Path<String>,
    request: Request,
) -> Response {
    match state.streaming.consume_attach(&token) {
        Ok(attach) => state.streaming.serve_attach(request, attach, request_uid()).await,
        Err(e) => e.into_response(),
    }
}
