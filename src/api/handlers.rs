use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info};

use crate::rangestore::{RangeStore, RangeStoreState};
use crate::storage::ContextCache;

pub struct AppState {
    pub cache: ContextCache,
    pub range_store: Option<Arc<RangeStore>>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub message: String,
    /// `empty`, `building` or `ready`; absent when IPv6 lookups are off
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_store: Option<&'static str>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Look up the context for a single address
pub async fn get_context(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> Result<Response, ApiError> {
    info!(ip_address = %ip, "received context request");

    let ip: IpAddr = ip
        .trim()
        .parse()
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "invalid IP address"))?;
    // IPv4-mapped addresses are answered from the IPv4 cache
    let ip = ip.to_canonical();

    let not_found = || api_error(StatusCode::NOT_FOUND, "no context found for IP address");

    match ip {
        IpAddr::V4(v4) => match state.cache.lookup_by_ip(v4).await {
            Ok(Some(context)) => Ok(Json(context).into_response()),
            Ok(None) => Err(not_found()),
            Err(e) => {
                error!(error = %e, "context lookup failed");
                Err(api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to look up context: {}", e),
                ))
            }
        },
        IpAddr::V6(_) => {
            let Some(range_store) = state.range_store.as_ref() else {
                return Err(not_found());
            };
            match range_store.lookup(ip) {
                Ok(Some(context)) if !context.network.is_empty() => Ok(Json(context).into_response()),
                Ok(_) => Err(not_found()),
                Err(e) => {
                    error!(error = %e, "network lookup failed");
                    Err(api_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("failed to look up network: {}", e),
                    ))
                }
            }
        }
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let range_store = state.range_store.as_ref().map(|store| match store.state() {
        RangeStoreState::Empty => "empty",
        RangeStoreState::Building => "building",
        RangeStoreState::Ready => "ready",
    });

    Json(HealthResponse {
        message: "OK".to_string(),
        range_store,
    })
}
