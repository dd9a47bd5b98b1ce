use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{MatchedPath, Request, State},
    routing::{get, post},
    Json,
    Router,
};
use data_model::{GetServiceRequest, TapServiceRequest};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::{
    executor::Executor,
    http_objects::{ApiError, FuncSvcInfo},
};

#[derive(Clone)]
pub struct RouteState {
    pub executor: Arc<Executor>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/v2/getServiceForFunction",
            post(get_service_for_function).with_state(route_state.clone()),
        )
        .route(
            "/v2/tapService",
            post(tap_service).with_state(route_state.clone()),
        )
        .route(
            "/v2/tapServices",
            post(tap_services).with_state(route_state.clone()),
        )
        .route(
            "/v2/unTapService",
            post(untap_service).with_state(route_state.clone()),
        )
        .route(
            "/v2/debugInfo",
            get(debug_info).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
}

async fn healthz() -> &'static str {
    "ok"
}

/// Returns the address of a live service for the function in the body.
async fn get_service_for_function(
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<String, ApiError> {
    let request: GetServiceRequest = serde_json::from_slice(&body)?;
    let identity = request.into_identity();
    let address = state.executor.get_service_for_function(&identity).await?;
    debug!(function = %identity, address, "resolved function service");
    Ok(address)
}

async fn tap_service(State(state): State<RouteState>, body: Bytes) -> Result<(), ApiError> {
    let url = std::str::from_utf8(&body)
        .map_err(|e| ApiError::bad_request(&format!("service url is not utf-8: {e}")))?;
    state.executor.tap_service(url.trim()).await?;
    Ok(())
}

async fn tap_services(
    State(state): State<RouteState>,
    Json(requests): Json<Vec<TapServiceRequest>>,
) -> Result<(), ApiError> {
    state
        .executor
        .tap_services(&requests)
        .await
        .map_err(|e| ApiError::not_found(&e.to_string()))
}

async fn untap_service(
    State(state): State<RouteState>,
    Json(request): Json<TapServiceRequest>,
) -> Result<(), ApiError> {
    state.executor.untap_service(&request).await?;
    Ok(())
}

async fn debug_info(State(state): State<RouteState>) -> Result<Json<Vec<FuncSvcInfo>>, ApiError> {
    Ok(Json(state.executor.debug_info().await?))
}
