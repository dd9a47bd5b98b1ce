use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use data_model::{ExecutorType, FuncSvc, ObjectRef};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::ExecutorError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    code: u16,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            code: status_code.as_u16(),
            message: message.to_string(),
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, Json(self)).into_response()
    }
}

impl From<ExecutorError> for ApiError {
    fn from(e: ExecutorError) -> Self {
        Self::new(e.status_code(), e.to_string().as_str())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::bad_request(&e.to_string())
    }
}

/// Cache entry as exposed by the debug endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct FuncSvcInfo {
    pub name: String,
    pub function: String,
    pub function_uid: String,
    pub generation: i64,
    pub environment: String,
    pub address: String,
    pub executor: ExecutorType,
    pub kube_objects: Vec<String>,
    pub idle_secs: u64,
    pub active_requests: u32,
}

impl From<&FuncSvc> for FuncSvcInfo {
    fn from(fsvc: &FuncSvc) -> Self {
        Self {
            name: fsvc.name.clone(),
            function: format!("{}/{}", fsvc.function.namespace, fsvc.function.name),
            function_uid: fsvc.function.uid.clone(),
            generation: fsvc.function.generation,
            environment: format!(
                "{}/{}",
                fsvc.environment.namespace, fsvc.environment.name
            ),
            address: fsvc.address.clone(),
            executor: fsvc.executor,
            kube_objects: fsvc.kube_objects.iter().map(ObjectRef::to_string).collect(),
            idle_secs: fsvc.idle_for(tokio::time::Instant::now()).as_secs(),
            active_requests: fsvc.active_requests,
        }
    }
}
