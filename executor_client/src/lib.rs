//! HTTP client for the executor API, used by the router.
//!
//! Keep-alive taps are not sent one by one: they are queued and flushed as a
//! single `/v2/tapServices` call per tick, deduplicated by service URL.

use std::{collections::HashMap, time::Duration};

use data_model::{ExecutorType, FunctionIdentity, TapServiceRequest};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_TAP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid executor url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("executor returned {code}: {message}")]
    Api { code: u16, message: String },
}

impl ClientError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Clone)]
pub struct ExecutorClient {
    base_url: Url,
    http: reqwest::Client,
    tap_tx: mpsc::UnboundedSender<TapServiceRequest>,
}

impl ExecutorClient {
    pub fn new(base_url: &str, cancel: CancellationToken) -> Result<Self, ClientError> {
        Self::with_tap_interval(base_url, DEFAULT_TAP_INTERVAL, cancel)
    }

    pub fn with_tap_interval(
        base_url: &str,
        tap_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)?;
        let http = reqwest::Client::builder().no_proxy().build()?;
        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        tokio::spawn(tap_batch_loop(
            http.clone(),
            base_url.join("/v2/tapServices")?,
            tap_rx,
            tap_interval,
            cancel,
        ));
        Ok(Self {
            base_url,
            http,
            tap_tx,
        })
    }

    /// Resolves a function to the address of a live service for it.
    pub async fn get_service_for_function(
        &self,
        function: &FunctionIdentity,
    ) -> Result<String, ClientError> {
        let url = self.base_url.join("/v2/getServiceForFunction")?;
        let resp = self.http.post(url).json(function).send().await?;
        let resp = check_response(resp).await?;
        Ok(resp.text().await?)
    }

    /// Queues a keep-alive for `service_url`; it is sent with the next batch.
    pub fn tap_service(
        &self,
        fn_metadata: FunctionIdentity,
        executor_type: ExecutorType,
        service_url: &str,
    ) {
        let req = TapServiceRequest {
            fn_metadata,
            fn_executor_type: executor_type,
            service_url: service_url.to_string(),
        };
        if self.tap_tx.send(req).is_err() {
            warn!(service_url, "tap batcher stopped, dropping tap");
        }
    }

    pub async fn tap_services(&self, reqs: &[TapServiceRequest]) -> Result<(), ClientError> {
        let url = self.base_url.join("/v2/tapServices")?;
        post_taps(&self.http, url, reqs).await
    }

    /// Releases a concurrency slot held on the service at `service_url`.
    pub async fn untap_service(
        &self,
        fn_metadata: FunctionIdentity,
        executor_type: ExecutorType,
        service_url: &str,
    ) -> Result<(), ClientError> {
        let url = self.base_url.join("/v2/unTapService")?;
        let req = TapServiceRequest {
            fn_metadata,
            fn_executor_type: executor_type,
            service_url: service_url.to_string(),
        };
        let resp = self.http.post(url).json(&req).send().await?;
        check_response(resp).await?;
        Ok(())
    }
}

async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status == StatusCode::OK {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.message)
        .unwrap_or(body);
    Err(ClientError::Api {
        code: status.as_u16(),
        message,
    })
}

async fn post_taps(
    http: &reqwest::Client,
    url: Url,
    reqs: &[TapServiceRequest],
) -> Result<(), ClientError> {
    let resp = http.post(url).json(reqs).send().await?;
    check_response(resp).await?;
    Ok(())
}

async fn tap_batch_loop(
    http: reqwest::Client,
    url: Url,
    mut rx: mpsc::UnboundedReceiver<TapServiceRequest>,
    tap_interval: Duration,
    cancel: CancellationToken,
) {
    let mut pending: HashMap<String, TapServiceRequest> = HashMap::new();
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + tap_interval, tap_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            req = rx.recv() => {
                match req {
                    Some(req) => {
                        pending.insert(req.service_url.clone(), req);
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if pending.is_empty() {
                    continue;
                }
                let batch: Vec<TapServiceRequest> = std::mem::take(&mut pending).into_values().collect();
                debug!(count = batch.len(), "flushing tap batch");
                if let Err(err) = post_taps(&http, url.clone(), &batch).await {
                    warn!(
                        error = %err,
                        urls = ?batch.iter().map(|r| r.service_url.as_str()).collect::<Vec<_>>(),
                        "error tapping function services"
                    );
                }
            }
        }
    }
}
