use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use tracing::{debug, warn};

use crate::services::fetch::FetchService;
use crate::types::error::{ErrorResponse, MinerError, Result};
use crate::types::records::{FetchStartRequest, FetchStartResponse, FetchStopRequest};

/// Fetch service reached over its HTTP control API.
pub struct RemoteFetchService {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteFetchService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        url::Url::parse(base_url).map_err(|e| {
            MinerError::config(format!("Invalid fetch service url: {}", e), &["base_url"])
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MinerError::Other(format!("HTTP client error: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, action: &str) -> String {
        format!("{}/api/imap/fetch/{}", self.base_url, action)
    }
}

/// Turn a non-success response into the classified error it describes.
async fn error_from(response: Response) -> MinerError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorResponse>(&text).unwrap_or_else(|_| ErrorResponse {
        message: if text.is_empty() {
            status.to_string()
        } else {
            text
        },
        fields: Vec::new(),
    });
    body.into_error(status.as_u16())
}

#[async_trait]
impl FetchService for RemoteFetchService {
    async fn start(&self, request: FetchStartRequest) -> Result<FetchStartResponse> {
        let endpoint = self.endpoint("start");
        debug!(mining_id = %request.mining_id, endpoint = %endpoint, "Starting remote fetch");

        let response = self.client.post(&endpoint).json(&request).send().await?;
        if !response.status().is_success() {
            let err = error_from(response).await;
            warn!(mining_id = %request.mining_id, error = %err, "Remote fetch refused to start");
            return Err(err);
        }
        Ok(response.json::<FetchStartResponse>().await?)
    }

    async fn stop(&self, request: FetchStopRequest) -> Result<()> {
        let endpoint = self.endpoint("stop");
        let response = self.client.delete(&endpoint).json(&request).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            // Already gone on the remote side
            StatusCode::NOT_FOUND => {
                debug!(mining_id = %request.mining_id, "Remote fetch already stopped");
                Ok(())
            }
            _ => Err(error_from(response).await),
        }
    }
}
