//! HTTP client for one backend adapter ("liquid").
//! Speaks the four-endpoint JSON protocol and maps transport, protocol and
//! quota-rejection failures onto a stable error taxonomy.

use std::time::Duration;

use shared::liquid::{
    CapacityReport, CapacityRequest, QuotaRequest, ServiceInfo, UsageReport, UsageRequest,
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LiquidError {
    /// Transport-level failure; the adapter may recover, callers retry with
    /// backoff. The adapter's own message is kept verbatim after the prefix.
    #[error("liquid unavailable: {0}")]
    Unavailable(String),
    /// The adapter sent something the protocol does not allow (unknown
    /// fields, missing entries, malformed JSON).
    #[error("liquid protocol error: {0}")]
    Protocol(String),
    /// The adapter refused a quota update (HTTP 422).
    #[error("liquid rejected quota update: {0}")]
    QuotaRejected(String),
    #[error("liquid request timed out")]
    Timeout,
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one adapter endpoint.
pub struct LiquidClient {
    endpoint: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl LiquidClient {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::ClientBuilder::new()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        LiquidClient {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// `GET /v1/info`
    pub async fn get_info(&self) -> Result<ServiceInfo, LiquidError> {
        let url = format!("{}/v1/info", self.endpoint);
        debug!("fetching service info from {}", url);

        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(map_transport_error)?;
        let body = check_status(response).await?;
        parse_json(&body)
    }

    /// `POST /v1/report-capacity`
    pub async fn report_capacity(
        &self,
        request: &CapacityRequest,
    ) -> Result<CapacityReport, LiquidError> {
        let url = format!("{}/v1/report-capacity", self.endpoint);
        debug!("requesting capacity report from {}", url);

        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;
        let body = check_status(response).await?;
        parse_json(&body)
    }

    /// `POST /v1/projects/{uuid}/report-usage`
    pub async fn report_usage(
        &self,
        project_uuid: Uuid,
        request: &UsageRequest,
    ) -> Result<UsageReport, LiquidError> {
        let url = format!("{}/v1/projects/{}/report-usage", self.endpoint, project_uuid);
        debug!("requesting usage report from {}", url);

        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;
        let body = check_status(response).await?;
        parse_json(&body)
    }

    /// `PUT /v1/projects/{uuid}/quota`, expects 204.
    pub async fn put_quota(
        &self,
        project_uuid: Uuid,
        request: &QuotaRequest,
    ) -> Result<(), LiquidError> {
        let url = format!("{}/v1/projects/{}/quota", self.endpoint, project_uuid);
        debug!("applying quota via {}", url);

        let response = self
            .client
            .put(&url)
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await.unwrap_or_default();
            return Err(LiquidError::QuotaRejected(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LiquidError::Unavailable(format!("HTTP {status}: {body}")));
        }
        Ok(())
    }
}

fn map_transport_error(e: reqwest::Error) -> LiquidError {
    if e.is_timeout() {
        LiquidError::Timeout
    } else {
        LiquidError::Unavailable(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<String, LiquidError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_success() {
        Ok(body)
    } else {
        Err(LiquidError::Unavailable(format!("HTTP {status}: {body}")))
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, LiquidError> {
    serde_json::from_str(body).map_err(|e| LiquidError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_is_normalized() {
        let client = LiquidClient::new("http://liquid-compute:8080/".to_string());
        assert_eq!(client.endpoint(), "http://liquid-compute:8080");
    }

    #[test]
    fn test_parse_json_maps_to_protocol_error() {
        let result: Result<ServiceInfo, _> = parse_json("{\"version\": 1, \"bogus\": 2}");
        assert!(matches!(result, Err(LiquidError::Protocol(_))));
    }
}
