//! Thin client for the Prometheus query API, used to derive capacity values
//! from metrics. Only instant vector queries are supported; each result
//! sample is keyed by its `az` label.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PromQueryError {
    #[error("metric backend unavailable: {0}")]
    Unavailable(String),
    #[error("metric backend returned invalid response: {0}")]
    InvalidResponse(String),
}

/// One sample from an instant vector query.
#[derive(Debug, Clone)]
pub struct AZSample {
    /// Value of the sample's `az` label, if present.
    pub az: Option<String>,
    pub value: f64,
}

pub struct PrometheusClient {
    api_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    metric: std::collections::BTreeMap<String, String>,
    /// `[unix_timestamp, "value"]`
    value: (f64, String),
}

impl PrometheusClient {
    pub fn new(api_url: String) -> Self {
        let client = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        PrometheusClient {
            api_url: api_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Run an instant query and return one sample per result series.
    pub async fn query(&self, query: &str) -> Result<Vec<AZSample>, PromQueryError> {
        let url = format!("{}/api/v1/query", self.api_url);
        debug!(query, "running prometheus query");

        let response = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| PromQueryError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PromQueryError::Unavailable(format!(
                "HTTP {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| PromQueryError::InvalidResponse(e.to_string()))?;

        if parsed.status != "success" {
            return Err(PromQueryError::Unavailable(format!(
                "query failed: {}",
                parsed.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        let data = parsed
            .data
            .ok_or_else(|| PromQueryError::InvalidResponse("missing data".to_string()))?;
        if data.result_type != "vector" {
            return Err(PromQueryError::InvalidResponse(format!(
                "expected vector result, got {}",
                data.result_type
            )));
        }

        data.result
            .into_iter()
            .map(|sample| {
                let value = sample.value.1.parse::<f64>().map_err(|e| {
                    PromQueryError::InvalidResponse(format!(
                        "unparseable sample value {:?}: {e}",
                        sample.value.1
                    ))
                })?;
                Ok(AZSample {
                    az: sample.metric.get("az").cloned(),
                    value,
                })
            })
            .collect()
    }
}
