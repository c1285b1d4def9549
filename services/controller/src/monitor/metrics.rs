use std::collections::HashMap;
use std::time::Duration;

use aad_core::{Error, Result};
use prometheus_http_query::Client;

/// Per-query deadline; a stuck metrics backend must not stall the tick loop.
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Thin wrapper over the Prometheus HTTP API restricted to the two result
/// shapes the monitor consumes: a single scalar sample and an IP-labelled
/// vector.
#[derive(Clone)]
pub struct MetricsClient {
    client: Client,
}

impl MetricsClient {
    pub fn new(address: &str) -> Result<Self> {
        let client = Client::try_from(address)
            .map_err(|e| Error::Config(format!("bad metrics address '{address}': {e}")))?;
        Ok(Self { client })
    }

    /// Evaluates a query expected to produce at most one sample. An empty
    /// result is `None`; more than one sample is a format error.
    pub async fn optional_scalar(&self, query: &str) -> Result<Option<f64>> {
        let vector = self.instant_vector(query).await?;
        match vector.len() {
            0 => Ok(None),
            1 => Ok(Some(vector[0].sample().value())),
            n => Err(Error::MetricsFormat(format!(
                "expected vector of length 0 or 1, got {n}"
            ))),
        }
    }

    /// Like [`optional_scalar`](Self::optional_scalar) with an empty result
    /// read as zero.
    pub async fn scalar(&self, query: &str) -> Result<f64> {
        Ok(self.optional_scalar(query).await?.unwrap_or(0.0))
    }

    /// Evaluates a query grouped by the `ip` label; samples without the
    /// label are skipped.
    pub async fn by_ip(&self, query: &str) -> Result<HashMap<String, f64>> {
        let vector = self.instant_vector(query).await?;
        let mut result = HashMap::new();
        for sample in vector {
            if let Some(ip) = sample.metric().get("ip") {
                result.insert(ip.clone(), sample.sample().value());
            }
        }
        Ok(result)
    }

    async fn instant_vector(
        &self,
        query: &str,
    ) -> Result<Vec<prometheus_http_query::response::InstantVector>> {
        let response = tokio::time::timeout(QUERY_TIMEOUT, self.client.query(query).get())
            .await
            .map_err(|_| Error::Metrics(format!("query timed out after {QUERY_TIMEOUT:?}")))?
            .map_err(|e| Error::Metrics(e.to_string()))?;

        match response.data().as_vector() {
            Some(vector) => Ok(vector.to_vec()),
            None => Err(Error::MetricsFormat(
                "unexpected result format, expected vector".to_string(),
            )),
        }
    }
}
