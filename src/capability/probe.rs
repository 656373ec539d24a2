use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde::Deserialize;

use crate::config::ProviderConfig;

// ---------------------------------------------------------------------------
// Probe trait
// ---------------------------------------------------------------------------

/// Metadata fields a probe managed to read from the provider. Everything is
/// optional; the registry fills gaps from the fallback record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbedMetadata {
    pub context_window_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub supports_reasoning: Option<bool>,
    pub requests_per_second: Option<f64>,
    pub tokens_per_minute: Option<u64>,
    pub input_per_1k: Option<f64>,
    pub output_per_1k: Option<f64>,
    pub reasoning_per_1k: Option<f64>,
}

/// Fetches model metadata from the provider. Separated behind a trait so the
/// registry can be driven without a network in tests.
pub trait CapabilityProbe: Send + Sync {
    fn probe<'a>(
        &'a self,
        model_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ProbedMetadata>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

// Gateways differ in what `/v1/models` reports; aliases cover the common
// spellings and anything absent stays None.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireModel {
    id: String,
    #[serde(alias = "context_length", alias = "max_input_tokens")]
    context_window: Option<u32>,
    #[serde(alias = "max_output_tokens")]
    max_tokens: Option<u32>,
    supports_reasoning: Option<bool>,
    #[serde(alias = "rpm_limit")]
    requests_per_second: Option<f64>,
    #[serde(alias = "tpm_limit")]
    tokens_per_minute: Option<u64>,
    input_cost_per_token: Option<f64>,
    output_cost_per_token: Option<f64>,
    reasoning_cost_per_token: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireModelList {
    #[serde(default)]
    data: Vec<WireModel>,
}

impl WireModel {
    fn into_metadata(self) -> ProbedMetadata {
        ProbedMetadata {
            context_window_tokens: self.context_window,
            max_output_tokens: self.max_tokens,
            supports_reasoning: self.supports_reasoning,
            requests_per_second: self.requests_per_second,
            tokens_per_minute: self.tokens_per_minute,
            // Gateways report per-token costs; records carry per-1K.
            input_per_1k: self.input_cost_per_token.map(|c| c * 1000.0),
            output_per_1k: self.output_cost_per_token.map(|c| c * 1000.0),
            reasoning_per_1k: self.reasoning_cost_per_token.map(|c| c * 1000.0),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP probe
// ---------------------------------------------------------------------------

/// Probes OpenAI-compatible metadata endpoints: the per-model detail route
/// first, then the full model list as a fallback.
pub struct HttpProbe {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpProbe {
    pub fn new(provider: &ProviderConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client for capability probes")?;
        Ok(Self {
            client,
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            api_key: provider.api_key.clone(),
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn probe_detail(&self, model_id: &str) -> anyhow::Result<ProbedMetadata> {
        let url = format!("{}/v1/models/{}", self.base_url, model_id);
        let resp = self.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("model detail endpoint returned {}", resp.status());
        }
        let model: WireModel = resp.json().await?;
        Ok(model.into_metadata())
    }

    async fn probe_list(&self, model_id: &str) -> anyhow::Result<ProbedMetadata> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("model list endpoint returned {}", resp.status());
        }
        let list: WireModelList = resp.json().await?;
        let model = list
            .data
            .into_iter()
            .find(|m| m.id == model_id)
            .ok_or_else(|| anyhow::anyhow!("model {model_id} not present in /v1/models"))?;
        Ok(model.into_metadata())
    }
}

impl CapabilityProbe for HttpProbe {
    fn probe<'a>(
        &'a self,
        model_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ProbedMetadata>> + Send + 'a>> {
        Box::pin(async move {
            match self.probe_detail(model_id).await {
                Ok(meta) => Ok(meta),
                Err(e) => {
                    tracing::debug!(
                        model = %model_id,
                        error = %e,
                        "Model detail probe failed, falling back to list endpoint"
                    );
                    self.probe_list(model_id).await
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_detail_payload_with_gateway_fields() {
        let json = r#"{
            "id": "gpt-4o",
            "object": "model",
            "context_window": 128000,
            "max_tokens": 16384,
            "input_cost_per_token": 0.0000025,
            "output_cost_per_token": 0.00001
        }"#;
        let model: WireModel = serde_json::from_str(json).unwrap();
        let meta = model.into_metadata();
        assert_eq!(meta.context_window_tokens, Some(128_000));
        assert_eq!(meta.max_output_tokens, Some(16_384));
        assert!((meta.input_per_1k.unwrap() - 0.002_5).abs() < 1e-9);
        assert!((meta.output_per_1k.unwrap() - 0.010).abs() < 1e-9);
        assert_eq!(meta.supports_reasoning, None);
    }

    #[test]
    fn test_parse_detail_payload_aliases() {
        let json = r#"{"id": "m", "context_length": 32768, "max_output_tokens": 4096}"#;
        let model: WireModel = serde_json::from_str(json).unwrap();
        let meta = model.into_metadata();
        assert_eq!(meta.context_window_tokens, Some(32_768));
        assert_eq!(meta.max_output_tokens, Some(4_096));
    }

    #[test]
    fn test_parse_bare_openai_shape() {
        // Vanilla OpenAI reports no capability fields at all.
        let json = r#"{"id": "gpt-4o", "object": "model", "created": 1715367049, "owned_by": "system"}"#;
        let model: WireModel = serde_json::from_str(json).unwrap();
        assert_eq!(model.into_metadata(), ProbedMetadata::default());
    }

    #[test]
    fn test_parse_model_list() {
        let json = r#"{
            "object": "list",
            "data": [
                {"id": "a", "context_window": 1000},
                {"id": "b", "context_window": 2000}
            ]
        }"#;
        let list: WireModelList = serde_json::from_str(json).unwrap();
        assert_eq!(list.data.len(), 2);
        let b = list.data.into_iter().find(|m| m.id == "b").unwrap();
        assert_eq!(b.into_metadata().context_window_tokens, Some(2000));
    }
}
