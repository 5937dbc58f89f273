//! Provider-agnostic external generation client (C6).
//!
//! Wraps a single remote provider (`anthropic` or `openai`) behind one
//! `generate` call. Every prompt is piped through the secret filter (C1)
//! before it leaves the host when `redact_secrets` is enabled, and the
//! process-lifetime redaction counter is updated accordingly.

use crate::config::Provider;
use crate::error::{Result, SragError};
use crate::secret_filter;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// Result of a single `generate` call, shared by both provider branches.
pub struct GenerateResult {
    pub text: String,
    pub tokens_used: u64,
}

/// Construction parameters (§4.5).
pub struct ApiClientConfig {
    pub provider: Provider,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_file: Option<std::path::PathBuf>,
    pub max_tokens: u32,
    pub redact_secrets: bool,
    /// Override for the provider base URL; only used by tests.
    pub base_url: Option<String>,
}

pub struct ExternalApiClient {
    provider: Provider,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    redact_secrets: bool,
    base_url: String,
    http: reqwest::Client,
    redactions: AtomicU64,
}

impl ExternalApiClient {
    /// If `api_key` is unset and `api_key_file` is set, the file is read
    /// and trailing whitespace stripped at construction time. A missing
    /// file is non-fatal: the client is simply left unconfigured.
    pub fn new(config: ApiClientConfig) -> Self {
        let api_key = config.api_key.or_else(|| {
            config
                .api_key_file
                .as_ref()
                .and_then(|path| std::fs::read_to_string(path).ok())
                .map(|s| s.trim_end().to_string())
        });

        let base_url = config.base_url.unwrap_or_else(|| match config.provider {
            Provider::Anthropic => "https://api.anthropic.com".to_string(),
            Provider::Openai => "https://api.openai.com".to_string(),
            Provider::Local => String::new(),
        });

        Self {
            provider: config.provider,
            model: config.model,
            api_key,
            max_tokens: config.max_tokens,
            redact_secrets: config.redact_secrets,
            base_url,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("failed to build http client"),
            redactions: AtomicU64::new(0),
        }
    }

    pub fn total_redactions(&self) -> u64 {
        self.redactions.load(Ordering::SeqCst)
    }

    pub async fn generate(
        &self,
        prompt: &str,
        max_tokens: Option<u32>,
        temperature: f32,
        stop: Option<&[String]>,
    ) -> Result<GenerateResult> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(SragError::NotConfigured(format!(
                "no API key configured for {}. run 'srag config api-key' to set one.",
                self.provider.as_str()
            )));
        };

        let prompt = if self.redact_secrets {
            let (redacted, n) = secret_filter::redact(prompt);
            if n > 0 {
                self.redactions.fetch_add(n as u64, Ordering::SeqCst);
                info!(redactions = n, "redacted secrets from outbound prompt");
            }
            redacted
        } else {
            prompt.to_string()
        };

        let max_tokens = max_tokens.unwrap_or(self.max_tokens);

        match self.provider {
            Provider::Anthropic => self.generate_anthropic(api_key, &prompt, max_tokens, temperature).await,
            Provider::Openai => {
                self.generate_openai(api_key, &prompt, max_tokens, temperature, stop)
                    .await
            }
            Provider::Local => Err(SragError::BadProvider("local".to_string())),
        }
    }

    async fn generate_anthropic(
        &self,
        api_key: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<GenerateResult> {
        #[derive(serde::Serialize)]
        struct Message<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(serde::Serialize)]
        struct Req<'a> {
            model: &'a str,
            max_tokens: u32,
            temperature: f32,
            messages: Vec<Message<'a>>,
        }

        #[derive(Deserialize)]
        struct ContentBlock {
            text: String,
        }

        #[derive(Deserialize)]
        struct Usage {
            input_tokens: u64,
            output_tokens: u64,
        }

        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            content: Vec<ContentBlock>,
            usage: Usage,
        }

        let req = Req {
            model: &self.model,
            max_tokens,
            temperature,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&req)
            .send()
            .await
            .map_err(|e| SragError::BackendError(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SragError::BackendError(format!(
                "anthropic request failed: {}",
                resp.status()
            )));
        }

        let body: Resp = resp.json().await.map_err(|e| SragError::BackendError(e.to_string()))?;
        let text = body.content.first().map(|c| c.text.clone()).unwrap_or_default();
        Ok(GenerateResult {
            text,
            tokens_used: body.usage.input_tokens + body.usage.output_tokens,
        })
    }

    async fn generate_openai(
        &self,
        api_key: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        stop: Option<&[String]>,
    ) -> Result<GenerateResult> {
        #[derive(serde::Serialize)]
        struct Message<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(serde::Serialize)]
        struct Req<'a> {
            model: &'a str,
            max_tokens: u32,
            temperature: f32,
            #[serde(skip_serializing_if = "Option::is_none")]
            stop: Option<&'a [String]>,
            messages: Vec<Message<'a>>,
        }

        #[derive(Deserialize)]
        struct MessageResp {
            content: Option<String>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: MessageResp,
        }

        #[derive(Deserialize, Default)]
        struct Usage {
            #[serde(default)]
            total_tokens: u64,
        }

        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            choices: Vec<Choice>,
            #[serde(default)]
            usage: Usage,
        }

        let req = Req {
            model: &self.model,
            max_tokens,
            temperature,
            stop,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let resp = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| SragError::BackendError(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SragError::BackendError(format!(
                "openai request failed: {}",
                resp.status()
            )));
        }

        let body: Resp = resp.json().await.map_err(|e| SragError::BackendError(e.to_string()))?;
        let text = body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        Ok(GenerateResult {
            text,
            tokens_used: body.usage.total_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn base_config(provider: Provider, base_url: String, api_key: Option<String>) -> ApiClientConfig {
        ApiClientConfig {
            provider,
            model: "test-model".to_string(),
            api_key,
            api_key_file: None,
            max_tokens: 2048,
            redact_secrets: true,
            base_url: Some(base_url),
        }
    }

    #[tokio::test]
    async fn not_configured_without_api_key() {
        let client = ExternalApiClient::new(base_config(
            Provider::Anthropic,
            "http://127.0.0.1:1".to_string(),
            None,
        ));
        let err = client.generate("hi", None, 0.1, None).await.unwrap_err();
        assert!(matches!(err, SragError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn anthropic_generate_parses_response_and_sums_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "hello back"}],
                "usage": {"input_tokens": 5, "output_tokens": 7}
            })))
            .mount(&server)
            .await;

        let client = ExternalApiClient::new(base_config(
            Provider::Anthropic,
            server.uri(),
            Some("sk-ant-test".to_string()),
        ));
        let result = client.generate("hi", None, 0.1, None).await.unwrap();
        assert_eq!(result.text, "hello back");
        assert_eq!(result.tokens_used, 12);
    }

    #[tokio::test]
    async fn openai_generate_reads_choice_and_total_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "oai reply"}}],
                "usage": {"total_tokens": 42}
            })))
            .mount(&server)
            .await;

        let client = ExternalApiClient::new(base_config(
            Provider::Openai,
            server.uri(),
            Some("sk-test".to_string()),
        ));
        let result = client.generate("hi", None, 0.1, None).await.unwrap();
        assert_eq!(result.text, "oai reply");
        assert_eq!(result.tokens_used, 42);
    }

    #[tokio::test]
    async fn prompt_is_redacted_before_leaving_the_host() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "ok"}],
                "usage": {"input_tokens": 1, "output_tokens": 1}
            })))
            .mount(&server)
            .await;

        let client = ExternalApiClient::new(base_config(
            Provider::Anthropic,
            server.uri(),
            Some("sk-ant-test".to_string()),
        ));
        client
            .generate("Connect postgres://u:secretpass@h/db", None, 0.1, None)
            .await
            .unwrap();

        assert_eq!(client.total_redactions(), 1);

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let sent_prompt = body["messages"][0]["content"].as_str().unwrap();
        assert!(sent_prompt.contains("[REDACTED]"));
        assert!(!sent_prompt.contains("secretpass"));
    }

    #[tokio::test]
    async fn api_key_file_is_read_and_trimmed_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key.txt");
        std::fs::write(&key_path, "sk-ant-from-file\n\n").unwrap();

        let client = ExternalApiClient::new(ApiClientConfig {
            provider: Provider::Anthropic,
            model: "test".to_string(),
            api_key: None,
            api_key_file: Some(key_path),
            max_tokens: 2048,
            redact_secrets: false,
            base_url: Some("http://127.0.0.1:1".to_string()),
        });
        assert_eq!(client.api_key.as_deref(), Some("sk-ant-from-file"));
    }

    #[tokio::test]
    async fn missing_api_key_file_is_non_fatal() {
        let client = ExternalApiClient::new(ApiClientConfig {
            provider: Provider::Anthropic,
            model: "test".to_string(),
            api_key: None,
            api_key_file: Some(std::path::PathBuf::from("/nonexistent/key.txt")),
            max_tokens: 2048,
            redact_secrets: false,
            base_url: None,
        });
        assert!(client.api_key.is_none());
    }
}
