use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, WireMessage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Thin transport for the two endpoints the oracle talks to.
pub(crate) struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiClient {
    /// The key is baked into the default headers once; it is never logged.
    pub fn new(api_key: &str) -> Result<Self> {
        let mut bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .context("OpenAI API key is not a valid header value")?;
        bearer.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let response = self
            .http
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("OpenAI request to /{path} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("OpenAI /{path} returned {status}: {detail}");
        }

        response
            .json()
            .await
            .with_context(|| format!("Malformed OpenAI /{path} response"))
    }

    /// One chat round-trip. Only the first choice is ever used.
    pub async fn complete(&self, request: &ChatRequest) -> Result<WireMessage> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            forced = request.tool_choice.is_some(),
            "Chat completion"
        );

        let response: ChatResponse = self.post("chat/completions", request).await?;
        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| anyhow!("chat completion returned no choices"))
    }

    pub async fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>> {
        let response: EmbeddingResponse = self
            .post("embeddings", &EmbeddingRequest { model, input })
            .await?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow!("embedding response had no data"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_without_double_slashes() {
        let client = OpenAiClient::new("sk-test")
            .unwrap()
            .with_base_url("http://localhost:8080/v1/");
        assert_eq!(
            client.endpoint("chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(client.endpoint("/embeddings"), "http://localhost:8080/v1/embeddings");
    }

    #[test]
    fn key_with_newline_is_rejected() {
        assert!(OpenAiClient::new("sk-\nbroken").is_err());
    }
}
