use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;
use crate::gateway::Generator;

const ANSWER_TEMPERATURE: f32 = 0.2;

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    answer_model: String,
}

#[derive(Serialize)]
struct EmbedReq<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedResp {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct LegacyEmbedReq<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct LegacyEmbedResp {
    embedding: Vec<f32>,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, answer_model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            answer_model: answer_model.into(),
        }
    }

    /// Embeds a question for similarity search. Older Ollama builds only
    /// serve `/api/embeddings`.
    pub async fn embed_query(&self, model: &str, question: &str) -> Result<Vec<f32>> {
        let question = question.trim();
        if question.is_empty() {
            anyhow::bail!("cannot embed an empty question");
        }

        let current = self
            .post_json::<_, EmbedResp>("/api/embed", &EmbedReq { model, input: question })
            .await
            .and_then(|resp| {
                resp.embeddings
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("/api/embed returned no vectors"))
            });

        match current {
            Ok(vector) => Ok(vector),
            Err(current_err) => self
                .post_json::<_, LegacyEmbedResp>(
                    "/api/embeddings",
                    &LegacyEmbedReq {
                        model,
                        prompt: question,
                    },
                )
                .await
                .map(|resp| resp.embedding)
                .with_context(|| {
                    format!("query embedding with {model} failed (/api/embed: {current_err})")
                }),
        }
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to call ollama {path}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ollama {path} returned {status}: {}", normalize_err_body(&body));
        }

        response
            .json::<R>()
            .await
            .with_context(|| format!("failed to decode ollama {path} response"))
    }

    async fn generate_once(
        &self,
        prompt: &str,
        max_tokens: usize,
    ) -> std::result::Result<String, GenerationError> {
        #[derive(Serialize)]
        struct GenerateReq<'a> {
            model: &'a str,
            prompt: &'a str,
            stream: bool,
            options: GenerateOptions,
        }

        #[derive(Serialize)]
        struct GenerateOptions {
            num_predict: usize,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct GenerateResp {
            response: String,
        }

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&GenerateReq {
                model: &self.answer_model,
                prompt,
                stream: false,
                options: GenerateOptions {
                    num_predict: max_tokens,
                    temperature: ANSWER_TEMPERATURE,
                },
            })
            .send()
            .await
            .map_err(|err| GenerationError::Transient(format!("ollama generate unreachable: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, retry_after, &normalize_err_body(&body)));
        }

        let response = response.json::<GenerateResp>().await.map_err(|err| {
            GenerationError::Transient(format!("failed to decode ollama generate response: {err}"))
        })?;

        Ok(response.response.trim().to_string())
    }
}

#[async_trait]
impl Generator for OllamaClient {
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: usize,
    ) -> std::result::Result<String, GenerationError> {
        self.generate_once(prompt, max_tokens).await
    }
}

fn classify_failure(
    status: StatusCode,
    retry_after: Option<Duration>,
    message: &str,
) -> GenerationError {
    let lower = message.to_ascii_lowercase();
    if status == StatusCode::PAYMENT_REQUIRED || lower.contains("quota") {
        return GenerationError::QuotaExceeded;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return GenerationError::RateLimited { retry_after };
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return GenerationError::Transient(format!("ollama generate returned {status}: {message}"));
    }
    GenerationError::InvalidRequest(format!("ollama generate returned {status}: {message}"))
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
    }

    trimmed.to_string()
}
