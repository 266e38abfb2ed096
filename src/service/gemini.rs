use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::GeminiSettings;
use crate::service::circuit_breaker::CircuitBreaker;
use crate::service::http::{create_client, ClientType};

pub const INSIGHT_SERVICE: &str = "gemini";

/// URLs listed in the prompt; the rest are summarised by count.
const PROMPT_URL_LIMIT: usize = 50;

/// Produces a short written insight about a company from its discovered pages.
#[async_trait]
pub trait InsightGenerator: Send + Sync {
    async fn generate(&self, company_name: &str, urls: &[String]) -> Result<String>;
}

/// Google Gemini `generateContent` client.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    settings: GeminiSettings,
}

impl GeminiClient {
    pub fn new(settings: GeminiSettings) -> Result<Self> {
        Ok(Self::with_client(create_client(ClientType::Standard)?, settings))
    }

    pub fn with_client(client: Client, settings: GeminiSettings) -> Self {
        Self { client, settings }
    }

    fn endpoint(&self, api_key: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.model,
            api_key
        )
    }
}

#[async_trait]
impl InsightGenerator for GeminiClient {
    async fn generate(&self, company_name: &str, urls: &[String]) -> Result<String> {
        let api_key = match self.settings.api_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => anyhow::bail!("API_KEY_MISSING: set GEMINI_API_KEY to enable insights"),
        };

        let request_body = json!({
            "contents": [{
                "parts": [{
                    "text": build_prompt(company_name, urls)
                }]
            }]
        });

        let response = self
            .client
            .post(self.endpoint(api_key))
            .timeout(self.settings.timeout)
            .header("Content-Type", "application/json")
            .body(request_body.to_string())
            .send()
            .await
            .context("Failed to send request to Gemini API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error {}: {}", status, error_text);
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse Gemini API response")?;

        let text = response_json["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .context("Failed to extract text from Gemini response")?
            .trim()
            .to_string();

        if text.is_empty() {
            anyhow::bail!("Gemini returned an empty insight");
        }
        Ok(text)
    }
}

pub fn build_prompt(company_name: &str, urls: &[String]) -> String {
    let mut listed = urls
        .iter()
        .take(PROMPT_URL_LIMIT)
        .map(|u| format!("- {}", u))
        .collect::<Vec<_>>()
        .join("\n");

    if urls.is_empty() {
        listed = "(no pages could be discovered)".to_string();
    } else if urls.len() > PROMPT_URL_LIMIT {
        listed.push_str(&format!("\n... and {} more", urls.len() - PROMPT_URL_LIMIT));
    }

    format!(
        r#"You are a market research analyst. Based only on the page addresses below, describe what {company} most likely does, who its customers are, and which products or services it emphasises.

Company: {company}
Pages found on its website ({count} total):
{listed}

Answer in at most three short paragraphs. Say so plainly if the pages are not enough to tell."#,
        company = company_name,
        count = urls.len(),
        listed = listed,
    )
}

/// Insight generation behind the shared circuit breaker.
#[derive(Clone)]
pub struct GuardedInsight {
    breaker: Arc<CircuitBreaker>,
    generator: Arc<dyn InsightGenerator>,
}

impl GuardedInsight {
    pub fn new(breaker: Arc<CircuitBreaker>, generator: Arc<dyn InsightGenerator>) -> Self {
        Self { breaker, generator }
    }

    pub async fn generate(&self, company_name: &str, urls: &[String]) -> crate::error::Result<String> {
        let generator = self.generator.clone();
        self.breaker
            .call(|| async move { generator.generate(company_name, urls).await })
            .await
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}
