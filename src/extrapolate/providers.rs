//! HTTP adapters for the hosted model APIs. Each provider speaks its own
//! wire format but all of them reduce to "send the signature list, get a
//! JSON completion back".

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ResolveError, Result};

use super::{parse_model_response, Extrapolation, ModelProvider, ProviderId, SYSTEM_PROMPT};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MODEL: &str = "claude-3-opus-20240229";

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const OPENAI_MODEL: &str = "gpt-4o-mini";

const GEMINI_API_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent";

fn user_prompt(signatures: &[String]) -> String {
    serde_json::to_string(signatures).unwrap_or_else(|_| "[]".to_string())
}

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(client: Client, api_key: String) -> Self {
        Self { client, api_key }
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    async fn extrapolate(&self, signatures: &[String]) -> Result<Extrapolation> {
        debug!("Requesting extrapolation of {} signatures from Anthropic", signatures.len());
        let body = json!({
            "model": ANTHROPIC_MODEL,
            "max_tokens": 2048,
            "system": SYSTEM_PROMPT,
            "messages": [{"role": "user", "content": user_prompt(signatures)}]
        });

        let response: Value = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_model_response(&anthropic_text(&response)?)
    }
}

fn anthropic_text(response: &Value) -> Result<String> {
    response["content"][0]["text"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ResolveError::Provider("anthropic response carried no text block".to_string()))
}

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(client: Client, api_key: String) -> Self {
        Self { client, api_key }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Openai
    }

    async fn extrapolate(&self, signatures: &[String]) -> Result<Extrapolation> {
        debug!("Requesting extrapolation of {} signatures from OpenAI", signatures.len());
        let body = json!({
            "model": OPENAI_MODEL,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt(signatures)}
            ]
        });

        let response: Value = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_model_response(&openai_text(&response)?)
    }
}

fn openai_text(response: &Value) -> Result<String> {
    response["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ResolveError::Provider("openai response carried no message content".to_string()))
}

pub struct GeminiProvider {
    client: Client,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(client: Client, api_key: String) -> Self {
        Self { client, api_key }
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    async fn extrapolate(&self, signatures: &[String]) -> Result<Extrapolation> {
        debug!("Requesting extrapolation of {} signatures from Gemini", signatures.len());
        let body = json!({
            "systemInstruction": {"parts": [{"text": SYSTEM_PROMPT}]},
            "contents": [{"role": "user", "parts": [{"text": user_prompt(signatures)}]}],
            "generationConfig": {"responseMimeType": "application/json"}
        });

        let response: Value = self
            .client
            .post(GEMINI_API_URL)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_model_response(&gemini_text(&response)?)
    }
}

fn gemini_text(response: &Value) -> Result<String> {
    response["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ResolveError::Provider("gemini response carried no candidate text".to_string()))
}
