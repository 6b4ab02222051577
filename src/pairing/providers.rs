//! AI pairing providers.
//!
//! Thin chat-completion clients over reqwest. Each provider turns the request
//! plus the available-inventory snapshot into a prompt and parses the model's
//! JSON reply into wine selections. Malformed replies are provider errors;
//! the orchestrator falls through to the next provider in the chain.

use crate::error::{CoreError, CoreResult};
use crate::models::StockView;
use crate::pairing::{PairingRequest, ProviderKind, WineSelection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

#[async_trait]
pub trait PairingProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn recommend(
        &self,
        request: &PairingRequest,
        inventory: &[StockView],
    ) -> CoreResult<Vec<WineSelection>>;
}

/// Chat-completion client shared by both hosted providers; they differ only
/// in endpoint, model name, and key.
#[derive(Clone)]
pub struct ChatCompletionProvider {
    http: reqwest::Client,
    kind: ProviderKind,
    url: String,
    model: String,
    api_key: String,
}

impl ChatCompletionProvider {
    pub fn deepseek(http: reqwest::Client, api_key: String) -> Self {
        Self {
            http,
            kind: ProviderKind::PrimaryAi,
            url: "https://api.deepseek.com/chat/completions".to_string(),
            model: "deepseek-chat".to_string(),
            api_key,
        }
    }

    pub fn openai(http: reqwest::Client, api_key: String) -> Self {
        Self {
            http,
            kind: ProviderKind::SecondaryAi,
            url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key,
        }
    }

    #[cfg(test)]
    pub fn with_url(mut self, url: String) -> Self {
        self.url = url;
        self
    }

    pub(crate) async fn chat_completion(&self, system: &str, user: &str) -> CoreResult<String> {
        let start = Instant::now();
        let req = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(0.3),
            max_tokens: Some(1200),
        };

        let resp = self
            .http
            .post(&self.url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::ProviderTimeout(format!("{}: {e}", self.kind.as_str()))
                } else {
                    CoreError::ProviderError(format!("{}: {e}", self.kind.as_str()))
                }
            })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(CoreError::ProviderError(format!(
                "{} {}: {}",
                self.kind.as_str(),
                status.as_u16(),
                snippet
            )));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| CoreError::ProviderError(format!("{} json: {e}", self.kind.as_str())))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        debug!(
            provider = self.kind.as_str(),
            latency_ms = start.elapsed().as_millis() as u64,
            "🤖 Provider call complete"
        );
        Ok(content)
    }
}

#[async_trait]
impl PairingProvider for ChatCompletionProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn recommend(
        &self,
        request: &PairingRequest,
        inventory: &[StockView],
    ) -> CoreResult<Vec<WineSelection>> {
        if inventory.is_empty() {
            return Err(CoreError::ProviderError(
                "no available inventory to pair against".to_string(),
            ));
        }
        let content = self
            .chat_completion(SOMMELIER_SYSTEM_PROMPT, &build_user_prompt(request, inventory))
            .await?;
        parse_selections(&content, self.kind)
    }
}

const SOMMELIER_SYSTEM_PROMPT: &str = "You are the head sommelier on a luxury yacht. \
Recommend wines for the dish strictly from the provided cellar list. \
Reply with a JSON array only, no prose: \
[{\"vintage_id\": <int from the list>, \"confidence\": <0..1>, \"reasoning\": \"<one sentence>\"}]. \
Order by confidence descending.";

fn build_user_prompt(request: &PairingRequest, inventory: &[StockView]) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&format!("Dish: {}\n", request.dish));
    if let Some(occasion) = request.context.occasion.as_deref() {
        prompt.push_str(&format!("Occasion: {occasion}\n"));
    }
    if let Some(guests) = request.context.guest_count {
        prompt.push_str(&format!("Guests: {guests}\n"));
    }
    if let Some(season) = request.context.season.as_deref() {
        prompt.push_str(&format!("Season: {season}\n"));
    }
    if let Some(weather) = request.context.weather.as_deref() {
        prompt.push_str(&format!("Weather: {weather}\n"));
    }
    if !request.preferences.trim().is_empty() {
        prompt.push_str(&format!("Guest preferences: {}\n", request.preferences));
    }
    prompt.push_str(&format!(
        "Return at most {} selections.\n\nCellar (vintage_id | wine | year | type | region | bottles available):\n",
        request.options.max_recommendations
    ));
    for view in inventory.iter().take(60) {
        prompt.push_str(&format!(
            "{} | {} {} | {} | {} | {} | {}\n",
            view.vintage_id,
            view.producer,
            view.wine_name,
            view.year,
            view.wine_type.as_str(),
            view.region,
            view.available,
        ));
    }
    prompt
}

/// Accepts a bare JSON array or one wrapped in markdown fences.
pub(crate) fn parse_selections(
    content: &str,
    kind: ProviderKind,
) -> CoreResult<Vec<WineSelection>> {
    let trimmed = content.trim();
    let json = if let Some(start) = trimmed.find('[') {
        let end = trimmed
            .rfind(']')
            .ok_or_else(|| CoreError::ProviderError(format!("{}: unterminated json", kind.as_str())))?;
        &trimmed[start..=end]
    } else {
        return Err(CoreError::ProviderError(format!(
            "{}: reply carries no json array",
            kind.as_str()
        )));
    };

    let raw: Vec<RawSelection> = serde_json::from_str(json)
        .map_err(|e| CoreError::ProviderError(format!("{}: bad selection json: {e}", kind.as_str())))?;
    if raw.is_empty() {
        return Err(CoreError::ProviderError(format!(
            "{}: empty selection list",
            kind.as_str()
        )));
    }

    Ok(raw
        .into_iter()
        .map(|s| WineSelection {
            vintage_id: s.vintage_id,
            confidence: s.confidence.clamp(0.0, 1.0),
            reasoning: s.reasoning,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct RawSelection {
    vintage_id: i64,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    pub content: String,
}
