//! Text-generation clients. Both keep a short conversation history so each
//! segment is translated with the previous ones in context.

use std::collections::VecDeque;
use std::time::Duration;
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use crate::config::{Provider, TranslationConfig};
use crate::error::BackendError;

/// Token accounting reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub text: String,
    pub usage: Usage,
}

/// A conversational text-generation service
#[async_trait]
pub trait TranslationBackend: Send {
    /// Reset the conversation and seed it with `instructions`
    async fn start_session(&mut self, instructions: &str) -> Result<(), BackendError>;
    /// Send the next user message within the current session
    async fn send(&mut self, text: &str) -> Result<Reply, BackendError>;
}

/// Build the backend named by the configuration
pub fn from_config(cfg: &TranslationConfig) -> Result<Box<dyn TranslationBackend>, BackendError> {
    let api_key = std::env::var(cfg.api_key_env())
        .map_err(|_| BackendError::MissingKey(cfg.api_key_env().to_string()))?;
    let client = Client::builder()
        .timeout(Duration::from_secs(600))
        .build()
        .map_err(|e| BackendError::Connection(e.to_string()))?;

    Ok(match cfg.provider {
        Provider::OpenAi => Box::new(OpenAiChat::new(client, cfg, api_key)),
        Provider::Gemini => Box::new(GeminiChat::new(client, cfg, api_key)),
    })
}

/// Past exchanges, oldest first, capped at `limit` turns
#[derive(Debug, Default)]
struct History {
    turns: VecDeque<(String, String)>,
    limit: usize,
}

impl History {
    fn new(limit: usize) -> Self {
        History { turns: VecDeque::new(), limit }
    }

    fn push(&mut self, user: &str, model: &str) {
        self.turns.push_back((user.to_string(), model.to_string()));
        while self.turns.len() > self.limit {
            self.turns.pop_front();
        }
    }
}

async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
    request: reqwest::RequestBuilder,
    body: &B,
) -> Result<R, BackendError> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| BackendError::Connection(e.to_string()))?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        let text = response.text().await.unwrap_or_default();
        return Err(BackendError::Auth(text));
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(BackendError::Status { status: status.as_u16(), body: text });
    }

    response.json().await.map_err(|e| BackendError::Decode(e.to_string()))
}

// OpenAI-compatible chat completions

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ChatReplyMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub struct OpenAiChat {
    client: Client,
    url: String,
    model: String,
    api_key: String,
    system: String,
    history: History,
}

impl OpenAiChat {
    pub fn new(client: Client, cfg: &TranslationConfig, api_key: String) -> Self {
        let base = cfg.endpoint.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        OpenAiChat {
            client,
            url: format!("{}/chat/completions", base.trim_end_matches('/')),
            model: cfg.model().to_string(),
            api_key,
            system: String::new(),
            history: History::new(cfg.history_turns),
        }
    }
}

#[async_trait]
impl TranslationBackend for OpenAiChat {
    async fn start_session(&mut self, instructions: &str) -> Result<(), BackendError> {
        self.system = instructions.to_string();
        self.history = History::new(self.history.limit);
        Ok(())
    }

    async fn send(&mut self, text: &str) -> Result<Reply, BackendError> {
        let mut messages = vec![ChatMessage { role: "system", content: &self.system }];
        for (user, model) in &self.history.turns {
            messages.push(ChatMessage { role: "user", content: user });
            messages.push(ChatMessage { role: "assistant", content: model });
        }
        messages.push(ChatMessage { role: "user", content: text });

        let body = ChatRequest { model: &self.model, messages };
        debug!("OpenAI request: model {}, {} messages", self.model, body.messages.len());

        let response: ChatResponse =
            post_json(self.client.post(&self.url).bearer_auth(&self.api_key), &body).await?;

        let reply = Reply {
            text: response
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default(),
            usage: response
                .usage
                .map(|u| Usage { prompt_tokens: u.prompt_tokens, completion_tokens: u.completion_tokens })
                .unwrap_or_default(),
        };

        self.history.push(text, &reply.text);
        Ok(reply)
    }
}

// Gemini generateContent

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    system_instruction: GeminiContent<'a>,
    contents: Vec<GeminiContent<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiReplyContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiReplyContent {
    #[serde(default)]
    parts: Vec<GeminiReplyPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiReplyPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

pub struct GeminiChat {
    client: Client,
    url: String,
    api_key: String,
    system: String,
    history: History,
}

impl GeminiChat {
    pub fn new(client: Client, cfg: &TranslationConfig, api_key: String) -> Self {
        let base = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string());
        GeminiChat {
            client,
            url: format!("{}/models/{}:generateContent", base.trim_end_matches('/'), cfg.model()),
            api_key,
            system: String::new(),
            history: History::new(cfg.history_turns),
        }
    }
}

#[async_trait]
impl TranslationBackend for GeminiChat {
    async fn start_session(&mut self, instructions: &str) -> Result<(), BackendError> {
        self.system = instructions.to_string();
        self.history = History::new(self.history.limit);
        Ok(())
    }

    async fn send(&mut self, text: &str) -> Result<Reply, BackendError> {
        let mut contents = Vec::new();
        for (user, model) in &self.history.turns {
            contents.push(GeminiContent { role: Some("user"), parts: vec![GeminiPart { text: user }] });
            contents.push(GeminiContent { role: Some("model"), parts: vec![GeminiPart { text: model }] });
        }
        contents.push(GeminiContent { role: Some("user"), parts: vec![GeminiPart { text }] });

        let body = GeminiRequest {
            system_instruction: GeminiContent { role: None, parts: vec![GeminiPart { text: &self.system }] },
            contents,
        };
        debug!("Gemini request: {} contents", body.contents.len());

        let request = self.client.post(&self.url).header("x-goog-api-key", &self.api_key);
        let response: GeminiResponse = post_json(request, &body).await?;

        let reply = Reply {
            text: response
                .candidates
                .into_iter()
                .next()
                .and_then(|c| c.content)
                .map(|c| c.parts.into_iter().map(|p| p.text).collect::<Vec<_>>().join(""))
                .unwrap_or_default(),
            usage: response
                .usage_metadata
                .map(|u| Usage { prompt_tokens: u.prompt_token_count, completion_tokens: u.candidates_token_count })
                .unwrap_or_default(),
        };

        self.history.push(text, &reply.text);
        Ok(reply)
    }
}
