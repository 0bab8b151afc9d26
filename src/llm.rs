//! Answer generation from retrieved context.
//!
//! The prompt is chosen from the question:
//!
//! | Case | Prompt |
//! |------|--------|
//! | JSON output requested | JSON array of `{name, type, path}` objects only |
//! | question asks for a list or table | markdown table with Name, Type and Path columns |
//! | otherwise | short plain answer |
//!
//! The model only ever sees the merged retrieval context and the question.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Credential, LlmConfig};

const OPENAI_URL: &str = "https://api.openai.com";

/// Words that signal the user wants rows rather than prose.
const TABLE_KEYWORDS: &[&str] = &["list", "table", "components", "enumerate", "show", "paths"];

/// Produces an answer for a fully built prompt.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Which prompt template a question gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Json,
    Table,
    Concise,
}

/// Whether the question reads like a request for a list or table.
pub fn wants_table(question: &str) -> bool {
    let q = question.to_lowercase();
    TABLE_KEYWORDS.iter().any(|k| q.contains(k))
}

pub fn prompt_kind(question: &str, json: bool) -> PromptKind {
    if json {
        PromptKind::Json
    } else if wants_table(question) {
        PromptKind::Table
    } else {
        PromptKind::Concise
    }
}

/// Fill the template for `question` with the retrieval `context`.
pub fn build_prompt(question: &str, context: &str, json: bool) -> String {
    match prompt_kind(question, json) {
        PromptKind::Json => format!(
            "You describe Adobe Experience Manager (AEM) content as structured JSON.\n\n\
             Context:\n{context}\n\n\
             Question: {question}\n\n\
             Respond with valid JSON only: an array of objects such as\n\
             [\n  {{\"name\": \"componentName\", \"type\": \"cq:Component\", \"path\": \"/content/...\"}}\n]\n"
        ),
        PromptKind::Table => format!(
            "You extract structured data about Adobe Experience Manager (AEM) components.\n\n\
             Using the context below, find the relevant items and present them as a markdown \
             table with the columns **Name**, **Type** and **Path**, plus any other fields the \
             context supports.\n\n\
             Context:\n{context}\n\n\
             Question: {question}\n\n\
             Reply with the markdown table and its header row only.\n"
        ),
        PromptKind::Concise => format!(
            "You answer questions about Adobe Experience Manager (AEM) content.\n\
             Answer clearly and briefly from the context below.\n\n\
             Context:\n{context}\n\n\
             Question: {question}\n"
        ),
    }
}

pub struct DisabledGenerator;

#[async_trait]
impl AnswerGenerator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &str) -> Result<String> {
        bail!("Answer generation is disabled")
    }
}

/// Generator backed by the OpenAI chat completions API.
pub struct OpenAiChat {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    credential: Credential,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig, credential: Credential) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            credential,
        })
    }
}

#[async_trait]
impl AnswerGenerator for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .bearer_auth(self.credential.secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
    }
}

pub fn create_generator(
    config: &LlmConfig,
    credential: Option<Credential>,
) -> Result<Arc<dyn AnswerGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => {
            let credential = credential
                .ok_or_else(|| anyhow::anyhow!("OpenAI chat requires an API credential"))?;
            Ok(Arc::new(OpenAiChat::new(config, credential)?))
        }
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn table_keywords_are_case_insensitive() {
        assert!(wants_table("List all hero components"));
        assert!(wants_table("SHOW me the PATHS"));
        assert!(!wants_table("What is the site title?"));
    }

    #[test]
    fn json_request_wins_over_table_words() {
        assert_eq!(prompt_kind("list components", true), PromptKind::Json);
        assert_eq!(prompt_kind("list components", false), PromptKind::Table);
        assert_eq!(prompt_kind("who wrote this", false), PromptKind::Concise);
    }

    #[test]
    fn prompt_contains_context_and_question() {
        let prompt = build_prompt("What is the title?", "jcr:title: Home", false);
        assert!(prompt.contains("Context:\njcr:title: Home"));
        assert!(prompt.contains("Question: What is the title?"));

        let json_prompt = build_prompt("components", "ctx", true);
        assert!(json_prompt.contains("\"type\": \"cq:Component\""));
    }

    #[tokio::test]
    async fn chat_completion_content_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-chat"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini", "temperature": 0.0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "The title is Home."}}]
            })))
            .mount(&server)
            .await;

        let config = LlmConfig {
            url: Some(server.uri()),
            ..LlmConfig::default()
        };
        let chat = OpenAiChat::new(&config, Credential::new("sk-chat")).unwrap();
        assert_eq!(chat.generate("q").await.unwrap(), "The title is Home.");
    }

    #[tokio::test]
    async fn chat_error_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let config = LlmConfig {
            url: Some(server.uri()),
            ..LlmConfig::default()
        };
        let chat = OpenAiChat::new(&config, Credential::new("wrong")).unwrap();
        let err = chat.generate("q").await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
