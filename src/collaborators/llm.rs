//! OpenAI-compatible chat-completion client (Groq-hosted Llama by default).
//!
//! Serves both as the RAG answer [`Generator`] and as the researcher's
//! [`Summarizer`].
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CollaboratorError, Draft, Generator, Summarizer, WebHit};
use crate::config::GenerationConfig;
use crate::db::models::Document;

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Shape the summarizer is asked to reply with.
#[derive(Debug, Deserialize)]
struct DraftReply {
    answer: String,
    #[serde(default)]
    confidence: Option<f32>,
}

// ── Client ───────────────────────────────────────────────────────────

pub struct ChatCompletionClient {
    http: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
    temperature: f32,
    max_tokens: u32,
}

impl ChatCompletionClient {
    /// Build a client; the API key is read from `config.api_key_env` now
    /// and reported as missing only when a request is attempted.
    ///
    /// Every request is bounded by `config.timeout_secs`.
    pub fn new(config: &GenerationConfig) -> Result<Self, CollaboratorError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty()),
            api_key_env: config.api_key_env.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, CollaboratorError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| CollaboratorError::MissingCredential(self.api_key_env.clone()))?;

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(CollaboratorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Decode(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        debug!(model = %self.model, chars = content.len(), "Chat completion received");
        if content.is_empty() {
            return Err(CollaboratorError::Decode("empty completion".into()));
        }
        Ok(content)
    }
}

#[async_trait]
impl Generator for ChatCompletionClient {
    async fn generate(&self, query: &str, documents: &[Document]) -> Result<String, CollaboratorError> {
        self.complete(ANSWER_SYSTEM_PROMPT, &answer_prompt(query, documents))
            .await
    }
}

#[async_trait]
impl Summarizer for ChatCompletionClient {
    async fn draft(&self, query: &str, hits: &[WebHit]) -> Result<Draft, CollaboratorError> {
        let reply = self
            .complete(RESEARCH_SYSTEM_PROMPT, &research_prompt(query, hits))
            .await?;
        parse_draft(&reply, hits)
    }
}

// ── Prompts ──────────────────────────────────────────────────────────

const ANSWER_SYSTEM_PROMPT: &str = "คุณคือ \"น้องน่าน\" ผู้ช่วยแนะนำการท่องเที่ยวจังหวัดน่าน \
ตอบเป็นภาษาเดียวกับคำถาม สุภาพ กระชับ และใช้เฉพาะข้อมูลจากเอกสารที่ให้มาเท่านั้น \
ถ้าเอกสารไม่มีคำตอบ ให้บอกตรง ๆ ว่าไม่มีข้อมูล ห้ามเดา";

const RESEARCH_SYSTEM_PROMPT: &str = "You research tourism facts about Nan province, Thailand. \
Using only the search results provided, write a short factual answer in the language of the question. \
Reply with a single JSON object: {\"answer\": string, \"confidence\": number between 0 and 1}. \
If the results do not answer the question, reply with an empty answer and confidence 0.";

/// Number retrieved documents as `[Document i]` blocks.
#[must_use]
pub fn format_context(documents: &[Document]) -> String {
    documents
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            let title = doc.payload_str("title").unwrap_or("-");
            format!("[Document {}]\nTitle: {}\nInfo: {}", i + 1, title, doc.text)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn answer_prompt(query: &str, documents: &[Document]) -> String {
    format!(
        "ข้อมูลอ้างอิง:\n{}\n\nคำถาม: \"{}\"\n\nคำตอบ:",
        format_context(documents),
        query
    )
}

fn research_prompt(query: &str, hits: &[WebHit]) -> String {
    let mut out = format!("Question: {query}\n");
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!(
            "\n--- Result {} ---\nTitle: {}\nSnippet: {}\nSource: {}\n",
            i + 1,
            hit.title,
            hit.snippet,
            hit.url
        ));
    }
    out
}

/// Parse a summarizer reply into a [`Draft`] citing `hits` in order.
///
/// Tolerates code fences and prose around the JSON object. A missing
/// confidence defaults to 0.5.
pub fn parse_draft(reply: &str, hits: &[WebHit]) -> Result<Draft, CollaboratorError> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &reply[s..=e],
        _ => return Err(CollaboratorError::Decode(format!("no JSON object in reply: {reply}"))),
    };
    let parsed: DraftReply =
        serde_json::from_str(json).map_err(|e| CollaboratorError::Decode(e.to_string()))?;

    Ok(Draft {
        answer: parsed.answer.trim().to_string(),
        source_refs: hits.iter().map(|h| h.url.clone()).filter(|u| !u.is_empty()).collect(),
        confidence: parsed.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Payload;
    use serde_json::json;

    fn hits() -> Vec<WebHit> {
        vec![
            WebHit {
                url: "https://example.org/a".into(),
                title: "A".into(),
                snippet: "เปิด 06:00-18:00".into(),
            },
            WebHit {
                url: String::new(),
                title: "no link".into(),
                snippet: String::new(),
            },
        ]
    }

    #[test]
    fn test_parse_draft_plain_json() {
        let d = parse_draft(r#"{"answer": " เปิด 06:00-18:00 ", "confidence": 0.9}"#, &hits()).unwrap();
        assert_eq!(d.answer, "เปิด 06:00-18:00");
        assert!((d.confidence - 0.9).abs() < 1e-6);
        assert_eq!(d.source_refs, vec!["https://example.org/a".to_string()]);
    }

    #[test]
    fn test_parse_draft_fenced_with_defaults() {
        let reply = "Here you go:\n```json\n{\"answer\": \"x\"}\n```";
        let d = parse_draft(reply, &[]).unwrap();
        assert_eq!(d.answer, "x");
        assert!((d.confidence - 0.5).abs() < 1e-6);

        let d = parse_draft(r#"{"answer": "x", "confidence": 7}"#, &[]).unwrap();
        assert!((d.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_draft_rejects_garbage() {
        assert!(matches!(parse_draft("no idea", &[]), Err(CollaboratorError::Decode(_))));
        assert!(parse_draft(r#"{"confidence": 1}"#, &[]).is_err());
    }

    #[test]
    fn test_format_context_numbers_documents() {
        let mut payload = Payload::new();
        payload.insert("title".into(), json!("วัดภูมินทร์"));
        payload.insert("text_content".into(), json!("จิตรกรรมฝาผนังปู่ม่านย่าม่าน"));
        let doc = Document::from_payload("wat-phumin".into(), payload);
        let ctx = format_context(&[doc.clone(), doc]);
        assert!(ctx.starts_with("[Document 1]\nTitle: วัดภูมินทร์\nInfo: จิตรกรรม"));
        assert!(ctx.contains("[Document 2]"));
    }

    #[tokio::test]
    async fn test_missing_key_is_reported() {
        let config = GenerationConfig {
            api_key_env: "NANGUIDE_TEST_UNSET_LLM_KEY".into(),
            ..GenerationConfig::default()
        };
        let client = ChatCompletionClient::new(&config).unwrap();
        let err = client.generate("q", &[]).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::MissingCredential(ref v) if v == "NANGUIDE_TEST_UNSET_LLM_KEY"));
    }
}
