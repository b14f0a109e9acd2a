//! Relevance evaluator backed by the Anthropic Messages API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ArticleInput, Evaluation, Evaluator};
use crate::error::ProcessError;
use crate::models::EvaluateConfig;
use crate::utils::http::retry_after;
use crate::utils::truncate_chars;

const API_VERSION: &str = "2023-06-01";
pub const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

pub struct AnthropicEvaluator {
    client: Client,
    api_key: Option<String>,
    config: EvaluateConfig,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Shape the model is asked to answer with.
#[derive(Deserialize)]
struct Judgment {
    is_relevant: bool,
    relevance_score: f64,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    key_topics: Vec<String>,
    #[serde(default)]
    content_type: Option<String>,
}

impl AnthropicEvaluator {
    /// The API key is read from `ANTHROPIC_API_KEY`; without it every
    /// evaluation fails with a configuration error.
    pub fn from_env(client: Client, config: &EvaluateConfig) -> Self {
        let api_key = std::env::var(API_KEY_VAR)
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self {
            client,
            api_key,
            config: config.clone(),
        }
    }

    fn prompt(&self, article: ArticleInput<'_>) -> String {
        let text = truncate_chars(article.text, self.config.max_input_chars);
        format!(
            "You are screening articles for a daily digest about {topic}.\n\
             Decide whether the article below is substantially about {topic}.\n\n\
             Answer with a single JSON object and nothing else:\n\
             {{\"is_relevant\": bool, \"relevance_score\": number between 0 and 1, \
             \"summary\": \"two sentences\", \"key_topics\": [\"...\"], \
             \"content_type\": \"tutorial|news|opinion|announcement|other\"}}\n\n\
             URL: {url}\nTitle: {title}\n\n---\n{text}\n---",
            topic = self.config.topic,
            url = article.url,
            title = article.title.unwrap_or("(none)"),
        )
    }
}

/// Pull the JSON object out of a model reply that may wrap it in prose or fences.
fn parse_judgment(reply: &str) -> Result<Judgment, ProcessError> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &reply[s..=e],
        _ => {
            return Err(ProcessError::Unparseable(
                "model reply holds no JSON object".into(),
            ));
        }
    };
    serde_json::from_str(json).map_err(|e| ProcessError::Unparseable(e.to_string()))
}

#[async_trait]
impl Evaluator for AnthropicEvaluator {
    async fn evaluate(&self, article: ArticleInput<'_>) -> Result<Evaluation, ProcessError> {
        let Some(api_key) = &self.api_key else {
            return Err(ProcessError::Configuration(format!("{API_KEY_VAR} is not set")));
        };

        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            messages: [Message {
                role: "user",
                content: self.prompt(article),
            }],
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status().as_u16();
        match status {
            200..=299 => {}
            401 | 403 => {
                return Err(ProcessError::Configuration(format!(
                    "API key rejected (HTTP {status})"
                )));
            }
            429 => {
                return Err(ProcessError::RateLimited {
                    retry_after: retry_after(response.headers()),
                });
            }
            _ => {
                return Err(ProcessError::Http {
                    status,
                    url: self.config.api_url.clone(),
                });
            }
        }

        let body: MessagesResponse = response.json().await?;
        let reply: String = body
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .collect();
        let judgment = parse_judgment(&reply)?;

        Ok(Evaluation {
            is_relevant: judgment.is_relevant,
            relevance_score: judgment.relevance_score,
            summary: judgment.summary,
            key_topics: judgment.key_topics,
            content_type: judgment.content_type,
            model: if body.model.is_empty() {
                self.config.model.clone()
            } else {
                body.model
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"is_relevant\": true, \"relevance_score\": 0.8, \
                     \"summary\": \"About MCP.\", \"key_topics\": [\"mcp\"]}\n```";
        let judgment = parse_judgment(reply).unwrap();
        assert!(judgment.is_relevant);
        assert_eq!(judgment.relevance_score, 0.8);
        assert_eq!(judgment.key_topics, vec!["mcp".to_string()]);
        assert!(judgment.content_type.is_none());
    }

    #[test]
    fn test_parse_reply_without_json() {
        assert!(matches!(
            parse_judgment("I cannot help with that."),
            Err(ProcessError::Unparseable(_))
        ));
        assert!(parse_judgment("{\"summary\": \"missing fields\"}").is_err());
    }

    #[test]
    fn test_prompt_truncates_text() {
        let config = EvaluateConfig {
            max_input_chars: 10,
            ..EvaluateConfig::default()
        };
        let evaluator = AnthropicEvaluator {
            client: Client::new(),
            api_key: None,
            config,
        };
        let prompt = evaluator.prompt(ArticleInput {
            url: "https://example.com",
            title: None,
            text: "0123456789abcdef",
        });
        assert!(prompt.contains("---\n0123456789\n---"));
        assert!(prompt.contains("Title: (none)"));
    }

    #[tokio::test]
    async fn test_missing_key_is_configuration_error() {
        let evaluator = AnthropicEvaluator {
            client: Client::new(),
            api_key: None,
            config: EvaluateConfig::default(),
        };
        let err = evaluator
            .evaluate(ArticleInput {
                url: "https://example.com",
                title: None,
                text: "text",
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Configuration(_)));
    }
}
