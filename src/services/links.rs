// src/services/links.rs

//! Shortened-link expansion over HTTP.

use async_trait::async_trait;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};

use super::LinkExpander;
use crate::error::ProcessError;
use crate::utils::url::is_excluded;

/// Resolves links on known shortener domains by following their redirects.
/// Other links are returned unchanged without a request.
pub struct HttpLinkExpander {
    client: Client,
    shorteners: Vec<String>,
}

impl HttpLinkExpander {
    /// `client` must follow redirects.
    pub fn new(client: Client, shorteners: Vec<String>) -> Self {
        Self { client, shorteners }
    }

    pub fn is_shortened(&self, url: &str) -> bool {
        is_excluded(url, &self.shorteners)
    }
}

#[async_trait]
impl LinkExpander for HttpLinkExpander {
    async fn expand(&self, url: &str) -> Result<String, ProcessError> {
        if !self.is_shortened(url) {
            return Ok(url.to_string());
        }

        let response = self.client.head(url).send().await?;
        // Some shorteners refuse HEAD
        let response = match response.status() {
            StatusCode::METHOD_NOT_ALLOWED
            | StatusCode::FORBIDDEN
            | StatusCode::NOT_IMPLEMENTED => {
                self.client.get(url).header(RANGE, "bytes=0-0").send().await?
            }
            _ => response,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ProcessError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let target = response.url();
        if !matches!(target.scheme(), "http" | "https") {
            return Err(ProcessError::InvalidIdentity(format!(
                "{url} redirects to {target}"
            )));
        }
        log::debug!("Expanded {} -> {}", url, target);
        Ok(target.to_string())
    }
}
