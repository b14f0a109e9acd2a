//! Post source backed by the public Bluesky search API.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;

use super::PostSource;
use crate::error::ProcessError;
use crate::models::{CollectConfig, RawPost};
use crate::utils::http::retry_after;

const SEARCH_PATH: &str = "/xrpc/app.bsky.feed.searchPosts";
const PAGE_SIZE: usize = 100;
const LINK_FACET: &str = "app.bsky.richtext.facet#link";

/// Searches public posts matching a query for one day.
pub struct BlueskySearch {
    client: Client,
    api_url: String,
    query: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    posts: Vec<PostView>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostView {
    uri: String,
    author: Author,
    record: PostRecord,
    #[serde(default)]
    embed: Option<Embed>,
    #[serde(default)]
    like_count: u32,
    #[serde(default)]
    repost_count: u32,
    #[serde(default)]
    reply_count: u32,
}

#[derive(Debug, Deserialize)]
struct Author {
    handle: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostRecord {
    #[serde(default)]
    text: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    langs: Vec<String>,
    #[serde(default)]
    facets: Vec<Facet>,
}

#[derive(Debug, Deserialize)]
struct Facet {
    #[serde(default)]
    features: Vec<FacetFeature>,
}

#[derive(Debug, Deserialize)]
struct FacetFeature {
    #[serde(rename = "$type")]
    kind: String,
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Embed {
    external: Option<External>,
}

#[derive(Debug, Deserialize)]
struct External {
    uri: String,
}

impl PostView {
    fn into_raw(self) -> RawPost {
        let mut links: Vec<String> = self
            .record
            .facets
            .iter()
            .flat_map(|f| &f.features)
            .filter(|f| f.kind == LINK_FACET)
            .filter_map(|f| f.uri.clone())
            .collect();
        if let Some(external) = self.embed.and_then(|e| e.external) {
            links.push(external.uri);
        }
        links.dedup();

        RawPost {
            id: self.uri,
            author: self.author.handle,
            text: self.record.text,
            created_at: self.record.created_at,
            links,
            likes: self.like_count,
            reposts: self.repost_count,
            replies: self.reply_count,
            langs: self.record.langs,
        }
    }
}

impl BlueskySearch {
    pub fn new(client: Client, config: &CollectConfig) -> Self {
        Self {
            client,
            api_url: config.bluesky_api_url.trim_end_matches('/').to_string(),
            query: config.query.clone(),
        }
    }

    async fn page(
        &self,
        since: &str,
        until: &str,
        cursor: Option<&str>,
    ) -> Result<SearchResponse, ProcessError> {
        let url = format!("{}{SEARCH_PATH}", self.api_url);
        let limit = PAGE_SIZE.to_string();
        let mut params = vec![
            ("q", self.query.as_str()),
            ("since", since),
            ("until", until),
            ("limit", limit.as_str()),
            ("sort", "latest"),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor));
        }

        let response = self.client.get(&url).query(&params).send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProcessError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            return Err(ProcessError::Http {
                status: status.as_u16(),
                url,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PostSource for BlueskySearch {
    fn name(&self) -> String {
        format!("bluesky:{}", self.query)
    }

    async fn posts(
        &self,
        partition: NaiveDate,
        limit: usize,
    ) -> Result<Vec<RawPost>, ProcessError> {
        let start = partition
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .ok_or_else(|| ProcessError::InvalidIdentity(partition.to_string()))?;
        let since = start.to_rfc3339();
        let until = (start + Duration::days(1)).to_rfc3339();

        let mut posts = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.page(&since, &until, cursor.as_deref()).await?;
            let fetched = page.posts.len();
            posts.extend(
                page.posts
                    .into_iter()
                    .map(PostView::into_raw)
                    .filter(|p| p.posted_on() == partition),
            );
            log::debug!("Bluesky page: {} posts (total {})", fetched, posts.len());

            match page.cursor {
                Some(next) if fetched > 0 && posts.len() < limit => cursor = Some(next),
                _ => break,
            }
        }

        posts.truncate(limit);
        Ok(posts)
    }
}
