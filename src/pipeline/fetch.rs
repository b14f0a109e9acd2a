//! Fetch stage: one item per distinct link found in collected posts.
//!
//! Links are deduplicated by their normalized URL, both within a run (one
//! unit per URL, carrying every post that referenced it) and across runs
//! (through the fetch registry).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use unicode_segmentation::UnicodeSegmentation;

use super::stage::{Stage, StageOutput, UnitInput, WorkUnit, upstream_items};
use crate::error::{ProcessError, Result};
use crate::models::{ArticleDetails, FetchConfig, StageDetails, StageId};
use crate::services::ArticleFetcher;
use crate::storage::ItemStore;
use crate::utils::hash_key;
use crate::utils::url::{get_domain, is_excluded, normalize_url};

pub struct FetchStage {
    fetcher: Arc<dyn ArticleFetcher>,
    exclude_domains: Vec<String>,
    min_word_count: usize,
}

impl FetchStage {
    pub fn new(
        fetcher: Arc<dyn ArticleFetcher>,
        exclude_domains: Vec<String>,
        config: &FetchConfig,
    ) -> Self {
        Self {
            fetcher,
            exclude_domains,
            min_word_count: config.min_word_count,
        }
    }

    pub fn item_key(identity: &str) -> String {
        hash_key("url", identity)
    }
}

#[async_trait]
impl Stage for FetchStage {
    fn id(&self) -> StageId {
        StageId::Fetched
    }

    async fn discover(&self, store: &ItemStore, partition: NaiveDate) -> Result<Vec<WorkUnit>> {
        let upstream = upstream_items(store, StageId::Collected, partition, true).await?;
        let mut units: BTreeMap<String, WorkUnit> = BTreeMap::new();

        for item in &upstream.items {
            let StageDetails::Post(post) = &item.metadata.details else {
                continue;
            };
            for link in &post.links {
                if is_excluded(link, &self.exclude_domains) {
                    continue;
                }
                // Unparseable links keep their raw text as identity and fail permanently
                let identity = normalize_url(link).unwrap_or_else(|_| link.trim().to_string());

                let unit = units.entry(identity.clone()).or_insert_with(|| WorkUnit {
                    key: Self::item_key(&identity),
                    identity,
                    source_refs: Vec::new(),
                    published_hint: Some(post.posted_at),
                    input: UnitInput::Link(link.clone()),
                });
                if !unit.source_refs.contains(&item.metadata.key) {
                    unit.source_refs.push(item.metadata.key.clone());
                }
                if unit.published_hint.is_none_or(|t| post.posted_at < t) {
                    unit.published_hint = Some(post.posted_at);
                }
            }
        }

        log::debug!(
            "{} posts yielded {} distinct links",
            upstream.items.len(),
            units.len()
        );
        Ok(units.into_values().collect())
    }

    async fn transform(&self, unit: &WorkUnit) -> std::result::Result<StageOutput, ProcessError> {
        let UnitInput::Link(link) = &unit.input else {
            return Err(ProcessError::InvalidIdentity(format!(
                "{} is not a link",
                unit.identity
            )));
        };
        let url = normalize_url(link)?;
        let article = self.fetcher.fetch(&url).await?;

        let word_count = article.text.unicode_words().count();
        if word_count < self.min_word_count {
            return Err(ProcessError::Unparseable(format!(
                "{word_count} words, below minimum of {}",
                self.min_word_count
            )));
        }

        let domain = get_domain(&article.final_url).or_else(|| get_domain(&url));
        let body = match &article.title {
            Some(title) => format!("# {title}\n\n{}\n", article.text),
            None => format!("{}\n", article.text),
        };

        Ok(StageOutput {
            details: StageDetails::Article(ArticleDetails {
                url,
                title: article.title,
                author: article.author,
                domain,
                language: article.language,
                word_count,
                published_at: article.published_at,
            }),
            body,
        })
    }

    fn failure_details(&self, unit: &WorkUnit) -> StageDetails {
        let url = match &unit.input {
            UnitInput::Link(link) => link.clone(),
            _ => unit.identity.clone(),
        };
        StageDetails::Article(ArticleDetails::failed(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemMetadata, ItemStatus, PostDetails, WorkItem};
    use crate::services::FetchedArticle;
    use crate::storage::LocalBlobStore;
    use chrono::Utc;
    use tempfile::TempDir;

    struct StaticFetcher;

    #[async_trait]
    impl ArticleFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> std::result::Result<FetchedArticle, ProcessError> {
            if url.ends_with("/short") {
                return Ok(FetchedArticle {
                    final_url: url.into(),
                    text: "too short".into(),
                    ..FetchedArticle::default()
                });
            }
            Ok(FetchedArticle {
                final_url: url.into(),
                title: Some("A title".into()),
                text: "word ".repeat(60),
                ..FetchedArticle::default()
            })
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn post_item(key: &str, links: &[&str]) -> WorkItem {
        let now = Utc::now();
        WorkItem::new(
            ItemMetadata {
                stage: StageId::Collected,
                key: key.into(),
                partition: date(),
                identity: format!("at://a/{key}"),
                status: ItemStatus::Success,
                created_at: now,
                processed_at: now,
                source_refs: vec!["inbox".into()],
                error: None,
                details: StageDetails::Post(PostDetails {
                    post_id: format!("at://a/{key}"),
                    author: "a".into(),
                    posted_at: now,
                    links: links.iter().map(|l| l.to_string()).collect(),
                    likes: 0,
                    reposts: 0,
                    replies: 0,
                    language: None,
                }),
            },
            "text",
        )
    }

    fn stage() -> FetchStage {
        FetchStage::new(
            Arc::new(StaticFetcher),
            vec!["bsky.app".into()],
            &FetchConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_discover_merges_links_across_posts() {
        let tmp = TempDir::new().unwrap();
        let store = ItemStore::new(Arc::new(LocalBlobStore::new(tmp.path())));
        store
            .write(&post_item(
                "post_1",
                &["https://example.com/a?utm_source=x", "https://bsky.app/profile/x"],
            ))
            .await
            .unwrap();
        store
            .write(&post_item("post_2", &["https://example.com/a#top", "not a url"]))
            .await
            .unwrap();

        let units = stage().discover(&store, date()).await.unwrap();
        assert_eq!(units.len(), 2);

        let article = units
            .iter()
            .find(|u| u.identity == "https://example.com/a")
            .unwrap();
        assert_eq!(article.source_refs, vec!["post_1", "post_2"]);
        assert_eq!(article.key, FetchStage::item_key("https://example.com/a"));
    }

    #[tokio::test]
    async fn test_transform_counts_words() {
        let unit = WorkUnit {
            identity: "https://example.com/a".into(),
            key: FetchStage::item_key("https://example.com/a"),
            source_refs: vec![],
            published_hint: None,
            input: UnitInput::Link("https://example.com/a".into()),
        };
        let output = stage().transform(&unit).await.unwrap();
        match output.details {
            StageDetails::Article(details) => {
                assert_eq!(details.word_count, 60);
                assert_eq!(details.domain.as_deref(), Some("example.com"));
            }
            other => panic!("unexpected details {other:?}"),
        }
        assert!(output.body.starts_with("# A title\n\n"));
    }

    #[tokio::test]
    async fn test_transform_rejects_short_and_invalid() {
        let short = WorkUnit {
            identity: "https://example.com/short".into(),
            key: "url_short".into(),
            source_refs: vec![],
            published_hint: None,
            input: UnitInput::Link("https://example.com/short".into()),
        };
        assert!(matches!(
            stage().transform(&short).await,
            Err(ProcessError::Unparseable(_))
        ));

        let invalid = WorkUnit {
            input: UnitInput::Link("not a url".into()),
            ..short
        };
        assert!(matches!(
            stage().transform(&invalid).await,
            Err(ProcessError::InvalidIdentity(_))
        ));
    }
}
