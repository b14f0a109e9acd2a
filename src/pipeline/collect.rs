//! Collect stage: one item per post from the post source.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::join_all;

use super::stage::{Stage, StageOutput, UnitInput, WorkUnit};
use crate::error::{AppError, ProcessError, Result};
use crate::models::{PostDetails, RawPost, StageDetails, StageId};
use crate::services::{LinkExpander, PostSource};
use crate::storage::ItemStore;
use crate::utils::hash_key;

pub struct CollectStage {
    source: Arc<dyn PostSource>,
    max_posts: usize,
    expander: Option<Arc<dyn LinkExpander>>,
    languages: Vec<String>,
}

impl CollectStage {
    pub fn new(source: Arc<dyn PostSource>, max_posts: usize) -> Self {
        Self {
            source,
            max_posts,
            expander: None,
            languages: Vec::new(),
        }
    }

    /// Resolve shortened links before the post is committed.
    pub fn with_expander(mut self, expander: Arc<dyn LinkExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    /// Keep only posts tagged with one of `languages` (primary subtag match).
    /// Untagged posts are kept.
    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages
            .iter()
            .map(|l| primary_subtag(l))
            .filter(|l| !l.is_empty())
            .collect();
        self
    }

    fn wanted_language(&self, post: &RawPost) -> bool {
        self.languages.is_empty()
            || post.langs.is_empty()
            || post
                .langs
                .iter()
                .any(|l| self.languages.contains(&primary_subtag(l)))
    }

    async fn expand_links(&self, links: &[String]) -> Vec<String> {
        let Some(expander) = &self.expander else {
            return links.to_vec();
        };
        let expanded = join_all(links.iter().map(|link| async move {
            match expander.expand(link).await {
                Ok(target) => target,
                Err(e) => {
                    log::debug!("Keeping unexpanded link {}: {}", link, e);
                    link.clone()
                }
            }
        }))
        .await;

        let mut unique = Vec::with_capacity(expanded.len());
        for link in expanded {
            if !unique.contains(&link) {
                unique.push(link);
            }
        }
        unique
    }

    pub fn item_key(post_id: &str) -> String {
        hash_key("post", post_id)
    }

    fn details(post: &RawPost) -> PostDetails {
        PostDetails {
            post_id: post.id.clone(),
            author: post.author.clone(),
            posted_at: post.created_at,
            links: post.links.clone(),
            likes: post.likes,
            reposts: post.reposts,
            replies: post.replies,
            language: post.langs.first().cloned(),
        }
    }
}

fn primary_subtag(tag: &str) -> String {
    tag.trim()
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

#[async_trait]
impl Stage for CollectStage {
    fn id(&self) -> StageId {
        StageId::Collected
    }

    async fn discover(&self, _store: &ItemStore, partition: NaiveDate) -> Result<Vec<WorkUnit>> {
        let posts = self
            .source
            .posts(partition, self.max_posts)
            .await
            .map_err(|error| AppError::Discovery {
                stage: StageId::Collected,
                error,
            })?;

        let source_ref = self.source.name();
        let total = posts.len();
        let posts: Vec<RawPost> = posts
            .into_iter()
            .filter(|post| self.wanted_language(post))
            .collect();
        if posts.len() < total {
            log::info!(
                "Dropped {} posts outside languages {:?}",
                total - posts.len(),
                self.languages
            );
        }

        let units = posts
            .into_iter()
            .filter(|post| !post.id.trim().is_empty())
            .map(|post| WorkUnit {
                identity: post.id.clone(),
                key: Self::item_key(&post.id),
                source_refs: vec![source_ref.clone()],
                published_hint: Some(post.created_at),
                input: UnitInput::Post(Box::new(post)),
            })
            .collect();
        Ok(units)
    }

    async fn transform(&self, unit: &WorkUnit) -> std::result::Result<StageOutput, ProcessError> {
        let UnitInput::Post(post) = &unit.input else {
            return Err(ProcessError::InvalidIdentity(format!(
                "{} is not a post",
                unit.identity
            )));
        };
        let mut details = Self::details(post);
        details.links = self.expand_links(&post.links).await;
        Ok(StageOutput {
            details: StageDetails::Post(details),
            body: post.text.clone(),
        })
    }

    fn failure_details(&self, unit: &WorkUnit) -> StageDetails {
        match &unit.input {
            UnitInput::Post(post) => StageDetails::Post(Self::details(post)),
            _ => StageDetails::Post(PostDetails {
                post_id: unit.identity.clone(),
                author: String::new(),
                posted_at: unit.published_hint.unwrap_or_default(),
                links: Vec::new(),
                likes: 0,
                reposts: 0,
                replies: 0,
                language: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBlobStore;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    struct FixedSource(Vec<RawPost>);

    #[async_trait]
    impl PostSource for FixedSource {
        fn name(&self) -> String {
            "fixed".into()
        }

        async fn posts(
            &self,
            _partition: NaiveDate,
            limit: usize,
        ) -> std::result::Result<Vec<RawPost>, ProcessError> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
    }

    fn post(id: &str) -> RawPost {
        RawPost {
            id: id.into(),
            author: "alice.bsky.social".into(),
            text: format!("post {id}"),
            created_at: Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
            links: vec!["https://example.com/a".into()],
            likes: 2,
            reposts: 0,
            replies: 1,
            langs: vec!["en".into()],
        }
    }

    #[tokio::test]
    async fn test_discover_and_transform() {
        let tmp = TempDir::new().unwrap();
        let store = ItemStore::new(Arc::new(LocalBlobStore::new(tmp.path())));
        let stage = CollectStage::new(
            Arc::new(FixedSource(vec![post("at://a/1"), post(""), post("at://a/2")])),
            10,
        );

        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let units = stage.discover(&store, date).await.unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].key, CollectStage::item_key("at://a/1"));
        assert_eq!(units[0].source_refs, vec!["fixed".to_string()]);

        let output = stage.transform(&units[0]).await.unwrap();
        assert_eq!(output.body, "post at://a/1");
        match output.details {
            StageDetails::Post(details) => {
                assert_eq!(details.language.as_deref(), Some("en"));
                assert_eq!(details.links.len(), 1);
            }
            other => panic!("unexpected details {other:?}"),
        }
    }

    struct MapExpander;

    #[async_trait]
    impl LinkExpander for MapExpander {
        async fn expand(&self, url: &str) -> std::result::Result<String, ProcessError> {
            match url {
                "https://bit.ly/a" => Ok("https://example.com/a".into()),
                "https://bit.ly/dead" => Err(ProcessError::Http {
                    status: 404,
                    url: url.into(),
                }),
                other => Ok(other.into()),
            }
        }
    }

    #[tokio::test]
    async fn test_shortened_links_are_expanded() {
        let mut shared = post("at://a/3");
        shared.links = vec![
            "https://bit.ly/a".into(),
            "https://example.com/a".into(),
            "https://bit.ly/dead".into(),
        ];
        let stage = CollectStage::new(Arc::new(FixedSource(vec![])), 10)
            .with_expander(Arc::new(MapExpander));
        let unit = WorkUnit {
            identity: shared.id.clone(),
            key: CollectStage::item_key(&shared.id),
            source_refs: vec![],
            published_hint: None,
            input: UnitInput::Post(Box::new(shared)),
        };

        let output = stage.transform(&unit).await.unwrap();
        match output.details {
            StageDetails::Post(details) => assert_eq!(
                details.links,
                vec![
                    "https://example.com/a".to_string(),
                    "https://bit.ly/dead".to_string(),
                ]
            ),
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_language_filter_keeps_untagged_posts() {
        let tmp = TempDir::new().unwrap();
        let store = ItemStore::new(Arc::new(LocalBlobStore::new(tmp.path())));

        let mut german = post("at://a/de");
        german.langs = vec!["de".into()];
        let mut regional = post("at://a/en-gb");
        regional.langs = vec!["en-GB".into()];
        let mut untagged = post("at://a/none");
        untagged.langs = vec![];

        let stage = CollectStage::new(
            Arc::new(FixedSource(vec![german, regional, untagged])),
            10,
        )
        .with_languages(vec!["EN".into()]);

        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let ids: Vec<_> = stage
            .discover(&store, date)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.identity)
            .collect();
        assert_eq!(ids, vec!["at://a/en-gb", "at://a/none"]);
    }
}
