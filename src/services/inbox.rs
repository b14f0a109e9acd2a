//! Post source backed by JSON drop files.
//!
//! An external collector (or an operator) drops `inbox/{YYYY-MM-DD}.json`,
//! a JSON array of posts, into the storage root.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use super::PostSource;
use crate::error::ProcessError;
use crate::models::RawPost;
use crate::storage::BlobStore;

pub struct InboxPostSource {
    blobs: Arc<dyn BlobStore>,
}

impl InboxPostSource {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub fn path(partition: NaiveDate) -> String {
        format!("inbox/{}.json", partition.format("%Y-%m-%d"))
    }
}

#[async_trait]
impl PostSource for InboxPostSource {
    fn name(&self) -> String {
        "inbox".into()
    }

    async fn posts(
        &self,
        partition: NaiveDate,
        limit: usize,
    ) -> Result<Vec<RawPost>, ProcessError> {
        let path = Self::path(partition);
        let Some(bytes) = self.blobs.get(&path).await? else {
            log::info!("No inbox file at {}", self.blobs.location(&path));
            return Ok(Vec::new());
        };

        let mut posts: Vec<RawPost> = serde_json::from_slice(&bytes)
            .map_err(|e| ProcessError::Unparseable(format!("{path}: {e}")))?;
        if posts.len() > limit {
            log::warn!(
                "Inbox {} holds {} posts, keeping the first {}",
                path,
                posts.len(),
                limit
            );
            posts.truncate(limit);
        }
        Ok(posts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBlobStore;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[tokio::test]
    async fn test_missing_inbox_is_empty() {
        let tmp = TempDir::new().unwrap();
        let source = InboxPostSource::new(Arc::new(LocalBlobStore::new(tmp.path())));
        assert!(source.posts(date(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reads_and_limits_posts() {
        let tmp = TempDir::new().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(tmp.path()));
        let json = r#"[
            {"id": "at://a/1", "author": "a.bsky.social", "text": "one",
             "created_at": "2026-10-19T08:00:00Z", "links": ["https://example.com/1"]},
            {"id": "at://a/2", "author": "a.bsky.social", "text": "two",
             "created_at": "2026-10-19T09:00:00Z"}
        ]"#;
        blobs
            .put(&InboxPostSource::path(date()), json.as_bytes())
            .await
            .unwrap();

        let source = InboxPostSource::new(blobs);
        let posts = source.posts(date(), 1).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].links, vec!["https://example.com/1".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_json_is_unparseable() {
        let tmp = TempDir::new().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(tmp.path()));
        blobs
            .put(&InboxPostSource::path(date()), b"{oops")
            .await
            .unwrap();

        let err = InboxPostSource::new(blobs).posts(date(), 10).await.unwrap_err();
        assert!(matches!(err, ProcessError::Unparseable(_)));
    }
}
