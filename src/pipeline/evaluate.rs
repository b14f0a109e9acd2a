//! Evaluate stage: one relevance judgment per successfully fetched article.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use super::stage::{Stage, StageOutput, UnitInput, WorkUnit, upstream_items};
use crate::error::{ProcessError, Result};
use crate::models::{EvaluateConfig, EvaluationDetails, StageDetails, StageId};
use crate::services::{ArticleInput, Evaluator};
use crate::storage::ItemStore;

pub struct EvaluateStage {
    evaluator: Arc<dyn Evaluator>,
    relevance_threshold: f64,
    model: String,
}

impl EvaluateStage {
    pub fn new(evaluator: Arc<dyn Evaluator>, config: &EvaluateConfig) -> Self {
        Self {
            evaluator,
            relevance_threshold: config.relevance_threshold,
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl Stage for EvaluateStage {
    fn id(&self) -> StageId {
        StageId::Evaluated
    }

    async fn discover(&self, store: &ItemStore, partition: NaiveDate) -> Result<Vec<WorkUnit>> {
        let upstream = upstream_items(store, StageId::Fetched, partition, true).await?;
        let units = upstream
            .items
            .into_iter()
            .map(|item| WorkUnit {
                identity: item.metadata.identity.clone(),
                key: item.metadata.key.clone(),
                source_refs: vec![item.metadata.key.clone()],
                published_hint: match &item.metadata.details {
                    StageDetails::Article(a) => a.published_at,
                    _ => None,
                },
                input: UnitInput::Item(Box::new(item)),
            })
            .collect();
        Ok(units)
    }

    async fn transform(&self, unit: &WorkUnit) -> std::result::Result<StageOutput, ProcessError> {
        let UnitInput::Item(item) = &unit.input else {
            return Err(ProcessError::InvalidIdentity(format!(
                "{} is not a fetched article",
                unit.identity
            )));
        };
        let StageDetails::Article(article) = &item.metadata.details else {
            return Err(ProcessError::LocalState(format!(
                "{} carries no article details",
                item.key()
            )));
        };
        if item.body.trim().is_empty() {
            return Err(ProcessError::Unparseable(format!("{} has no text", item.key())));
        }

        let evaluation = self
            .evaluator
            .evaluate(ArticleInput {
                url: &article.url,
                title: article.title.as_deref(),
                text: &item.body,
            })
            .await?;

        let score = evaluation.relevance_score;
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(ProcessError::Unparseable(format!(
                "relevance score {score} outside 0..1"
            )));
        }

        let details = EvaluationDetails {
            url: article.url.clone(),
            title: article.title.clone(),
            is_relevant: evaluation.is_relevant && score >= self.relevance_threshold,
            relevance_score: score,
            summary: evaluation.summary,
            key_topics: evaluation.key_topics,
            content_type: evaluation.content_type,
            model: if evaluation.model.is_empty() {
                self.model.clone()
            } else {
                evaluation.model
            },
        };
        Ok(StageOutput {
            body: item.body.clone(),
            details: StageDetails::Evaluation(details),
        })
    }

    fn failure_details(&self, unit: &WorkUnit) -> StageDetails {
        let (url, title) = match &unit.input {
            UnitInput::Item(item) => match &item.metadata.details {
                StageDetails::Article(a) => (a.url.clone(), a.title.clone()),
                _ => (unit.identity.clone(), None),
            },
            _ => (unit.identity.clone(), None),
        };
        StageDetails::Evaluation(EvaluationDetails {
            url,
            title,
            is_relevant: false,
            relevance_score: 0.0,
            summary: String::new(),
            key_topics: Vec::new(),
            content_type: None,
            model: self.model.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArticleDetails, ItemMetadata, ItemStatus, WorkItem};
    use crate::services::Evaluation;
    use chrono::Utc;

    struct ScoreEvaluator(f64);

    #[async_trait]
    impl Evaluator for ScoreEvaluator {
        async fn evaluate(
            &self,
            _article: ArticleInput<'_>,
        ) -> std::result::Result<Evaluation, ProcessError> {
            Ok(Evaluation {
                is_relevant: true,
                relevance_score: self.0,
                summary: "About the protocol.".into(),
                key_topics: vec!["mcp".into()],
                content_type: Some("tutorial".into()),
                model: String::new(),
            })
        }
    }

    fn unit(body: &str) -> WorkUnit {
        let now = Utc::now();
        let item = WorkItem::new(
            ItemMetadata {
                stage: StageId::Fetched,
                key: "url_0011223344556677".into(),
                partition: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
                identity: "https://example.com/a".into(),
                status: ItemStatus::Success,
                created_at: now,
                processed_at: now,
                source_refs: vec![],
                error: None,
                details: StageDetails::Article(ArticleDetails {
                    title: Some("A".into()),
                    ..ArticleDetails::failed("https://example.com/a")
                }),
            },
            body,
        );
        WorkUnit {
            identity: item.metadata.identity.clone(),
            key: item.metadata.key.clone(),
            source_refs: vec![],
            published_hint: None,
            input: UnitInput::Item(Box::new(item)),
        }
    }

    #[tokio::test]
    async fn test_threshold_applies() {
        let config = EvaluateConfig::default();
        let low = EvaluateStage::new(Arc::new(ScoreEvaluator(0.2)), &config);
        let output = low.transform(&unit("text")).await.unwrap();
        match output.details {
            StageDetails::Evaluation(e) => {
                assert!(!e.is_relevant);
                assert_eq!(e.model, config.model);
                assert_eq!(e.title.as_deref(), Some("A"));
            }
            other => panic!("unexpected details {other:?}"),
        }

        let high = EvaluateStage::new(Arc::new(ScoreEvaluator(0.9)), &config);
        let output = high.transform(&unit("text")).await.unwrap();
        assert!(matches!(
            output.details,
            StageDetails::Evaluation(EvaluationDetails { is_relevant: true, .. })
        ));
        assert_eq!(output.body, "text");
    }

    #[tokio::test]
    async fn test_rejects_bad_score_and_empty_body() {
        let config = EvaluateConfig::default();
        let stage = EvaluateStage::new(Arc::new(ScoreEvaluator(1.5)), &config);
        assert!(matches!(
            stage.transform(&unit("text")).await,
            Err(ProcessError::Unparseable(_))
        ));
        assert!(matches!(
            stage.transform(&unit("  ")).await,
            Err(ProcessError::Unparseable(_))
        ));
    }
}
