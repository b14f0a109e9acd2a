//! Markdown digest renderer.

use std::fmt::Write;

use chrono::NaiveDate;

use super::{DigestEntry, ReportRenderer};
use crate::error::ProcessError;
use crate::utils::url::get_domain;

#[derive(Debug, Clone)]
pub struct MarkdownDigestRenderer {
    topic: String,
}

impl MarkdownDigestRenderer {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

impl ReportRenderer for MarkdownDigestRenderer {
    fn render(
        &self,
        window_start: NaiveDate,
        window_end: NaiveDate,
        entries: &[DigestEntry],
    ) -> Result<String, ProcessError> {
        let mut sorted: Vec<&DigestEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| {
            b.relevance_score
                .total_cmp(&a.relevance_score)
                .then_with(|| a.key.cmp(&b.key))
        });

        let period = if window_start == window_end {
            window_end.to_string()
        } else {
            format!("{window_start} to {window_end}")
        };

        let mut out = String::new();
        let _ = writeln!(out, "# Digest: {} ({period})\n", self.topic);
        if sorted.is_empty() {
            out.push_str("No relevant articles in this period.\n");
            return Ok(out);
        }
        let _ = writeln!(out, "{} relevant articles.\n", sorted.len());

        for entry in sorted {
            let title = entry.title.as_deref().unwrap_or(&entry.url);
            let domain = get_domain(&entry.url).unwrap_or_default();
            let _ = writeln!(out, "## [{title}]({})\n", entry.url);
            let _ = writeln!(
                out,
                "*{domain}* · relevance {:.2}\n",
                entry.relevance_score
            );
            if !entry.summary.is_empty() {
                let _ = writeln!(out, "{}\n", entry.summary.trim());
            }
            if !entry.key_topics.is_empty() {
                let _ = writeln!(out, "Topics: {}\n", entry.key_topics.join(", "));
            }
        }
        Ok(out)
    }
}
