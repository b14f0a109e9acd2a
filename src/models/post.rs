//! Raw post payload handed over by a post source.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A post as returned by the social-network client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawPost {
    /// Network-wide post identifier (e.g. an AT URI)
    pub id: String,

    /// Author handle
    pub author: String,

    /// Post text
    pub text: String,

    /// When the post was created
    pub created_at: DateTime<Utc>,

    /// External links found in the post
    #[serde(default)]
    pub links: Vec<String>,

    #[serde(default)]
    pub likes: u32,

    #[serde(default)]
    pub reposts: u32,

    #[serde(default)]
    pub replies: u32,

    /// Language tags reported by the network
    #[serde(default)]
    pub langs: Vec<String>,
}

impl RawPost {
    /// Publication date, used to match a post against a partition.
    pub fn posted_on(&self) -> NaiveDate {
        self.created_at.date_naive()
    }
}
