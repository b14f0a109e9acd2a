//! Stage identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// A phase of the pipeline. Ordered by dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Collected,
    Fetched,
    Evaluated,
    Reported,
}

impl StageId {
    /// All stages in execution order.
    pub const ALL: [StageId; 4] = [
        StageId::Collected,
        StageId::Fetched,
        StageId::Evaluated,
        StageId::Reported,
    ];

    /// Directory name and CLI name of the stage.
    pub fn dir_name(&self) -> &'static str {
        match self {
            StageId::Collected => "collect",
            StageId::Fetched => "fetch",
            StageId::Evaluated => "evaluate",
            StageId::Reported => "report",
        }
    }

    /// The stage whose committed items feed this one.
    pub fn upstream(&self) -> Option<StageId> {
        match self {
            StageId::Collected => None,
            StageId::Fetched => Some(StageId::Collected),
            StageId::Evaluated => Some(StageId::Fetched),
            StageId::Reported => Some(StageId::Evaluated),
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for StageId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "collect" | "collected" => Ok(StageId::Collected),
            "fetch" | "fetched" => Ok(StageId::Fetched),
            "evaluate" | "evaluated" => Ok(StageId::Evaluated),
            "report" | "reported" => Ok(StageId::Reported),
            other => Err(AppError::validation(format!("Unknown stage '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_both_spellings() {
        assert_eq!("fetch".parse::<StageId>().unwrap(), StageId::Fetched);
        assert_eq!("Evaluated".parse::<StageId>().unwrap(), StageId::Evaluated);
        assert!("publish".parse::<StageId>().is_err());
    }

    #[test]
    fn test_upstream_chain() {
        assert_eq!(StageId::Collected.upstream(), None);
        assert_eq!(StageId::Reported.upstream(), Some(StageId::Evaluated));
        assert!(StageId::Collected < StageId::Reported);
    }
}
