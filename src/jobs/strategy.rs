//! Extraction strategies, search candidates and disambiguation rules.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::model::JobInput;

/// One named way of producing a result from a resolved candidate.
///
/// The runner tries the configured list in order; adding a fallback path is
/// a new variant plus its session handling, not a control-flow change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// Download the purchased document (income report PDF) for the candidate.
    DocumentDownload,
    /// Read the figures shown on the candidate's profile page.
    ProfileRead,
}

impl ExtractionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentDownload => "document_download",
            Self::ProfileRead => "profile_read",
        }
    }
}

impl std::fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExtractionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document_download" => Ok(Self::DocumentDownload),
            "profile_read" => Ok(Self::ProfileRead),
            other => Err(format!("unknown extraction strategy '{other}'")),
        }
    }
}

/// A search hit returned by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Display name.
    pub label: String,
    /// Where the record lives (profile URL or equivalent).
    pub locator: String,
    #[serde(default)]
    pub birth_year: Option<i32>,
}

static BIRTH_DATE_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    // Profile locators look like `/19370108-Jan_Artur_Andersson_Stockholm/...`
    Regex::new(r"/((?:19|20)\d{2})\d{4}-").unwrap()
});

impl Candidate {
    pub fn new(label: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            locator: locator.into(),
            birth_year: None,
        }
    }

    pub fn with_birth_year(mut self, year: i32) -> Self {
        self.birth_year = Some(year);
        self
    }

    /// Explicit birth year, or the one encoded in the locator.
    pub fn inferred_birth_year(&self) -> Option<i32> {
        self.birth_year.or_else(|| {
            BIRTH_DATE_SEGMENT
                .captures(&self.locator)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
        })
    }
}

/// Reference to a remote operation still in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteTaskId(pub String);

impl std::fmt::Display for RemoteTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a strategy attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    /// Data available now.
    Ready(serde_json::Value),
    /// Nothing here, try the next strategy.
    Empty,
    /// The data is being prepared remotely; wait on the task.
    Pending(RemoteTaskId),
}

/// Status of a remote task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RemoteTaskStatus {
    Running {
        #[serde(default)]
        progress: Option<u8>,
    },
    Done {
        data: serde_json::Value,
    },
    Failed {
        reason: String,
    },
}

impl RemoteTaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running { .. })
    }
}

/// The winning strategy's data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extracted {
    pub strategy: ExtractionStrategy,
    pub candidate: Candidate,
    pub data: serde_json::Value,
}

/// Whether extracted data counts as a result.
pub fn has_content(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.trim().is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        serde_json::Value::Bool(_) | serde_json::Value::Number(_) => true,
    }
}

/// Picks the best candidate for a job when search returns several.
pub trait Disambiguator: Send + Sync {
    /// Index of the chosen candidate, or `None` to treat the target as unresolved.
    fn select(&self, input: &JobInput, candidates: &[Candidate]) -> Option<usize>;
}

/// Closest birth year wins; without a requested year the first hit wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct BirthYearRule;

impl Disambiguator for BirthYearRule {
    fn select(&self, input: &JobInput, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let Some(wanted) = input.birth_year() else {
            return Some(0);
        };

        candidates
            .iter()
            .enumerate()
            .min_by_key(|(i, c)| {
                let distance = c
                    .inferred_birth_year()
                    .map(|y| (y - wanted).unsigned_abs())
                    .unwrap_or(u32::MAX);
                (distance, *i)
            })
            .map(|(i, _)| i)
    }
}
