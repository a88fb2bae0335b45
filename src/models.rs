// Core data structures for the pubcrawl crawl engine

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// One article as delivered by the dataset input
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ArticleSeed {
    /// Unique identifier within the dataset (DOI, PMID or internal ID)
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmcid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issn: Option<String>,
    /// Publisher key used to select a resolver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ArticleSeed {
    /// Seed from a bare identifier, detecting DOIs, PMIDs and PMCIDs
    pub fn from_identifier(identifier: &str) -> Self {
        let identifier = identifier.trim();
        let mut seed = Self {
            identifier: identifier.to_string(),
            ..Default::default()
        };

        let is_digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());

        if let Some(doi) = strip_prefix_ci(identifier, "https://doi.org/")
            .or_else(|| strip_prefix_ci(identifier, "doi:"))
        {
            seed.doi = Some(doi.trim().to_string());
        } else if identifier.starts_with("10.") && identifier.contains('/') {
            seed.doi = Some(identifier.to_string());
        } else if let Some(digits) = strip_prefix_ci(identifier, "pmc").filter(|d| is_digits(d)) {
            seed.pmcid = Some(format!("PMC{digits}"));
        } else if is_digits(identifier) {
            seed.pmid = Some(identifier.to_string());
        }

        seed
    }

    /// Value for a resolver placeholder name
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "identifier" => Some(self.identifier.as_str()),
            "doi" => self.doi.as_deref(),
            "pmid" => self.pmid.as_deref(),
            "pmcid" => self.pmcid.as_deref(),
            "issn" => self.issn.as_deref(),
            "publisher" => self.publisher.as_deref(),
            other => self.extra.get(other).map(String::as_str),
        }
    }
}

fn strip_prefix_ci<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        value.get(prefix.len()..)
    } else {
        None
    }
}

/// Crawl status of an article task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Skipped,
    ];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Done, Failed and Skipped are never revisited
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" | "in-progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Role of a downloaded file within an article
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    Main,
    Supplemental,
    Unknown,
}

impl FileRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Supplemental => "supplemental",
            Self::Unknown => "unknown",
        }
    }
}

/// A downloaded file recorded against an article
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub url: String,
    /// SHA-256 of the body
    pub content_hash: String,
    pub mime_type: String,
    pub role: FileRole,
    pub size: u64,
    /// Location in the dataset directory, when files are written to disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Kind of bot defence that blocked a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    /// HTTP 429
    TooManyRequests,
    /// CAPTCHA form in the page
    Captcha,
    /// JavaScript interstitial ("checking your browser")
    ScriptChallenge,
    /// Explicit access-denied page from a bot filter
    AccessDenied,
    /// Host quarantined by the throttle; no request was sent
    HostCoolingDown,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooManyRequests => "too_many_requests",
            Self::Captcha => "captcha",
            Self::ScriptChallenge => "script_challenge",
            Self::AccessDenied => "access_denied",
            Self::HostCoolingDown => "host_cooling_down",
        }
    }
}

/// Classified reason for a failed candidate or task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Connection reset, DNS failure, TLS error
    Network(String),
    Timeout,
    /// Non-success status that is not a bot challenge
    HttpStatus(u16),
    /// 2xx response without content
    EmptyBody,
    InvalidUrl(String),
    BotChallenge(ChallengeType),
    HostCoolingDown,
    /// Resolver produced no candidate URLs
    ResolutionEmpty,
    /// Only supplemental files could be retrieved
    NoFulltext,
    /// Stop signal observed before the attempt finished
    Interrupted,
}

impl FailureReason {
    /// Whether a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::EmptyBody | Self::Interrupted => true,
            Self::HttpStatus(code) => *code >= 500 || *code == 408,
            _ => false,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "network error: {msg}"),
            Self::Timeout => f.write_str("timeout"),
            Self::HttpStatus(code) => write!(f, "HTTP {code}"),
            Self::EmptyBody => f.write_str("empty body"),
            Self::InvalidUrl(msg) => write!(f, "invalid URL: {msg}"),
            Self::BotChallenge(kind) => write!(f, "bot challenge: {}", kind.as_str()),
            Self::HostCoolingDown => f.write_str("host cooling down"),
            Self::ResolutionEmpty => f.write_str("no candidate URLs"),
            Self::NoFulltext => f.write_str("no fulltext file found"),
            Self::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Failure note for one candidate URL of an article
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFailure {
    pub url: String,
    pub reason: FailureReason,
    /// Strategy that produced the final outcome, if any request was made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

/// One unit of crawl work as stored in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleTask {
    pub identifier: String,
    pub metadata: ArticleSeed,
    pub status: TaskStatus,
    /// Network fetch attempts made so far
    pub attempts: u32,
    pub last_error: Option<FailureReason>,
    pub files: Vec<FileDescriptor>,
    pub failures: Vec<CandidateFailure>,
    pub claimed_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ArticleTask {
    /// Main-text files recorded for this task
    pub fn main_files(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.files.iter().filter(|f| f.role == FileRole::Main)
    }
}

/// Result of one fetch through the strategy chain
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success {
        body: Bytes,
        content_type: String,
        status_code: u16,
        final_url: String,
    },
    RetryableFailure(FailureReason),
    PermanentFailure(FailureReason),
    Blocked(ChallengeType),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::RetryableFailure(_) => "retryable",
            Self::PermanentFailure(_) => "permanent",
            Self::Blocked(_) => "blocked",
        }
    }

    /// Failure reason for non-success outcomes
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Success { .. } => None,
            Self::RetryableFailure(reason) | Self::PermanentFailure(reason) => {
                Some(reason.clone())
            }
            Self::Blocked(ChallengeType::HostCoolingDown) => Some(FailureReason::HostCoolingDown),
            Self::Blocked(kind) => Some(FailureReason::BotChallenge(*kind)),
        }
    }
}

/// Task counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.done + self.failed + self.skipped
    }

    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Done => self.done,
            TaskStatus::Failed => self.failed,
            TaskStatus::Skipped => self.skipped,
        }
    }

    pub(crate) fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::InProgress => self.in_progress += count,
            TaskStatus::Done => self.done += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Skipped => self.skipped += count,
        }
    }

    /// Completion percentage over all tasks
    pub fn completion_percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 100.0;
        }
        (self.done + self.failed + self.skipped) as f64 / total as f64 * 100.0
    }
}
