//! Identifiers and enumerations shared by every layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Name reserved for the published line of history of every post.
pub const MAIN_REVISION: &str = "main";

const MAX_REVISION_NAME_LEN: usize = 100;

/// Identifier of a post. Each post owns exactly one working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(u64);

impl PostId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PostId {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| DomainError::validation(format!("`{value}` is not a valid post id")))
    }
}

/// Whether a revision is the published line or a proposed branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionKind {
    Main,
    Branch,
}

impl RevisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RevisionKind::Main => "main",
            RevisionKind::Branch => "branch",
        }
    }
}

/// Name of a line of history inside a post's repository.
///
/// Names double as git branch names, so they are restricted to a conservative
/// character set: ASCII alphanumerics, `-`, `_` and `.`, never starting with
/// `.` or `-` and never containing `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId(String);

impl RevisionId {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        validate_revision_name(&value)?;
        Ok(Self(value))
    }

    pub fn main() -> Self {
        Self(MAIN_REVISION.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> RevisionKind {
        if self.0 == MAIN_REVISION {
            RevisionKind::Main
        } else {
            RevisionKind::Branch
        }
    }

    pub fn is_main(&self) -> bool {
        self.kind() == RevisionKind::Main
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RevisionId {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RevisionId> for String {
    fn from(value: RevisionId) -> Self {
        value.0
    }
}

fn validate_revision_name(value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::validation("revision name must not be empty"));
    }
    if value.len() > MAX_REVISION_NAME_LEN {
        return Err(DomainError::validation(format!(
            "revision name exceeds {MAX_REVISION_NAME_LEN} characters"
        )));
    }
    if value.starts_with('.') || value.starts_with('-') || value.contains("..") {
        return Err(DomainError::validation(format!(
            "revision name `{value}` is not a valid line-of-history name"
        )));
    }
    if value.ends_with(".lock") {
        return Err(DomainError::validation(format!(
            "revision name `{value}` must not end with `.lock`"
        )));
    }
    if !value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
    {
        return Err(DomainError::validation(format!(
            "revision name `{value}` contains unsupported characters"
        )));
    }
    Ok(())
}

/// Outcome of the most recent render run of a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    Pending,
    Success,
    Failure,
}

impl RenderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderStatus::Pending => "pending",
            RenderStatus::Success => "success",
            RenderStatus::Failure => "failure",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RenderStatus::Pending)
    }
}

impl fmt::Display for RenderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to the extracted project sources after a successful render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePolicy {
    /// Remove the sources before committing; only the artifact stays in history.
    Discard,
    /// Commit the sources next to the artifact.
    Retain,
}

impl FromStr for SourcePolicy {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(SourcePolicy::Discard),
            "retain" => Ok(SourcePolicy::Retain),
            other => Err(DomainError::validation(format!(
                "unknown source policy `{other}` (expected discard|retain)"
            ))),
        }
    }
}
