//! Persisted records referenced by the render core.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::types::{PostId, RenderStatus, RevisionId, RevisionKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: PostId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl PostRecord {
    pub fn new(id: PostId) -> Self {
        Self {
            id,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub post_id: PostId,
    pub id: RevisionId,
    pub render_status: RenderStatus,
    /// Submission whose outcome `render_status` will report.
    #[serde(default)]
    pub render_run: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl RevisionRecord {
    /// Fresh revisions always start out pending.
    pub fn new(post_id: PostId, id: RevisionId) -> Self {
        Self {
            post_id,
            id,
            render_status: RenderStatus::Pending,
            render_run: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn kind(&self) -> RevisionKind {
        self.id.kind()
    }

    /// Reset to pending for a new submission.
    pub fn begin_run(mut self, run_id: Uuid) -> Self {
        self.render_run = Some(run_id);
        self.with_status(RenderStatus::Pending)
    }

    /// Whether `run_id` is still the latest submission for this revision.
    pub fn is_current_run(&self, run_id: Uuid) -> bool {
        self.render_run == Some(run_id)
    }

    pub fn with_status(mut self, status: RenderStatus) -> Self {
        self.render_status = status;
        self.updated_at = OffsetDateTime::now_utc();
        self
    }
}
