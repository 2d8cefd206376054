//! The per-run execution record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ambiance::{ScopeKeys, TriggerInfo};
use crate::status::Status;
use crate::store::Record;

/// One pipeline run. Created `Running`; status-only mutations thereafter;
/// terminal once finalized; never deleted by the engine (archival is an
/// external concern).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: String,
    pub plan_id: String,
    pub status: Status,
    pub start_ts: DateTime<Utc>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    pub trigger: TriggerInfo,
    #[serde(default)]
    pub scope: ScopeKeys,
}

impl PlanExecution {
    #[must_use]
    pub fn start(
        id: impl Into<String>,
        plan_id: impl Into<String>,
        trigger: TriggerInfo,
        scope: ScopeKeys,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            plan_id: plan_id.into(),
            status: Status::Running,
            start_ts: now,
            end_ts: None,
            trigger,
            scope,
        }
    }
}

impl Record for PlanExecution {
    fn id(&self) -> &str {
        &self.id
    }
}
