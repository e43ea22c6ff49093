use super::budget::{Budget, BudgetUsed};
use super::WorkError;
use crate::audit::{append_audit_row, ensure_audit_schema, AuditEvent};
use crate::shared::ids::{ScopeId, WorkItemId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Task,
    Project,
    Goal,
}

/// Recovery policy applied when verification fails mid-cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnStuck {
    /// Retry under the remaining attempt budget without asking anyone.
    Retry,
    /// Ask the planner for guidance between attempts.
    ConsultPlanner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateTrigger {
    PreAttempt,
    PostAttempt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSpec {
    pub name: String,
    pub trigger: GateTrigger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationCheck {
    pub name: String,
    /// What the external runner asserts over the produced artifacts. The
    /// runner interprets this; the lifecycle only records pass/fail.
    pub expectation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub check: String,
    pub passed: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Output produced by an attempt. Carried on the record so follow-up items
/// can hydrate their inputs from a predecessor without re-running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Running,
    AwaitingPlannerGuidance,
    Healthy,
    Done,
    Failed,
    Stuck,
    Blocked,
    Paused,
}

impl WorkItemStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use WorkItemStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Blocked)
                | (Pending, Paused)
                | (Running, AwaitingPlannerGuidance)
                | (Running, Healthy)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Stuck)
                | (Running, Blocked)
                | (Running, Paused)
                | (AwaitingPlannerGuidance, Running)
                | (AwaitingPlannerGuidance, Failed)
                | (AwaitingPlannerGuidance, Stuck)
                | (AwaitingPlannerGuidance, Blocked)
                | (Healthy, Running)
                | (Healthy, Done)
                | (Healthy, Failed)
                // goals cycle back on schedule; humans can unblock
                | (Done, Pending)
                | (Stuck, Pending)
                | (Blocked, Pending)
                | (Paused, Pending)
                | (Paused, Running)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkItemStatus::Done | WorkItemStatus::Failed)
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Running => "running",
            WorkItemStatus::AwaitingPlannerGuidance => "awaiting_planner_guidance",
            WorkItemStatus::Healthy => "healthy",
            WorkItemStatus::Done => "done",
            WorkItemStatus::Failed => "failed",
            WorkItemStatus::Stuck => "stuck",
            WorkItemStatus::Blocked => "blocked",
            WorkItemStatus::Paused => "paused",
        };
        write!(f, "{name}")
    }
}

/// The unit of governed work. Hierarchy links (`parent`, `depends_on`,
/// `tasks`, `follow_up_of`) are ids into the store, never embedded records,
/// so cyclic linkage is just data.
///
/// The fields down to `follow_up_of` are immutable once approved and form
/// the plan-hash projection; everything after is runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub work_item_id: WorkItemId,
    pub scope_id: ScopeId,
    pub item_type: ItemType,
    pub budget: Budget,
    pub briefing: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
    #[serde(default)]
    pub escalation: BTreeMap<String, String>,
    #[serde(default)]
    pub verification_checks: Vec<VerificationCheck>,
    #[serde(default)]
    pub schedule: Option<String>,
    pub on_stuck: OnStuck,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub parent: Option<WorkItemId>,
    #[serde(default)]
    pub depends_on: Vec<WorkItemId>,
    #[serde(default)]
    pub tasks: Vec<WorkItemId>,
    #[serde(default)]
    pub follow_up_of: Option<WorkItemId>,

    pub status: WorkItemStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub budget_used: BudgetUsed,
    #[serde(default)]
    pub verification_results: Vec<VerificationResult>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub approval_token_id: Option<String>,
    #[serde(default)]
    pub replan_depth: u32,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Id-keyed arena for work items. The store is the only authority on item
/// state; in-memory copies are working snapshots.
#[derive(Debug, Clone)]
pub struct WorkItemStore {
    db_path: PathBuf,
}

impl WorkItemStore {
    pub fn open(db_path: &Path) -> Result<Self, WorkError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| WorkError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn ensure_schema(&self) -> Result<(), WorkError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS work_items (
                    work_item_id TEXT NOT NULL PRIMARY KEY,
                    scope_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    item TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_work_items_scope_status
                    ON work_items(scope_id, status);
                ",
            )
            .map_err(|source| WorkError::Sql { source })?;
        ensure_audit_schema(&connection).map_err(|source| WorkError::Sql { source })?;
        Ok(())
    }

    pub fn insert(&self, item: &WorkItem) -> Result<InsertOutcome, WorkError> {
        let body = serde_json::to_string(item).map_err(|source| WorkError::Encode {
            work_item_id: item.work_item_id.to_string(),
            source,
        })?;
        let connection = self.connect()?;
        let inserted = connection
            .execute(
                "INSERT INTO work_items (work_item_id, scope_id, status, updated_at, item)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(work_item_id) DO NOTHING",
                params![
                    item.work_item_id.as_str(),
                    item.scope_id.as_str(),
                    item.status.to_string(),
                    item.updated_at,
                    body,
                ],
            )
            .map_err(|source| WorkError::Sql { source })?;
        Ok(if inserted == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    pub fn load(&self, work_item_id: &WorkItemId) -> Result<WorkItem, WorkError> {
        let connection = self.connect()?;
        let body: Option<String> = connection
            .query_row(
                "SELECT item FROM work_items WHERE work_item_id = ?1",
                params![work_item_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| WorkError::Sql { source })?;
        let Some(body) = body else {
            return Err(WorkError::UnknownItem {
                work_item_id: work_item_id.to_string(),
            });
        };
        serde_json::from_str(&body).map_err(|source| WorkError::Decode {
            work_item_id: work_item_id.to_string(),
            source,
        })
    }

    /// Full-record persist. Runtime fields only; callers must not alter the
    /// approval-bound fields of an approved item (the plan hash would no
    /// longer match and the next entry check fails closed).
    pub fn persist(&self, item: &WorkItem) -> Result<(), WorkError> {
        let body = serde_json::to_string(item).map_err(|source| WorkError::Encode {
            work_item_id: item.work_item_id.to_string(),
            source,
        })?;
        let connection = self.connect()?;
        let updated = connection
            .execute(
                "UPDATE work_items
                 SET scope_id = ?1, status = ?2, updated_at = ?3, item = ?4
                 WHERE work_item_id = ?5",
                params![
                    item.scope_id.as_str(),
                    item.status.to_string(),
                    item.updated_at,
                    body,
                    item.work_item_id.as_str(),
                ],
            )
            .map_err(|source| WorkError::Sql { source })?;
        if updated == 0 {
            return Err(WorkError::UnknownItem {
                work_item_id: item.work_item_id.to_string(),
            });
        }
        Ok(())
    }

    /// Validated status transition, persisted together with its audit row.
    pub fn transition_status(
        &self,
        item: &mut WorkItem,
        next: WorkItemStatus,
        now: i64,
        reason: &str,
    ) -> Result<(), WorkError> {
        if !item.status.can_transition_to(next) {
            return Err(WorkError::InvalidTransition {
                work_item_id: item.work_item_id.to_string(),
                from: item.status,
                to: next,
            });
        }
        item.status = next;
        item.updated_at = now;
        self.persist(item)?;

        let connection = self.connect()?;
        append_audit_row(
            &connection,
            now,
            item.scope_id.as_str(),
            AuditEvent::StatusChanged,
            item.work_item_id.as_str(),
            &format!("status={next} reason={reason}"),
        )
        .map_err(|source| WorkError::Sql { source })?;
        Ok(())
    }

    pub fn list_by_status(
        &self,
        scope_id: &ScopeId,
        status: WorkItemStatus,
    ) -> Result<Vec<WorkItem>, WorkError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "SELECT item FROM work_items
                 WHERE scope_id = ?1 AND status = ?2
                 ORDER BY updated_at, work_item_id",
            )
            .map_err(|source| WorkError::Sql { source })?;
        let rows = statement
            .query_map(params![scope_id.as_str(), status.to_string()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(|source| WorkError::Sql { source })?;

        let mut items = Vec::new();
        for row in rows {
            let body = row.map_err(|source| WorkError::Sql { source })?;
            let item: WorkItem =
                serde_json::from_str(&body).map_err(|source| WorkError::Decode {
                    work_item_id: "unknown".to_string(),
                    source,
                })?;
            items.push(item);
        }
        Ok(items)
    }

    /// Pending items whose dependencies have all completed.
    pub fn ready_items(&self, scope_id: &ScopeId) -> Result<Vec<WorkItem>, WorkError> {
        let pending = self.list_by_status(scope_id, WorkItemStatus::Pending)?;
        let mut ready = Vec::new();
        for item in pending {
            let mut blocked = false;
            for dependency in &item.depends_on {
                let dep = self.load(dependency)?;
                if dep.status != WorkItemStatus::Done {
                    blocked = true;
                    break;
                }
            }
            if !blocked {
                ready.push(item);
            }
        }
        Ok(ready)
    }

    pub fn connect(&self) -> Result<Connection, WorkError> {
        let connection = Connection::open(&self.db_path).map_err(|source| WorkError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|source| WorkError::Sql { source })?;
        Ok(connection)
    }
}
