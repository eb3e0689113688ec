//! Desired-state store.
//!
//! Batches are applied item by item: a malformed descriptor is skipped
//! and logged, the rest of the batch still lands. Created timestamps
//! survive updates; updated timestamps are restamped on every upsert.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use stagegrid_core::{WorkloadDescriptor, WorkloadId, epoch_secs};

use crate::error::{IngestError, IngestResult};

/// What a batch asks the agent to do with its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchAction {
    Create,
    Update,
    Delete,
}

impl FromStr for BatchAction {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(BatchAction::Create),
            "update" => Ok(BatchAction::Update),
            "delete" => Ok(BatchAction::Delete),
            _ => Err(IngestError::UnknownAction(s.to_string())),
        }
    }
}

/// Wire format of a control-plane push.
///
/// `action` stays a string so an unknown verb is reported as a bad
/// request rather than a body-shape error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestBatch {
    #[serde(alias = "agent_id")]
    pub source_id: String,
    pub action: String,
    #[serde(default, alias = "pods")]
    pub items: Vec<WorkloadDescriptor>,
}

/// Result of applying one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub action: BatchAction,
    /// Items applied to the table.
    pub processed: usize,
    /// Malformed items that were dropped.
    pub skipped: usize,
}

/// The desired-state table, keyed by workload id.
pub struct DesiredStateStore {
    agent_id: String,
    items: RwLock<HashMap<WorkloadId, WorkloadDescriptor>>,
}

impl DesiredStateStore {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            items: RwLock::new(HashMap::new()),
        }
    }

    /// The identity every batch must carry as its source id.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Apply a batch stamped with the current time.
    pub async fn apply(&self, batch: IngestBatch) -> IngestResult<IngestOutcome> {
        self.apply_at(batch, epoch_secs()).await
    }

    /// Apply a batch with an explicit timestamp.
    pub async fn apply_at(&self, batch: IngestBatch, now: u64) -> IngestResult<IngestOutcome> {
        if batch.source_id != self.agent_id {
            warn!(
                source_id = %batch.source_id,
                agent_id = %self.agent_id,
                "rejected batch from unauthorized source"
            );
            return Err(IngestError::Unauthorized {
                got: batch.source_id,
            });
        }
        let action: BatchAction = batch.action.parse()?;

        let mut processed = 0;
        let mut skipped = 0;
        let mut items = self.items.write().await;

        for mut item in batch.items {
            match action {
                BatchAction::Create | BatchAction::Update => {
                    if !item.is_well_formed() {
                        warn!(id = %item.id, name = %item.name, "skipping malformed workload descriptor");
                        skipped += 1;
                        continue;
                    }
                    item.created_at = items.get(&item.id).map_or(now, |existing| existing.created_at);
                    item.updated_at = now;
                    debug!(workload_id = %item.id, name = %item.name, "desired workload upserted");
                    items.insert(item.id.clone(), item);
                }
                BatchAction::Delete => {
                    if item.id.trim().is_empty() {
                        warn!(name = %item.name, "skipping delete without workload id");
                        skipped += 1;
                        continue;
                    }
                    if items.remove(&item.id).is_some() {
                        debug!(workload_id = %item.id, "desired workload removed");
                    }
                }
            }
            processed += 1;
        }
        let total = items.len();
        drop(items);

        info!(?action, processed, skipped, total, "applied desired-state batch");
        Ok(IngestOutcome {
            action,
            processed,
            skipped,
        })
    }

    /// Copy of the current desired state, ordered by id.
    pub async fn snapshot(&self) -> Vec<WorkloadDescriptor> {
        let items = self.items.read().await;
        let mut out: Vec<WorkloadDescriptor> = items.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn get(&self, id: &str) -> Option<WorkloadDescriptor> {
        self.items.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}
