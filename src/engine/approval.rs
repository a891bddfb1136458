//! Human-in-the-loop approval coordination.
//!
//! `ctx.human.requestApproval` blocks the calling step until a decision
//! arrives. The hub transitions the run to `waiting_approval` while the
//! request is pending and back to `running` once resolved, so observers see
//! the suspension even though the worker keeps the step's sandbox thread
//! parked on the approval future.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::EngineError;
use crate::sandbox::{CapabilityError, HumanCapability};
use crate::storage::RunStore;

pub struct ApprovalHub {
    run_store: Arc<dyn RunStore>,
    pending: DashMap<Uuid, oneshot::Sender<Value>>,
}

impl ApprovalHub {
    pub fn new(run_store: Arc<dyn RunStore>) -> Self {
        Self {
            run_store,
            pending: DashMap::new(),
        }
    }

    /// Resolve the pending approval for a run. Errors when nothing waits.
    pub fn resolve(&self, run_id: Uuid, decision: Value) -> Result<(), EngineError> {
        let (_, sender) = self.pending.remove(&run_id).ok_or_else(|| {
            EngineError::InvalidState(format!("run {run_id} is not waiting for approval"))
        })?;
        sender
            .send(decision)
            .map_err(|_| EngineError::Internal("approval receiver dropped".into()))
    }

    pub fn is_waiting(&self, run_id: Uuid) -> bool {
        self.pending.contains_key(&run_id)
    }

    /// Capability bound to one run, installed into that run's sandbox
    /// services.
    pub fn capability(self: &Arc<Self>, run_id: Uuid) -> Arc<dyn HumanCapability> {
        Arc::new(RunApproval {
            hub: self.clone(),
            run_id,
        })
    }
}

struct RunApproval {
    hub: Arc<ApprovalHub>,
    run_id: Uuid,
}

#[async_trait]
impl HumanCapability for RunApproval {
    async fn request_approval(&self, _request: Value) -> Result<Value, CapabilityError> {
        let (tx, rx) = oneshot::channel();
        self.hub.pending.insert(self.run_id, tx);

        set_waiting(&self.hub.run_store, self.run_id, true).await;
        let decision = rx.await;
        set_waiting(&self.hub.run_store, self.run_id, false).await;

        decision.map_err(|_| CapabilityError::new("EXEC_002", "approval request abandoned"))
    }
}

async fn set_waiting(store: &Arc<dyn RunStore>, run_id: Uuid, waiting: bool) {
    if let Ok(Some(mut run)) = store.get_run(run_id).await {
        if waiting {
            run.suspend_for_approval();
        } else {
            run.start();
        }
        let _ = store.update_run(run).await;
    }
}
