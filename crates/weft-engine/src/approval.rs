use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use weft_core::approval::{ApprovalDecision, ApprovalOutcome, ApprovalRequest};
use weft_core::event::EventBus;
use weft_core::types::RunEvent;

/// Manages pending approval requests with oneshot channels.
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, (ApprovalRequest, oneshot::Sender<ApprovalDecision>)>>,
    event_bus: Arc<EventBus>,
}

impl ApprovalBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Register a request, publish it, and return the receiver to park on.
    pub async fn request(&self, req: ApprovalRequest) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        let id = req.id.clone();

        // Registered before publishing so an immediate response finds it
        self.pending.lock().await.insert(id, (req.clone(), tx));
        self.event_bus
            .publish(RunEvent::ApprovalRequested { request: req });
        rx
    }

    /// Deliver a decision. Returns true if the request was still pending.
    pub async fn respond(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        let entry = self.pending.lock().await.remove(request_id);
        if let Some((_req, tx)) = entry {
            self.event_bus.publish(RunEvent::ApprovalResolved {
                request_id: request_id.to_string(),
                outcome: decision.clone().into(),
            });
            // Receiver is gone if the run was cancelled in the meantime
            let _ = tx.send(decision);
            true
        } else {
            false
        }
    }

    /// Drop a request without a decision (deadline passed or run cancelled).
    pub async fn close(&self, request_id: &str, outcome: ApprovalOutcome) -> bool {
        let removed = self.pending.lock().await.remove(request_id).is_some();
        if removed {
            self.event_bus.publish(RunEvent::ApprovalResolved {
                request_id: request_id.to_string(),
                outcome,
            });
        }
        removed
    }

    /// Wait on `rx` for a decision until `wait` elapses.
    ///
    /// A decision delivered while the deadline fires still wins: the request
    /// only times out if it was still pending when closed.
    pub async fn await_decision(
        &self,
        request_id: &str,
        mut rx: oneshot::Receiver<ApprovalDecision>,
        wait: Duration,
    ) -> ApprovalOutcome {
        match tokio::time::timeout(wait, &mut rx).await {
            Ok(Ok(decision)) => decision.into(),
            Ok(Err(_)) => ApprovalOutcome::Withdrawn,
            Err(_) => {
                if self.close(request_id, ApprovalOutcome::TimedOut).await {
                    return ApprovalOutcome::TimedOut;
                }
                match rx.await {
                    Ok(decision) => decision.into(),
                    Err(_) => ApprovalOutcome::Withdrawn,
                }
            }
        }
    }

    /// All pending requests, oldest first.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .await
            .values()
            .map(|(req, _)| req.clone())
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        requests
    }

    /// Find a pending request by prefix match on the ID.
    pub async fn find_by_prefix(&self, prefix: &str) -> Option<String> {
        let pending = self.pending.lock().await;
        pending.keys().find(|k| k.starts_with(prefix)).cloned()
    }
}
