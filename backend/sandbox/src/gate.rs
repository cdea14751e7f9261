//! Approval gate: pauses risky tool calls until an external decision arrives.
//!
//! Each pending request is a oneshot rendezvous keyed by (turn id, tool call
//! id). Requests are broadcast to subscribers (UI, chat channel) which answer
//! through [`ApprovalGate::resolve`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agora_core::AgoraError;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A tool call waiting for confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub turn_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub agent_id: String,
    pub session_id: String,
    /// Why the policy asked.
    pub reason: String,
}

/// External answer to a pending request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub approved: bool,
    /// Skip future approvals for this tool in this session.
    #[serde(default)]
    pub always_allow: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            always_allow: false,
            reason: None,
        }
    }

    pub fn always_allow() -> Self {
        Self {
            approved: true,
            always_allow: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            always_allow: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied { reason: String },
}

struct Pending {
    request: ApprovalRequest,
    tx: oneshot::Sender<ApprovalDecision>,
    created: Instant,
}

type PendingKey = (String, String);

/// Shared rendezvous for every in-flight turn.
pub struct ApprovalGate {
    pending: Mutex<HashMap<PendingKey, Pending>>,
    /// session id → tools approved with "always allow".
    session_allow: Mutex<HashMap<String, HashSet<String>>>,
    requests_tx: broadcast::Sender<ApprovalRequest>,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalGate {
    pub fn new() -> Self {
        let (requests_tx, _) = broadcast::channel(64);
        Self {
            pending: Mutex::new(HashMap::new()),
            session_allow: Mutex::new(HashMap::new()),
            requests_tx,
        }
    }

    /// Receive every request as it is raised.
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.requests_tx.subscribe()
    }

    pub fn is_always_allowed(&self, session_id: &str, tool_name: &str) -> bool {
        self.session_allow
            .lock()
            .map(|m| m.get(session_id).is_some_and(|tools| tools.contains(tool_name)))
            .unwrap_or(false)
    }

    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.pending
            .lock()
            .map(|m| m.values().map(|p| p.request.clone()).collect())
            .unwrap_or_default()
    }

    /// Register `request` and wait for a decision, or for `cancel`.
    ///
    /// Cancellation removes the entry and yields
    /// [`AgoraError::ApprovalCancelled`]; a dropped request (gate cleared)
    /// yields [`AgoraError::ApprovalExpired`].
    pub async fn wait_for_approval(
        &self,
        request: ApprovalRequest,
        cancel: &CancellationToken,
    ) -> Result<ApprovalOutcome, AgoraError> {
        if self.is_always_allowed(&request.session_id, &request.tool_name) {
            debug!(tool = %request.tool_name, "[Approval] Session allow-list hit");
            return Ok(ApprovalOutcome::Approved);
        }

        let key = (request.turn_id.clone(), request.tool_call_id.clone());
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| AgoraError::ApprovalCancelled(request.tool_call_id.clone()))?;
            pending.insert(
                key.clone(),
                Pending {
                    request: request.clone(),
                    tx,
                    created: Instant::now(),
                },
            );
        }
        info!(
            turn_id = %request.turn_id,
            tool_call_id = %request.tool_call_id,
            tool = %request.tool_name,
            reason = %request.reason,
            "[Approval] Waiting for decision"
        );
        let _ = self.requests_tx.send(request.clone());

        tokio::select! {
            decision = rx => match decision {
                Ok(d) if d.approved => Ok(ApprovalOutcome::Approved),
                Ok(d) => Ok(ApprovalOutcome::Denied {
                    reason: d.reason.unwrap_or_else(|| "denied by operator".to_string()),
                }),
                Err(_) => Err(AgoraError::ApprovalExpired(request.tool_call_id)),
            },
            _ = cancel.cancelled() => {
                self.remove(&key);
                warn!(tool_call_id = %request.tool_call_id, "[Approval] Cancelled while pending");
                Err(AgoraError::ApprovalCancelled(request.tool_call_id))
            }
        }
    }

    /// Deliver a decision. Returns false if nothing was pending under the key.
    pub fn resolve(&self, turn_id: &str, tool_call_id: &str, decision: ApprovalDecision) -> bool {
        let Some(entry) = self.remove(&(turn_id.to_string(), tool_call_id.to_string())) else {
            return false;
        };
        if decision.approved && decision.always_allow {
            if let Ok(mut allow) = self.session_allow.lock() {
                allow
                    .entry(entry.request.session_id.clone())
                    .or_default()
                    .insert(entry.request.tool_name.clone());
            }
        }
        info!(
            turn_id,
            tool_call_id,
            approved = decision.approved,
            always_allow = decision.always_allow,
            "[Approval] Resolved"
        );
        entry.tx.send(decision).is_ok()
    }

    /// Auto-deny requests older than `max_age`. Returns how many expired.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let expired: Vec<Pending> = match self.pending.lock() {
            Ok(mut pending) => {
                let keys: Vec<PendingKey> = pending
                    .iter()
                    .filter(|(_, p)| p.created.elapsed() >= max_age)
                    .map(|(k, _)| k.clone())
                    .collect();
                keys.iter().filter_map(|k| pending.remove(k)).collect()
            }
            Err(_) => return 0,
        };
        let count = expired.len();
        for entry in expired {
            warn!(
                tool_call_id = %entry.request.tool_call_id,
                "[Approval] Request expired, auto-denying"
            );
            let _ = entry.tx.send(ApprovalDecision::deny(format!(
                "approval expired after {}s",
                max_age.as_secs()
            )));
        }
        count
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        max_age: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let n = self.sweep(max_age);
                        if n > 0 {
                            debug!(expired = n, "[Approval] Sweep");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Forget the allow-list of a finished session.
    pub fn clear_session(&self, session_id: &str) {
        if let Ok(mut allow) = self.session_allow.lock() {
            allow.remove(session_id);
        }
    }

    fn remove(&self, key: &PendingKey) -> Option<Pending> {
        self.pending.lock().ok().and_then(|mut p| p.remove(key))
    }
}
