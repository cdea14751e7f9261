//! Cross-agent calls: send, ask, spawn, dispatch, deliberate.
//!
//! Every call becomes an ordinary turn on the target agent, submitted
//! through the coordinator at `depth + 1`, and leaves one audit row in the
//! store. The dispatcher holds only a weak handle on the coordinator so
//! the two can reference each other without a cycle.

use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use agora_config::CrossAgentConfig;
use agora_core::{
    AgoraError, CallKind, CallStatus, CrossAgentCall, EventKind, EventSink, InboundMessage,
    InteractionSignal, RuntimeEvent, SessionStore, TurnOutcome,
};
use agora_tools::{
    AskReply, CallOrigin, CrossAgentBackend, DeliberationReport, DeliberationRequest, DispatchReport,
    DispatchTask, DispatchTaskResult, SendReceipt,
};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::TurnCoordinator;
use crate::deliberate;
use crate::signals::DisagreementDetector;

/// Where a cross-agent turn lands on the target side.
struct Landing {
    kind: CallKind,
    session_key: String,
    parent_session_id: Option<String>,
    timeout: Duration,
}

/// Armed while a caller waits on a cross-agent turn. If the caller's future
/// is dropped first, the target turn is cancelled and the audit row closed.
struct PendingCall {
    call_id: String,
    store: Arc<dyn SessionStore>,
    cancel: CancellationToken,
    armed: bool,
}

impl PendingCall {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel();
        warn!(call_id = %self.call_id, "[Dispatch] Caller stopped waiting, abandoning call");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let call_id = std::mem::take(&mut self.call_id);
        handle.spawn(async move {
            // Only pending rows are updated, so a settled call keeps its status.
            if let Err(e) = store
                .complete_cross_agent_call(&call_id, CallStatus::Error, Some("abandoned by caller"), None)
                .await
            {
                warn!(call_id = %call_id, error = %e, "[Dispatch] Audit row not updated");
            }
        });
    }
}

pub struct Dispatcher {
    config: CrossAgentConfig,
    store: Arc<dyn SessionStore>,
    events: Arc<dyn EventSink>,
    detector: DisagreementDetector,
    coordinator: OnceLock<Weak<TurnCoordinator>>,
}

impl Dispatcher {
    pub fn new(
        config: CrossAgentConfig,
        store: Arc<dyn SessionStore>,
        events: Arc<dyn EventSink>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            store,
            events,
            detector: DisagreementDetector::new()?,
            coordinator: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &CrossAgentConfig {
        &self.config
    }

    /// Attach the coordinator whose turns this dispatcher submits.
    pub fn bind(&self, coordinator: &Arc<TurnCoordinator>) {
        if self.coordinator.set(Arc::downgrade(coordinator)).is_err() {
            warn!("[Dispatch] Coordinator already bound");
        }
    }

    fn coordinator(&self) -> Result<Arc<TurnCoordinator>, AgoraError> {
        self.coordinator
            .get()
            .and_then(Weak::upgrade)
            .ok_or(AgoraError::ShuttingDown)
    }

    pub(crate) fn ask_timeout(&self) -> Duration {
        Duration::from_secs(self.config.ask_timeout_secs)
    }

    fn check_depth(&self, origin: &CallOrigin) -> Result<(), AgoraError> {
        let next = origin.depth + 1;
        if next >= self.config.max_depth {
            warn!(
                source = %origin.agent_id,
                depth = next,
                max = self.config.max_depth,
                "[Dispatch] Depth ceiling reached"
            );
            return Err(AgoraError::DepthExceeded {
                depth: next,
                max: self.config.max_depth,
            });
        }
        Ok(())
    }

    fn check_target(&self, coordinator: &TurnCoordinator, origin: &CallOrigin, target: &str) -> Result<(), AgoraError> {
        if target == origin.agent_id {
            return Err(AgoraError::SelfTarget(target.to_string()));
        }
        if !coordinator.knows_agent(target) {
            return Err(AgoraError::UnknownAgent(target.to_string()));
        }
        Ok(())
    }

    /// Validate, then hand back the coordinator to submit through.
    fn admit(&self, origin: &CallOrigin, target: &str) -> Result<Arc<TurnCoordinator>, AgoraError> {
        let coordinator = self.coordinator()?;
        self.check_target(&coordinator, origin, target)?;
        self.check_depth(origin)?;
        Ok(coordinator)
    }

    fn inbound(origin: &CallOrigin, target: &str, message: &str, landing: &Landing) -> InboundMessage {
        InboundMessage {
            text: format!("[from {}] {}", origin.agent_id, message),
            agent_id: Some(target.to_string()),
            session_key: Some(landing.session_key.clone()),
            depth: origin.depth + 1,
            parent_session_id: landing.parent_session_id.clone(),
            source_agent_id: Some(origin.agent_id.clone()),
            ..InboundMessage::default()
        }
    }

    async fn open_call(&self, origin: &CallOrigin, target: &str, kind: CallKind, message: &str) -> Result<CrossAgentCall, AgoraError> {
        let call = CrossAgentCall::new(
            origin.agent_id.clone(),
            Some(origin.session_id.clone()),
            target,
            kind,
            message,
        );
        self.store.record_cross_agent_call(&call).await?;
        info!(
            call_id = %call.id,
            kind = ?kind,
            source = %origin.agent_id,
            target,
            depth = origin.depth + 1,
            "[Dispatch] Cross-agent call"
        );
        self.events.emit(
            RuntimeEvent::new(
                &origin.agent_id,
                EventKind::CrossAgentCall,
                json!({ "callId": call.id, "kind": kind, "target": target, "depth": origin.depth + 1 }),
            )
            .in_session(&origin.session_id),
        );
        Ok(call)
    }

    async fn close_call(&self, call_id: &str, status: CallStatus, response: Option<&str>, target_session: Option<&str>) {
        if let Err(e) = self
            .store
            .complete_cross_agent_call(call_id, status, response, target_session)
            .await
        {
            warn!(call_id, error = %e, "[Dispatch] Audit row not updated");
        }
    }

    /// Submit a turn on `target` and wait for its reply, up to `landing.timeout`.
    async fn converse(
        &self,
        coordinator: Arc<TurnCoordinator>,
        origin: &CallOrigin,
        target: &str,
        message: &str,
        landing: Landing,
    ) -> Result<AskReply, AgoraError> {
        let call = self.open_call(origin, target, landing.kind, message).await?;
        let inbound = Self::inbound(origin, target, message, &landing);
        let cancel = origin.cancel.child_token();
        let pending = PendingCall {
            call_id: call.id.clone(),
            store: self.store.clone(),
            cancel: cancel.clone(),
            armed: true,
        };
        let turn = {
            let cancel = cancel.clone();
            tokio::spawn(async move { coordinator.submit_with_cancel(inbound, cancel).await })
        };

        let outcome = match tokio::time::timeout(landing.timeout, turn).await {
            Err(_) => {
                cancel.cancel();
                warn!(call_id = %call.id, target, secs = landing.timeout.as_secs(), "[Dispatch] Call timed out");
                self.close_call(&call.id, CallStatus::Timeout, None, None).await;
                pending.disarm();
                return Err(AgoraError::CrossAgentTimeout {
                    agent: target.to_string(),
                    secs: landing.timeout.as_secs(),
                });
            }
            Ok(Err(join)) => Err(AgoraError::Other(anyhow::anyhow!("turn task failed: {}", join))),
            Ok(Ok(result)) => result,
        };
        let reply = self.settle(&call, origin, target, outcome).await;
        pending.disarm();
        reply
    }

    async fn settle(
        &self,
        call: &CrossAgentCall,
        origin: &CallOrigin,
        target: &str,
        outcome: Result<TurnOutcome, AgoraError>,
    ) -> Result<AskReply, AgoraError> {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.close_call(&call.id, CallStatus::Error, Some(&e.to_string()), None).await;
                return Err(e);
            }
        };
        if outcome.aborted() {
            self.close_call(&call.id, CallStatus::Error, Some("aborted"), Some(&outcome.session_id)).await;
            return Err(AgoraError::Aborted);
        }
        if let Some(error) = &outcome.error {
            self.close_call(&call.id, CallStatus::Error, Some(error), Some(&outcome.session_id)).await;
            return Err(AgoraError::Other(anyhow::anyhow!("{} could not answer: {}", target, error)));
        }

        self.close_call(&call.id, CallStatus::Responded, Some(&outcome.text), Some(&outcome.session_id))
            .await;
        let disagreement = self.detector.detect(&outcome.text);
        if let Some(pattern) = disagreement {
            self.note_disagreement(call, origin, target, pattern).await;
        }
        debug!(call_id = %call.id, target, chars = outcome.text.len(), "[Dispatch] Reply received");
        Ok(AskReply {
            call_id: call.id.clone(),
            target_agent_id: target.to_string(),
            session_id: outcome.session_id,
            text: outcome.text,
            disagreement: disagreement.map(str::to_string),
        })
    }

    async fn note_disagreement(&self, call: &CrossAgentCall, origin: &CallOrigin, target: &str, pattern: &str) {
        info!(call_id = %call.id, source = %origin.agent_id, target, pattern, "[Dispatch] Disagreement");
        let detail = json!({ "callId": call.id, "target": target, "pattern": pattern });
        self.events.emit(
            RuntimeEvent::new(&origin.agent_id, EventKind::Disagreement, detail.clone()).in_session(&origin.session_id),
        );
        let signal = InteractionSignal {
            session_id: Some(origin.session_id.clone()),
            agent_id: origin.agent_id.clone(),
            kind: "disagreement".to_string(),
            detail,
        };
        if let Err(e) = self.store.record_signal(&signal).await {
            warn!(error = %e, "[Dispatch] Signal not recorded");
        }
    }

    async fn run_task(
        &self,
        coordinator: Arc<TurnCoordinator>,
        origin: &CallOrigin,
        index: usize,
        task: DispatchTask,
    ) -> DispatchTaskResult {
        let started = Instant::now();
        let result = match self.check_target(&coordinator, origin, &task.agent) {
            Ok(()) => {
                let landing = Landing {
                    kind: CallKind::Spawn,
                    session_key: format!("dispatch:{}", Uuid::new_v4()),
                    parent_session_id: Some(origin.session_id.clone()),
                    timeout: Duration::from_secs(self.config.dispatch_timeout_secs),
                };
                self.converse(coordinator, origin, &task.agent, &task.message, landing).await
            }
            Err(e) => Err(e),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(reply) => DispatchTaskResult {
                index,
                agent: task.agent,
                ok: true,
                text: Some(reply.text),
                error: None,
                duration_ms,
            },
            Err(e) => {
                warn!(index, agent = %task.agent, error = %e, "[Dispatch] Task failed");
                DispatchTaskResult {
                    index,
                    agent: task.agent,
                    ok: false,
                    text: None,
                    error: Some(e.to_string()),
                    duration_ms,
                }
            }
        }
    }
}

#[async_trait]
impl CrossAgentBackend for Dispatcher {
    async fn send(&self, origin: &CallOrigin, target: &str, message: &str) -> Result<SendReceipt, AgoraError> {
        let coordinator = self.admit(origin, target)?;
        let call = self.open_call(origin, target, CallKind::Send, message).await?;
        let landing = Landing {
            kind: CallKind::Send,
            session_key: format!("ask:{}", origin.agent_id),
            parent_session_id: None,
            timeout: self.ask_timeout(),
        };
        let inbound = Self::inbound(origin, target, message, &landing);
        let store = self.store.clone();
        let call_id = call.id.clone();
        tokio::spawn(async move {
            // Fire and forget: the sender's turn may end before this one starts.
            let (status, response, session) = match coordinator.submit_with_cancel(inbound, CancellationToken::new()).await {
                Ok(outcome) if outcome.is_ok() => (CallStatus::Delivered, None, Some(outcome.session_id)),
                Ok(outcome) => (CallStatus::Error, outcome.error, Some(outcome.session_id)),
                Err(e) => (CallStatus::Error, Some(e.to_string()), None),
            };
            if let Err(e) = store
                .complete_cross_agent_call(&call_id, status, response.as_deref(), session.as_deref())
                .await
            {
                warn!(call_id = %call_id, error = %e, "[Dispatch] Audit row not updated");
            }
        });
        Ok(SendReceipt {
            call_id: call.id,
            target_agent_id: target.to_string(),
        })
    }

    async fn ask(
        &self,
        origin: &CallOrigin,
        target: &str,
        message: &str,
        timeout: Option<Duration>,
    ) -> Result<AskReply, AgoraError> {
        let coordinator = self.admit(origin, target)?;
        let landing = Landing {
            kind: CallKind::Ask,
            session_key: format!("ask:{}", origin.agent_id),
            parent_session_id: None,
            timeout: timeout.unwrap_or_else(|| self.ask_timeout()),
        };
        self.converse(coordinator, origin, target, message, landing).await
    }

    async fn spawn(
        &self,
        origin: &CallOrigin,
        target: &str,
        task: &str,
        timeout: Option<Duration>,
    ) -> Result<AskReply, AgoraError> {
        let coordinator = self.admit(origin, target)?;
        let landing = Landing {
            kind: CallKind::Spawn,
            session_key: format!("spawn:{}", Uuid::new_v4()),
            parent_session_id: Some(origin.session_id.clone()),
            timeout: timeout.unwrap_or_else(|| self.ask_timeout()),
        };
        self.converse(coordinator, origin, target, task, landing).await
    }

    async fn dispatch(&self, origin: &CallOrigin, tasks: Vec<DispatchTask>) -> Result<DispatchReport, AgoraError> {
        if tasks.len() > self.config.max_dispatch_tasks {
            return Err(AgoraError::TooManyTasks {
                requested: tasks.len(),
                max: self.config.max_dispatch_tasks,
            });
        }
        let coordinator = self.coordinator()?;
        self.check_depth(origin)?;

        info!(source = %origin.agent_id, tasks = tasks.len(), "[Dispatch] Fan-out");
        let started = Instant::now();
        let runs = tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| self.run_task(coordinator.clone(), origin, index, task));
        let results = join_all(runs).await;

        let succeeded = results.iter().filter(|r| r.ok).count();
        let report = DispatchReport {
            succeeded,
            failed: results.len() - succeeded,
            sequential_ms: results.iter().map(|r| r.duration_ms).sum(),
            wall_clock_ms: started.elapsed().as_millis() as u64,
            results,
        };
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            wall_clock_ms = report.wall_clock_ms,
            sequential_ms = report.sequential_ms,
            "[Dispatch] Fan-out finished"
        );
        Ok(report)
    }

    async fn deliberate(
        &self,
        origin: &CallOrigin,
        request: DeliberationRequest,
    ) -> Result<DeliberationReport, AgoraError> {
        let coordinator = self.coordinator()?;
        if request.agents.is_empty() {
            return Err(AgoraError::Other(anyhow::anyhow!("deliberation needs at least one agent")));
        }
        for agent in request.agents.iter().chain(request.synthesizer.iter()) {
            self.check_target(&coordinator, origin, agent)?;
        }
        self.check_depth(origin)?;
        deliberate::run(self, origin, request).await
    }
}
