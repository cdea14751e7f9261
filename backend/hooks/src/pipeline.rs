//! Hook pipeline executor.
//!
//! The engine awaits `before_turn` and `before_distill` (their results can
//! rewrite or abort the work) and fires `after_turn` / `after_distill` in a
//! detached task so observers never delay the caller.

use tracing::debug;

use crate::registry::HookRegistry;
use crate::types::{DistillPayload, HookPayload, HookResult, TurnCompletePayload, TurnPayload};

#[derive(Clone, Default)]
pub struct HookPipeline {
    pub registry: HookRegistry,
}

impl HookPipeline {
    pub fn new(registry: HookRegistry) -> Self {
        Self { registry }
    }

    pub async fn before_turn(&self, payload: TurnPayload) -> HookResult {
        debug!("[Pipeline] before_turn session={}", payload.session_id);
        self.registry.run(&HookPayload::BeforeTurn(payload)).await
    }

    pub fn after_turn(&self, payload: TurnCompletePayload) {
        debug!("[Pipeline] after_turn session={}", payload.session_id);
        self.spawn(HookPayload::AfterTurn(payload));
    }

    pub async fn before_distill(&self, payload: DistillPayload) -> HookResult {
        debug!("[Pipeline] before_distill session={}", payload.session_id);
        self.registry.run(&HookPayload::BeforeDistill(payload)).await
    }

    pub fn after_distill(&self, payload: DistillPayload) {
        debug!("[Pipeline] after_distill session={}", payload.session_id);
        self.spawn(HookPayload::AfterDistill(payload));
    }

    fn spawn(&self, payload: HookPayload) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let result = registry.run(&payload).await;
            if result.abort {
                debug!(
                    "[Pipeline] abort ignored for observational phase {:?}",
                    payload.phase()
                );
            }
        });
    }
}
