//! Hook trait and per-phase chains.
//!
//! Hooks of one phase run one after another in registration order. A
//! `before_turn` rewrite is visible to the hooks after it, the first abort
//! ends the chain, and a hook that errors or overruns its time slot is
//! skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::{HookPayload, HookPhase, HookResult};

/// Time slot a single hook gets before it is skipped.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Return `HookResult::pass()` to leave the turn untouched.
    async fn run(&self, payload: &HookPayload) -> Result<HookResult>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type Chain = Vec<Arc<dyn Hook>>;

#[derive(Clone)]
pub struct HookRegistry {
    chains: Arc<RwLock<HashMap<HookPhase, Chain>>>,
    timeout: Duration,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_HOOK_TIMEOUT)
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            chains: Arc::default(),
            timeout,
        }
    }

    pub async fn register(&self, phase: HookPhase, hook: Arc<dyn Hook>) {
        debug!(hook = hook.name(), ?phase, "[Hooks] Registered");
        self.chains.write().await.entry(phase).or_default().push(hook);
    }

    pub async fn count(&self, phase: HookPhase) -> usize {
        self.chains.read().await.get(&phase).map_or(0, Vec::len)
    }

    /// Run the chain for the payload's phase and fold the results.
    pub async fn run(&self, payload: &HookPayload) -> HookResult {
        let phase = payload.phase();
        // Snapshot, so a hook may register hooks without deadlocking.
        let chain: Chain = match self.chains.read().await.get(&phase) {
            Some(chain) => chain.clone(),
            None => return HookResult::pass(),
        };

        let mut current = payload.clone();
        let mut folded = HookResult::pass();
        for hook in chain {
            let result = match tokio::time::timeout(self.timeout, hook.run(&current)).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!(hook = hook.name(), ?phase, error = %e, "[Hooks] Hook failed, skipping");
                    continue;
                }
                Err(_) => {
                    warn!(
                        hook = hook.name(),
                        ?phase,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "[Hooks] Hook timed out, skipping"
                    );
                    continue;
                }
            };
            if result.abort {
                debug!(hook = hook.name(), reason = ?result.reason, "[Hooks] Chain aborted");
                folded.abort = true;
                folded.reason = result.reason;
                return folded;
            }
            if let Some(content) = result.modified_content {
                if let HookPayload::BeforeTurn(turn) = &mut current {
                    turn.text = content.clone();
                }
                folded.modified_content = Some(content);
            }
            if let Some(model) = result.model_override {
                folded.model_override = Some(model);
            }
        }
        folded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TurnPayload;

    struct Suffix(&'static str);

    #[async_trait]
    impl Hook for Suffix {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, payload: &HookPayload) -> Result<HookResult> {
            match payload {
                HookPayload::BeforeTurn(turn) => Ok(HookResult::transform(format!("{} {}", turn.text, self.0))),
                _ => Ok(HookResult::pass()),
            }
        }
    }

    struct Stall;

    #[async_trait]
    impl Hook for Stall {
        fn name(&self) -> &str {
            "stall"
        }

        async fn run(&self, _payload: &HookPayload) -> Result<HookResult> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(HookResult::abort("never"))
        }
    }

    fn before_turn(text: &str) -> HookPayload {
        HookPayload::BeforeTurn(TurnPayload {
            agent_id: "syn".into(),
            session_id: "s1".into(),
            turn_id: "t1".into(),
            text: text.into(),
            depth: 0,
        })
    }

    #[tokio::test]
    async fn test_rewrites_chain_through() {
        let registry = HookRegistry::new();
        registry.register(HookPhase::BeforeTurn, Arc::new(Suffix("a"))).await;
        registry.register(HookPhase::BeforeTurn, Arc::new(Suffix("b"))).await;
        let result = registry.run(&before_turn("hi")).await;
        assert_eq!(result.modified_content.as_deref(), Some("hi a b"));
    }

    #[tokio::test]
    async fn test_slow_hook_is_skipped() {
        let registry = HookRegistry::with_timeout(Duration::from_millis(20));
        registry.register(HookPhase::BeforeTurn, Arc::new(Stall)).await;
        registry.register(HookPhase::BeforeTurn, Arc::new(Suffix("ok"))).await;
        let result = registry.run(&before_turn("hi")).await;
        assert!(!result.abort);
        assert_eq!(result.modified_content.as_deref(), Some("hi ok"));
    }
}
