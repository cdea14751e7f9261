//! Route resolver: maps an inbound message to the agent that should handle it.
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Route binding
// ---------------------------------------------------------------------------

/// An explicit channel → agent binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteBinding {
    pub channel: String,
    pub agent_id: String,
    /// If set, only messages from this peer are routed here.
    pub peer: Option<String>,
}

// ---------------------------------------------------------------------------
// Route result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    /// The message named its agent.
    Explicit,
    /// A channel or channel+peer binding matched.
    Binding,
    /// Fell through to the default agent.
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResult {
    pub agent_id: String,
    pub source: RouteSource,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Thread-safe route resolver.
#[derive(Default, Clone)]
pub struct RouteResolver {
    /// Explicit channel bindings configured by the operator.
    bindings: Arc<RwLock<Vec<RouteBinding>>>,
    default_agent: Arc<RwLock<Option<String>>>,
}

impl RouteResolver {
    pub fn new(default_agent: Option<String>) -> Self {
        Self {
            bindings: Arc::default(),
            default_agent: Arc::new(RwLock::new(default_agent)),
        }
    }

    /// Add a static routing binding.
    pub async fn add_binding(&self, binding: RouteBinding) {
        self.bindings.write().await.push(binding);
    }

    pub async fn set_default_agent(&self, agent_id: Option<String>) {
        *self.default_agent.write().await = agent_id;
    }

    /// Resolve the target agent: explicit id, then a peer-specific binding,
    /// then a channel-wide binding, then the default agent.
    pub async fn resolve(
        &self,
        explicit: Option<&str>,
        channel: Option<&str>,
        peer: Option<&str>,
    ) -> Option<RouteResult> {
        if let Some(agent_id) = explicit {
            return Some(RouteResult {
                agent_id: agent_id.to_string(),
                source: RouteSource::Explicit,
            });
        }

        if let Some(channel) = channel {
            let bindings = self.bindings.read().await;
            let peer_match = bindings
                .iter()
                .find(|b| b.channel == channel && b.peer.is_some() && b.peer.as_deref() == peer);
            let channel_match = bindings
                .iter()
                .find(|b| b.channel == channel && b.peer.is_none());
            if let Some(binding) = peer_match.or(channel_match) {
                debug!("[Router] {} → binding agent {}", channel, binding.agent_id);
                return Some(RouteResult {
                    agent_id: binding.agent_id.clone(),
                    source: RouteSource::Binding,
                });
            }
        }

        self.default_agent.read().await.clone().map(|agent_id| RouteResult {
            agent_id,
            source: RouteSource::Default,
        })
    }
}
