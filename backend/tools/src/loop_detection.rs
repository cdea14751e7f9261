//! Tool loop detection: stops agents from calling the same tool with the
//! same input over and over, or from grinding through a streak of errors.
//!
//! A fixed-capacity ring of recent calls is scanned on every record.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const DEFAULT_WINDOW: usize = 12;
pub const DEFAULT_WARN_THRESHOLD: usize = 3;
pub const DEFAULT_HALT_THRESHOLD: usize = 5;
pub const DEFAULT_ERROR_STREAK_WARN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopDetectorConfig {
    pub window: usize,
    pub warn_threshold: usize,
    pub halt_threshold: usize,
    pub error_streak_warn: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            warn_threshold: DEFAULT_WARN_THRESHOLD,
            halt_threshold: DEFAULT_HALT_THRESHOLD,
            error_streak_warn: DEFAULT_ERROR_STREAK_WARN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum LoopVerdict {
    Ok,
    /// Inject a corrective nudge and keep going.
    Warn { reason: String },
    /// Stop the tool loop.
    Halt { reason: String },
}

impl LoopVerdict {
    pub fn is_halt(&self) -> bool {
        matches!(self, LoopVerdict::Halt { .. })
    }
}

#[derive(Debug, Clone)]
struct CallEntry {
    tool_name: String,
    input_hash: String,
}

/// Detection state for a single turn.
#[derive(Debug)]
pub struct LoopDetector {
    config: LoopDetectorConfig,
    ring: VecDeque<CallEntry>,
    /// (tool, hash) pairs already warned about since the last reset.
    warned: HashSet<(String, String)>,
    error_streak: usize,
    error_warned: bool,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(LoopDetectorConfig::default())
    }
}

impl LoopDetector {
    pub fn new(config: LoopDetectorConfig) -> Self {
        let window = config.window.max(1);
        Self {
            config: LoopDetectorConfig { window, ..config },
            ring: VecDeque::with_capacity(window),
            warned: HashSet::new(),
            error_streak: 0,
            error_warned: false,
        }
    }

    pub fn config(&self) -> &LoopDetectorConfig {
        &self.config
    }

    /// Record a finished call and judge the window.
    pub fn record(&mut self, tool_name: &str, input: &Value, is_error: bool) -> LoopVerdict {
        let input_hash = stable_input_hash(input);
        if self.ring.len() == self.config.window {
            self.ring.pop_front();
        }
        self.ring.push_back(CallEntry {
            tool_name: tool_name.to_string(),
            input_hash: input_hash.clone(),
        });

        if is_error {
            self.error_streak += 1;
        } else {
            self.error_streak = 0;
        }

        let repeats = self
            .ring
            .iter()
            .filter(|e| e.tool_name == tool_name && e.input_hash == input_hash)
            .count();

        if repeats >= self.config.halt_threshold {
            return LoopVerdict::Halt {
                reason: format!(
                    "'{}' was called {} times with identical input in the last {} calls",
                    tool_name,
                    repeats,
                    self.ring.len()
                ),
            };
        }

        if repeats >= self.config.warn_threshold
            && self.warned.insert((tool_name.to_string(), input_hash))
        {
            return LoopVerdict::Warn {
                reason: format!(
                    "'{}' has been called {} times with identical input. Try a different approach instead of repeating it.",
                    tool_name, repeats
                ),
            };
        }

        let streak_warn = self.config.error_streak_warn;
        if streak_warn > 0 {
            if self.error_streak >= streak_warn * 2 {
                return LoopVerdict::Halt {
                    reason: format!("{} consecutive tool calls failed", self.error_streak),
                };
            }
            if self.error_streak >= streak_warn && !self.error_warned {
                self.error_warned = true;
                return LoopVerdict::Warn {
                    reason: format!(
                        "The last {} tool calls failed. Step back and reconsider before retrying.",
                        self.error_streak
                    ),
                };
            }
        }

        LoopVerdict::Ok
    }

    pub fn reset(&mut self) {
        self.ring.clear();
        self.warned.clear();
        self.error_streak = 0;
        self.error_warned = false;
    }
}

/// Hash of `input` that ignores object key order.
pub fn stable_input_hash(input: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(input, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(&digest[..16])
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fifth_identical_call_halts() {
        let mut detector = LoopDetector::default();
        let input = json!({"command": "ls -la"});
        assert_eq!(detector.record("exec", &input, false), LoopVerdict::Ok);
        assert_eq!(detector.record("exec", &input, false), LoopVerdict::Ok);
        assert!(matches!(detector.record("exec", &input, false), LoopVerdict::Warn { .. }));
        assert_eq!(detector.record("exec", &input, false), LoopVerdict::Ok);
        assert!(detector.record("exec", &input, false).is_halt());
    }

    #[test]
    fn test_warns_once_per_pair() {
        let mut detector = LoopDetector::default();
        let a = json!({"path": "a"});
        let b = json!({"path": "b"});
        let mut warns = 0;
        for _ in 0..4 {
            for input in [&a, &b] {
                if matches!(detector.record("read", input, false), LoopVerdict::Warn { .. }) {
                    warns += 1;
                }
            }
        }
        assert_eq!(warns, 2);
    }

    #[test]
    fn test_distinct_inputs_stay_ok() {
        let mut detector = LoopDetector::default();
        for i in 0..30 {
            assert_eq!(
                detector.record("exec", &json!({"command": format!("ls {i}")}), false),
                LoopVerdict::Ok
            );
        }
    }

    #[test]
    fn test_window_forgets_old_calls() {
        let mut detector = LoopDetector::new(LoopDetectorConfig {
            window: 4,
            ..LoopDetectorConfig::default()
        });
        let input = json!({"q": 1});
        for round in 0..10 {
            detector.record("search", &input, false);
            for i in 0..3 {
                detector.record("other", &json!({"i": round * 10 + i}), false);
            }
        }
        assert!(!detector.record("search", &input, false).is_halt());
    }

    #[test]
    fn test_hash_ignores_key_order() {
        assert_eq!(
            stable_input_hash(&json!({"a": 1, "b": {"x": [1, 2], "y": null}})),
            stable_input_hash(&json!({"b": {"y": null, "x": [1, 2]}, "a": 1}))
        );
        assert_ne!(
            stable_input_hash(&json!({"a": [1, 2]})),
            stable_input_hash(&json!({"a": [2, 1]}))
        );
    }

    #[test]
    fn test_error_streak_warns_then_halts() {
        let mut detector = LoopDetector::default();
        let verdicts: Vec<LoopVerdict> = (0..8)
            .map(|i| detector.record("fetch", &json!({"url": i}), true))
            .collect();
        assert!(verdicts[..3].iter().all(|v| *v == LoopVerdict::Ok));
        assert!(matches!(verdicts[3], LoopVerdict::Warn { .. }));
        assert!(verdicts[4..7].iter().all(|v| *v == LoopVerdict::Ok));
        assert!(verdicts[7].is_halt());
    }

    #[test]
    fn test_success_breaks_error_streak() {
        let mut detector = LoopDetector::default();
        for i in 0..3 {
            detector.record("fetch", &json!({"url": i}), true);
        }
        detector.record("fetch", &json!({"url": "ok"}), false);
        for i in 10..13 {
            assert_eq!(detector.record("fetch", &json!({"url": i}), true), LoopVerdict::Ok);
        }
    }

    #[test]
    fn test_reset_clears_warnings() {
        let mut detector = LoopDetector::default();
        let input = json!({});
        for _ in 0..3 {
            detector.record("x", &input, false);
        }
        detector.reset();
        detector.record("x", &input, false);
        detector.record("x", &input, false);
        assert!(matches!(detector.record("x", &input, false), LoopVerdict::Warn { .. }));
    }
}
