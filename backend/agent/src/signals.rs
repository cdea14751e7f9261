//! Declarative pattern → signal detectors.
//!
//! Both lists are heuristics. Callers only rely on the shape: a labelled
//! regex list where the first hit names the signal.

use anyhow::{anyhow, Result};
use regex::Regex;

/// Fixed reply for a turn stopped by the circuit breaker.
pub const CIRCUIT_BREAKER_REFUSAL: &str = "I can't act on that message: it looks like an attempt to override my instructions. \
Please rephrase what you need.";

/// Prompt-injection shapes checked on inbound user text.
pub static INJECTION_PATTERNS: &[(&str, &str)] = &[
    ("ignore_instructions", r"(?i)\b(ignore|disregard|forget)\s+(all\s+)?(your\s+|the\s+)?(previous|prior|above|earlier)\s+(instructions|prompts?|rules)"),
    ("override_system", r"(?i)\b(disregard|override|bypass)\s+(your\s+|the\s+)?(system\s+prompt|safety|guardrails)"),
    ("persona_hijack", r"(?i)\byou\s+are\s+now\s+(DAN|in\s+developer\s+mode|jailbroken|unrestricted)"),
    ("prompt_exfiltration", r"(?i)\b(reveal|print|repeat|show)\s+(me\s+)?(your\s+)?(system\s+prompt|hidden\s+instructions)"),
    ("fake_system_tag", r"(?i)</?\s*system\s*>"),
];

/// Pushback shapes checked on cross-agent replies.
pub static DISAGREEMENT_PATTERNS: &[(&str, &str)] = &[
    ("disagree", r"(?i)\bI\s+(respectfully\s+|strongly\s+)?disagree\b"),
    ("incorrect", r"(?i)\b(that'?s|that\s+is|this\s+is)\s+(not\s+correct|incorrect|wrong)\b"),
    ("pushback", r"(?i)\bI\s+(would\s+)?(push\s+back|advise\s+against|recommend\s+against)\b"),
    ("concern", r"(?i)\bI\s+have\s+(serious\s+|some\s+)?concerns\b"),
    ("refusal", r"(?i)\bI\s+(can'?t|cannot|won'?t)\s+(do|help\s+with|agree\s+to)\s+that\b"),
];

pub struct PatternSet {
    patterns: Vec<(&'static str, Regex)>,
}

impl PatternSet {
    pub fn new(specs: &[(&'static str, &str)]) -> Result<Self> {
        let patterns = specs
            .iter()
            .map(|(label, p)| {
                Regex::new(p)
                    .map(|re| (*label, re))
                    .map_err(|e| anyhow!("bad pattern {}: {}", label, e))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Label of the first pattern that matches.
    pub fn first_match(&self, text: &str) -> Option<&'static str> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(label, _)| *label)
    }
}

/// Refuses inbound text that looks like prompt injection.
pub struct CircuitBreaker {
    patterns: PatternSet,
}

impl CircuitBreaker {
    pub fn new() -> Result<Self> {
        Self::with_patterns(INJECTION_PATTERNS)
    }

    pub fn with_patterns(specs: &[(&'static str, &str)]) -> Result<Self> {
        Ok(Self {
            patterns: PatternSet::new(specs)?,
        })
    }

    pub fn check(&self, text: &str) -> Option<&'static str> {
        self.patterns.first_match(text)
    }
}

pub struct DisagreementDetector {
    patterns: PatternSet,
}

impl DisagreementDetector {
    pub fn new() -> Result<Self> {
        Self::with_patterns(DISAGREEMENT_PATTERNS)
    }

    pub fn with_patterns(specs: &[(&'static str, &str)]) -> Result<Self> {
        Ok(Self {
            patterns: PatternSet::new(specs)?,
        })
    }

    pub fn detect(&self, text: &str) -> Option<&'static str> {
        self.patterns.first_match(text)
    }
}
