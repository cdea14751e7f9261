//! Turns the stored message log into a model-ready conversation.
//!
//! Passes run in a fixed order: time prefixes, assistant block parsing,
//! tool-result grouping, the new user turn, global orphan repair,
//! duplicate-result removal, then merging of adjacent plain user text.
//! Repair has to see the whole array; "answered" is a global property.

use std::collections::HashSet;

use agora_core::tokens::{estimate_message, estimate_messages};
use agora_core::{
    ChatRole, ContentBlock, ConversationMessage, MediaAttachment, MessageContent, StoredMessage,
    StoredRole,
};
use chrono::{DateTime, FixedOffset, Local, Offset, TimeZone, Utc};
use tracing::debug;

/// First line of the message that replaces distilled history.
pub const SUMMARY_MARKER: &str = "[Distilled conversation summary]";

/// Content of the synthetic result inserted for an unanswered tool use.
pub const MISSING_RESULT: &str =
    "[tool result missing: the turn ended before this call returned]";

/// Without a pinned offset, each timestamp is shown in the local offset in
/// force at that instant.
#[derive(Default)]
pub struct HistoryBuilder {
    offset: Option<FixedOffset>,
}

impl HistoryBuilder {
    pub fn with_offset(offset: FixedOffset) -> Self {
        Self { offset: Some(offset) }
    }

    pub fn build(
        &self,
        stored: &[StoredMessage],
        new_text: &str,
        media: &[MediaAttachment],
        now: DateTime<Utc>,
    ) -> Vec<ConversationMessage> {
        let mut messages = self.replay(stored);

        let text = self.prefixed(new_text, now);
        if media.is_empty() {
            messages.push(ConversationMessage::user_text(text));
        } else {
            let mut blocks = vec![ContentBlock::text(text)];
            blocks.extend(media.iter().map(MediaAttachment::to_block));
            messages.push(ConversationMessage::user_blocks(blocks));
        }

        let repaired = repair_orphans(&mut messages);
        let removed = dedupe_results(&mut messages);
        if repaired > 0 || removed > 0 {
            debug!(repaired, removed, "[History] Repaired tool pairing");
        }
        merge_user_text(messages)
    }

    fn replay(&self, stored: &[StoredMessage]) -> Vec<ConversationMessage> {
        let mut out: Vec<ConversationMessage> = Vec::new();
        let mut tool_uses: HashSet<String> = HashSet::new();
        let mut results: Vec<ContentBlock> = Vec::new();

        for msg in stored.iter().filter(|m| !m.is_distilled) {
            if msg.role != StoredRole::ToolResult && !results.is_empty() {
                out.push(ConversationMessage::user_blocks(std::mem::take(&mut results)));
            }
            match msg.role {
                StoredRole::User => {
                    let text = if msg.content.starts_with(SUMMARY_MARKER) {
                        msg.content.clone()
                    } else {
                        self.prefixed(&msg.content, msg.created_at)
                    };
                    out.push(ConversationMessage::user_text(text));
                }
                StoredRole::Assistant => {
                    let blocks: Vec<ContentBlock> = parse_assistant(&msg.content)
                        .into_iter()
                        .filter(|b| match b {
                            ContentBlock::Thinking { signature, .. } => {
                                signature.as_deref().is_some_and(|s| !s.is_empty())
                            }
                            _ => true,
                        })
                        .collect();
                    if blocks.is_empty() {
                        continue;
                    }
                    for block in &blocks {
                        if let ContentBlock::ToolUse { id, .. } = block {
                            tool_uses.insert(id.clone());
                        }
                    }
                    out.push(ConversationMessage::assistant_blocks(blocks));
                }
                StoredRole::ToolResult => {
                    let Some(id) = msg.tool_call_id.as_deref() else {
                        continue;
                    };
                    if tool_uses.contains(id) {
                        results.push(ContentBlock::tool_result(id, msg.content.clone(), msg.is_error));
                    } else {
                        debug!(tool_use_id = id, "[History] Dropping unmatched tool result");
                    }
                }
            }
        }
        if !results.is_empty() {
            out.push(ConversationMessage::user_blocks(results));
        }
        out
    }

    fn prefixed(&self, text: &str, at: DateTime<Utc>) -> String {
        let offset = self
            .offset
            .unwrap_or_else(|| Local.offset_from_utc_datetime(&at.naive_utc()).fix());
        format!(
            "[{}] {}",
            at.with_timezone(&offset).format("%a %Y-%m-%d %H:%M %:z"),
            text
        )
    }
}

/// Stored form of assistant content: plain text when there is nothing
/// but text, otherwise the JSON block array.
pub fn encode_assistant(blocks: &[ContentBlock]) -> String {
    if blocks.iter().all(|b| matches!(b, ContentBlock::Text { .. })) {
        return blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
    }
    serde_json::to_string(blocks).unwrap_or_default()
}

pub fn parse_assistant(content: &str) -> Vec<ContentBlock> {
    if content.trim_start().starts_with('[') {
        if let Ok(blocks) = serde_json::from_str::<Vec<ContentBlock>>(content) {
            return blocks;
        }
    }
    if content.is_empty() {
        return Vec::new();
    }
    vec![ContentBlock::text(content)]
}

/// Give every tool use without a result anywhere in `messages` a synthetic
/// error result, placed at the head of the following user message.
pub fn repair_orphans(messages: &mut Vec<ConversationMessage>) -> usize {
    let mut answered: HashSet<String> = messages
        .iter()
        .flat_map(|m| m.tool_result_ids())
        .map(str::to_string)
        .collect();

    let mut repaired = 0;
    let mut i = 0;
    while i < messages.len() {
        if messages[i].role != ChatRole::Assistant {
            i += 1;
            continue;
        }
        let mut missing: Vec<String> = Vec::new();
        for id in messages[i].tool_use_ids() {
            if !answered.contains(id) && !missing.iter().any(|m| m == id) {
                missing.push(id.to_string());
            }
        }
        if !missing.is_empty() {
            let synthetic: Vec<ContentBlock> = missing
                .iter()
                .map(|id| ContentBlock::tool_result(id.clone(), MISSING_RESULT, true))
                .collect();
            repaired += synthetic.len();
            answered.extend(missing);
            match messages.get_mut(i + 1) {
                Some(next) if next.role == ChatRole::User => {
                    let existing = std::mem::replace(&mut next.content, MessageContent::Blocks(Vec::new()));
                    let mut blocks = synthetic;
                    blocks.extend(existing.into_blocks());
                    next.content = MessageContent::Blocks(blocks);
                }
                _ => messages.insert(i + 1, ConversationMessage::user_blocks(synthetic)),
            }
        }
        i += 1;
    }
    repaired
}

/// Keep only the first result per tool-use id. Returns how many were removed.
pub fn dedupe_results(messages: &mut Vec<ConversationMessage>) -> usize {
    let mut seen: HashSet<String> = HashSet::new();
    let mut removed = 0;
    for msg in messages.iter_mut() {
        if let MessageContent::Blocks(blocks) = &mut msg.content {
            blocks.retain(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    let first = seen.insert(tool_use_id.clone());
                    if !first {
                        removed += 1;
                    }
                    first
                }
                _ => true,
            });
        }
    }
    messages.retain(|m| !matches!(&m.content, MessageContent::Blocks(b) if b.is_empty()));
    removed
}

pub fn merge_user_text(messages: Vec<ConversationMessage>) -> Vec<ConversationMessage> {
    let mut out: Vec<ConversationMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        match out.last_mut() {
            Some(prev) if prev.is_plain_user_text() && msg.is_plain_user_text() => {
                if let (MessageContent::Text(a), MessageContent::Text(b)) = (&mut prev.content, &msg.content) {
                    a.push_str("\n\n");
                    a.push_str(b);
                }
            }
            _ => out.push(msg),
        }
    }
    out
}

/// Drop the oldest messages until the rest fit `budget`, cutting only in
/// front of a user message that carries no tool results. The final message
/// (the new turn) is always kept.
pub fn trim_to_budget(messages: Vec<ConversationMessage>, budget: u64) -> Vec<ConversationMessage> {
    if estimate_messages(&messages) <= budget || messages.len() <= 1 {
        return messages;
    }
    let mut suffix = vec![0u64; messages.len() + 1];
    for i in (0..messages.len()).rev() {
        suffix[i] = suffix[i + 1] + estimate_message(&messages[i]);
    }
    let is_cut_point = |m: &ConversationMessage| {
        m.role == ChatRole::User && m.tool_result_ids().is_empty()
    };
    let last = messages.len() - 1;
    let cut = (1..messages.len())
        .find(|&k| is_cut_point(&messages[k]) && suffix[k] <= budget)
        .unwrap_or(last);
    let mut kept: Vec<ConversationMessage> = messages.into_iter().skip(cut).collect();
    let stranded = drop_stranded_results(&mut kept);
    debug!(dropped = cut, stranded, budget, "[History] Trimmed to budget");
    kept
}

/// Remove results whose tool use is not earlier in `messages`, then any
/// message left empty.
fn drop_stranded_results(messages: &mut Vec<ConversationMessage>) -> usize {
    let mut issued: HashSet<String> = HashSet::new();
    let mut removed = 0;
    for msg in messages.iter_mut() {
        if let MessageContent::Blocks(blocks) = &mut msg.content {
            blocks.retain(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } if !issued.contains(tool_use_id) => {
                    removed += 1;
                    false
                }
                _ => true,
            });
        }
        issued.extend(msg.tool_use_ids().into_iter().map(str::to_string));
    }
    messages.retain(|m| !matches!(&m.content, MessageContent::Blocks(b) if b.is_empty()));
    removed
}
