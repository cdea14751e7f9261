//! Token estimation. Approximate by design; the margin keeps budgets conservative.

use crate::traits::ToolDefinition;
use crate::types::{ContentBlock, ConversationMessage, MessageContent};

/// Multiplier applied on top of the chars/4 heuristic.
pub const SAFETY_MARGIN: f64 = 1.15;

/// Flat cost charged for an image or document block.
const MEDIA_BLOCK_TOKENS: u64 = 1_600;

/// Estimate tokens for a string: ceil(chars / 4) * 1.15, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    if chars == 0 {
        return 0;
    }
    let raw = chars.div_ceil(4);
    (raw as f64 * SAFETY_MARGIN).ceil() as u64
}

pub fn estimate_block(block: &ContentBlock) -> u64 {
    match block {
        ContentBlock::Text { text } => estimate_tokens(text),
        ContentBlock::Thinking { thinking, .. } => estimate_tokens(thinking),
        ContentBlock::ToolUse { name, input, .. } => {
            estimate_tokens(name) + estimate_tokens(&input.to_string())
        }
        ContentBlock::ToolResult { content, .. } => estimate_tokens(content),
        ContentBlock::Image { .. } | ContentBlock::Document { .. } => MEDIA_BLOCK_TOKENS,
    }
}

pub fn estimate_message(message: &ConversationMessage) -> u64 {
    match &message.content {
        MessageContent::Text(text) => estimate_tokens(text),
        MessageContent::Blocks(blocks) => blocks.iter().map(estimate_block).sum(),
    }
}

pub fn estimate_messages(messages: &[ConversationMessage]) -> u64 {
    messages.iter().map(estimate_message).sum()
}

pub fn estimate_tool_definitions(defs: &[ToolDefinition]) -> u64 {
    defs.iter()
        .map(|d| {
            estimate_tokens(&d.name)
                + estimate_tokens(&d.description)
                + estimate_tokens(&d.input_schema.to_string())
        })
        .sum()
}
