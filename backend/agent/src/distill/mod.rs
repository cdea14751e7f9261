//! History distillation.

pub mod extract;
pub mod pipeline;

pub use extract::{Extraction, extract_json, parse_extraction};
pub use pipeline::{DISTILLATION_LOG, DistillTrigger, DistillationPipeline, chunk_transcript, split_point};
