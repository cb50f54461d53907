//! LLM plumbing: the provider-agnostic gateway, prompt templates and the
//! two stage-specific post-processing layers.

pub mod gateway;
pub mod prompts;
pub mod stage1;
pub mod stage2;

pub use gateway::{ChatMessage, ChatOptions, LlmGateway};
pub use stage1::{ExtractedInfo, IdentifiedService, Stage1Output};
