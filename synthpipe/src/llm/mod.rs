//! Upstream LLM collaborator contracts.
//!
//! The pipeline treats the model as a black-box RPC: a complete call, a
//! streaming call, and system prompts loaded once per step.

mod client;
mod prompts;

pub use client::{LlmRequest, LlmResponse, StreamChunk, TokenStream, UpstreamClient, Usage};
#[cfg(test)]
pub use prompts::MockPromptLoader;
pub use prompts::{DirectoryPromptLoader, PromptLoader, StaticPromptLoader};
