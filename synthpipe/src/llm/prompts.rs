//! System prompt loading.
//!
//! Prompts are loaded once when steps are constructed. A missing prompt is
//! a startup failure, never a per-request one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::errors::PromptError;

/// Loads the system prompt for a step.
#[cfg_attr(test, mockall::automock)]
pub trait PromptLoader: Send + Sync {
    /// Returns the system prompt text for `step`.
    fn load(&self, step: &str) -> Result<String, PromptError>;
}

/// In-memory prompts keyed by step name.
#[derive(Debug, Clone, Default)]
pub struct StaticPromptLoader {
    prompts: HashMap<String, String>,
}

impl StaticPromptLoader {
    /// Creates an empty loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a prompt.
    #[must_use]
    pub fn with_prompt(mut self, step: impl Into<String>, prompt: impl Into<String>) -> Self {
        self.prompts.insert(step.into(), prompt.into());
        self
    }

    /// Built-in prompts for the three pipeline steps.
    #[must_use]
    pub fn defaults() -> Self {
        Self::new()
            .with_prompt(
                "analyze",
                "Analyze the user's request. Respond with a JSON object with fields \
                 intent (string), key_entities (list of strings), complexity \
                 (one of simple, moderate, complex) and context (object).",
            )
            .with_prompt(
                "process",
                "Work through the analyzed request. Respond with a JSON object with fields \
                 content (string), confidence (number between 0 and 1) and metadata (object).",
            )
            .with_prompt(
                "synthesize",
                "Write the final answer for the user from the processed content. \
                 Respond with the answer text only.",
            )
    }
}

impl PromptLoader for StaticPromptLoader {
    fn load(&self, step: &str) -> Result<String, PromptError> {
        let prompt = self
            .prompts
            .get(step)
            .ok_or_else(|| PromptError::NotFound(step.to_string()))?;
        if prompt.trim().is_empty() {
            return Err(PromptError::Empty(step.to_string()));
        }
        Ok(prompt.clone())
    }
}

/// Reads `<dir>/<step>.txt`.
#[derive(Debug, Clone)]
pub struct DirectoryPromptLoader {
    dir: PathBuf,
}

impl DirectoryPromptLoader {
    /// Creates a loader rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Prompt directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, step: &str) -> PathBuf {
        self.dir.join(format!("{step}.txt"))
    }
}

impl PromptLoader for DirectoryPromptLoader {
    fn load(&self, step: &str) -> Result<String, PromptError> {
        let path = self.path_for(step);
        let text = std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                PromptError::NotFound(step.to_string())
            } else {
                PromptError::Io {
                    step: step.to_string(),
                    source,
                }
            }
        })?;

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(PromptError::Empty(step.to_string()));
        }
        Ok(text)
    }
}
