//! Build stack selection.
//!
//! The known-stack table is loaded once at process start and handed to
//! the pipeline as an immutable value; table order encodes priority for
//! the default choice.

use crate::controller::AppConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the app-level configuration value that force-selects a stack.
pub const STACK_OVERRIDE_VAR: &str = "SLIPWAY_STACK";

/// A build strategy and the builder image that runs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub name: String,
    pub image: String,
}

/// Immutable, priority-ordered table of known stacks. Guaranteed
/// non-empty.
#[derive(Debug, Clone)]
pub struct StackTable {
    stacks: Vec<Stack>,
}

impl Default for StackTable {
    fn default() -> Self {
        Self {
            stacks: vec![
                Stack {
                    name: "container".to_string(),
                    image: "slipway/imagebuilder:latest".to_string(),
                },
                Stack {
                    name: "buildpack".to_string(),
                    image: "slipway/buildpacker:latest".to_string(),
                },
            ],
        }
    }
}

impl StackTable {
    /// Load the operator-supplied table, falling back to the built-in
    /// default when the file is absent, unreadable, malformed, or empty.
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(data) => match serde_json::from_slice::<Vec<Stack>>(&data) {
                Ok(stacks) if !stacks.is_empty() => Self { stacks },
                Ok(_) => {
                    tracing::warn!(path = %path.display(), "stack table file is empty, using defaults");
                    Self::default()
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "stack table file is malformed, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    /// Pick the stack for one push.
    ///
    /// Priority: explicit override by exact name, then a container build
    /// descriptor in the tree root, then a process definition file, then
    /// the first table entry. Unknown override names fall through.
    pub fn select(&self, dir: &Path, config: &AppConfig) -> &Stack {
        if let Some(name) = config.global(STACK_OVERRIDE_VAR)
            && let Some(stack) = self.stacks.iter().find(|s| s.name == name)
        {
            return stack;
        }

        if dir.join("Dockerfile").exists()
            && let Some(stack) = self.stacks.iter().find(|s| s.name.contains("container"))
        {
            return stack;
        }

        if dir.join("Procfile").exists()
            && let Some(stack) = self.stacks.iter().find(|s| s.name.contains("buildpack"))
        {
            return stack;
        }

        &self.stacks[0]
    }
}
