//! Operator confirmation prompts.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use dialoguer::Input;

use crate::error::{LifecycleError, Result};

/// Source of typed confirmations.
#[async_trait]
pub trait ConfirmationPrompt: Send + Sync {
    /// Ask the operator; `None` when no input is available.
    async fn ask(&self, prompt: &str) -> Result<Option<String>>;
}

/// Interactive terminal prompt.
pub struct DialoguerPrompt;

#[async_trait]
impl ConfirmationPrompt for DialoguerPrompt {
    async fn ask(&self, prompt: &str) -> Result<Option<String>> {
        let prompt = prompt.to_string();
        let answer = tokio::task::spawn_blocking(move || {
            Input::<String>::new()
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()
        })
        .await
        .map_err(|e| LifecycleError::remote("confirmation prompt", e.to_string()))?;

        // No terminal attached (CI, cron): treat as no input.
        Ok(answer.ok().filter(|a| !a.trim().is_empty()))
    }
}

/// Pre-recorded answers, for automation and tests.
#[derive(Default)]
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<String>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Prompts shown so far.
    pub fn asked(&self) -> Vec<String> {
        self.asked
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ConfirmationPrompt for ScriptedPrompt {
    async fn ask(&self, prompt: &str) -> Result<Option<String>> {
        self.asked
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(prompt.to_string());
        Ok(self
            .answers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front())
    }
}
