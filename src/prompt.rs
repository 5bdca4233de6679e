//! Interactive prompt primitives with an explicit cancellation sentinel.

use anyhow::{Context, Result};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Select};
use std::io;

/// Text, select and confirm prompts. `Ok(None)` means the operator cancelled.
pub trait Prompter {
    fn text(&mut self, prompt: &str, initial: &str) -> Result<Option<String>>;

    /// Returns the index of the chosen item.
    fn select(&mut self, prompt: &str, items: &[&str], default: usize) -> Result<Option<usize>>;

    fn confirm(&mut self, prompt: &str, default: bool) -> Result<Option<bool>>;
}

/// Terminal prompts. Esc or Ctrl-C cancels.
pub struct TerminalPrompter {
    theme: ColorfulTheme,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }
}

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self::new()
    }
}

/// Map an interrupted read to cancellation; other terminal errors are real failures.
fn cancel_on_interrupt<T>(result: dialoguer::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(dialoguer::Error::IO(e)) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
        Err(e) => Err(e).context("Prompt failed"),
    }
}

fn flatten_cancel<T>(result: dialoguer::Result<Option<T>>) -> Result<Option<T>> {
    cancel_on_interrupt(result).map(Option::flatten)
}

impl Prompter for TerminalPrompter {
    fn text(&mut self, prompt: &str, initial: &str) -> Result<Option<String>> {
        cancel_on_interrupt(
            Input::<String>::with_theme(&self.theme)
                .with_prompt(prompt)
                .with_initial_text(initial)
                .allow_empty(true)
                .interact_text(),
        )
    }

    fn select(&mut self, prompt: &str, items: &[&str], default: usize) -> Result<Option<usize>> {
        flatten_cancel(
            Select::with_theme(&self.theme)
                .with_prompt(prompt)
                .items(items)
                .default(default)
                .interact_opt(),
        )
    }

    fn confirm(&mut self, prompt: &str, default: bool) -> Result<Option<bool>> {
        flatten_cancel(
            Confirm::with_theme(&self.theme)
                .with_prompt(prompt)
                .default(default)
                .interact_opt(),
        )
    }
}
