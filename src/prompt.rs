//! User interaction seam
//!
//! The acquisition flow only talks to the user through [`Prompter`]. The
//! terminal implementation lives in [`crate::ui`]; [`HeadlessPrompter`] is
//! used for command-line mode where nobody is watching.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Modal prompts used by the loader.
pub trait Prompter {
    /// Show a message and wait for acknowledgement.
    fn message(&mut self, title: &str, text: &str) -> Result<()>;

    /// Two-button question; true when `accept` was chosen.
    fn confirm(&mut self, title: &str, text: &str, accept: &str, decline: &str) -> Result<bool>;

    /// Pick one of `items`; `None` when the `back_label` button was used.
    fn menu(
        &mut self,
        title: &str,
        text: &str,
        items: &[String],
        back_label: &str,
    ) -> Result<Option<usize>>;

    /// Three-button question; returns the index of the chosen button.
    fn ternary(&mut self, title: &str, text: &str, buttons: [&str; 3]) -> Result<usize>;

    /// Browse below `root` and pick a file; `None` when cancelled.
    fn select_file(&mut self, title: &str, text: &str, root: &Path) -> Result<Option<PathBuf>>;

    /// Non-blocking status line shown during long operations.
    fn status(&mut self, _title: &str, _text: &str) -> Result<()> {
        Ok(())
    }
}

/// Prompter for unattended runs: logs messages and declines everything.
///
/// Three-button questions take the middle button, which the loader always
/// uses for "continue without doing anything more".
#[derive(Debug, Default, Clone)]
pub struct HeadlessPrompter;

impl Prompter for HeadlessPrompter {
    fn message(&mut self, title: &str, text: &str) -> Result<()> {
        warn!("{}: {}", title, text);
        Ok(())
    }

    fn confirm(&mut self, title: &str, text: &str, _accept: &str, decline: &str) -> Result<bool> {
        info!("{}: {} -> {}", title, text, decline);
        Ok(false)
    }

    fn menu(
        &mut self,
        title: &str,
        _text: &str,
        items: &[String],
        back_label: &str,
    ) -> Result<Option<usize>> {
        info!("{}: {} choice(s) -> {}", title, items.len(), back_label);
        Ok(None)
    }

    fn ternary(&mut self, title: &str, text: &str, buttons: [&str; 3]) -> Result<usize> {
        info!("{}: {} -> {}", title, text, buttons[1]);
        Ok(1)
    }

    fn select_file(&mut self, title: &str, _text: &str, root: &Path) -> Result<Option<PathBuf>> {
        info!("{}: no file chosen below {}", title, root.display());
        Ok(None)
    }

    fn status(&mut self, title: &str, text: &str) -> Result<()> {
        info!("{}: {}", title, text);
        Ok(())
    }
}
