//! Terminal dialogs
//!
//! [`TuiPrompter`] implements [`Prompter`] with ratatui on a crossterm
//! backend. Every prompt runs its own small event loop: draw, read a key,
//! feed it to the dialog until the dialog has an answer.

pub mod dialogs;

use crate::error::{DriverDiskError, Result};
use crate::prompt::Prompter;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use dialogs::{ButtonDialog, FileBrowser, MenuDialog, Modal, StatusLine};
use ratatui::{Terminal, backend::CrosstermBackend};
use std::io::{self, Stdout};
use std::path::{Path, PathBuf};
use tracing::debug;

fn terminal_error(e: io::Error) -> DriverDiskError {
    DriverDiskError::terminal(e.to_string())
}

/// Prompter drawing full-screen dialogs on the controlling terminal.
///
/// The terminal is restored when the prompter is dropped.
pub struct TuiPrompter {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TuiPrompter {
    /// Enter raw mode and the alternate screen.
    pub fn new() -> Result<Self> {
        enable_raw_mode().map_err(terminal_error)?;
        let mut stdout = io::stdout();
        if let Err(e) = execute!(stdout, EnterAlternateScreen) {
            let _ = disable_raw_mode();
            return Err(terminal_error(e));
        }
        let terminal = Terminal::new(CrosstermBackend::new(stdout)).map_err(terminal_error)?;
        Ok(Self { terminal })
    }

    fn run<M: Modal>(&mut self, mut modal: M) -> Result<M::Output> {
        self.terminal.clear().map_err(terminal_error)?;
        loop {
            self.terminal
                .draw(|f| modal.render(f))
                .map_err(terminal_error)?;

            let Event::Key(key) = event::read().map_err(terminal_error)? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            // Raw mode swallows SIGINT.
            if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
                return Err(DriverDiskError::terminal("interrupted by user"));
            }
            if let Some(answer) = modal.handle_key(key.code) {
                return Ok(answer);
            }
        }
    }
}

impl Drop for TuiPrompter {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

impl Prompter for TuiPrompter {
    fn message(&mut self, title: &str, text: &str) -> Result<()> {
        debug!("message: {}: {}", title, text);
        self.run(ButtonDialog::message(title, text))?;
        Ok(())
    }

    fn confirm(&mut self, title: &str, text: &str, accept: &str, decline: &str) -> Result<bool> {
        let choice = self.run(ButtonDialog::new(title, text, &[accept, decline]).with_escape(1))?;
        debug!("confirm: {} -> {}", title, choice == 0);
        Ok(choice == 0)
    }

    fn menu(
        &mut self,
        title: &str,
        text: &str,
        items: &[String],
        back_label: &str,
    ) -> Result<Option<usize>> {
        let choice = self.run(MenuDialog::new(title, text, items, back_label))?;
        debug!("menu: {} -> {:?}", title, choice);
        Ok(choice)
    }

    fn ternary(&mut self, title: &str, text: &str, buttons: [&str; 3]) -> Result<usize> {
        self.run(ButtonDialog::new(title, text, &buttons))
    }

    fn select_file(&mut self, title: &str, text: &str, root: &Path) -> Result<Option<PathBuf>> {
        let choice = self.run(FileBrowser::new(title, text, root))?;
        debug!("select_file: {:?}", choice);
        Ok(choice)
    }

    fn status(&mut self, title: &str, text: &str) -> Result<()> {
        let status = StatusLine::new(title, text);
        self.terminal
            .draw(|f| status.render(f))
            .map_err(terminal_error)?;
        Ok(())
    }
}
