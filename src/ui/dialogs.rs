//! Dialog state, key handling and rendering
//!
//! Each dialog is a small state struct implementing [`Modal`]. Key handling
//! is pure so it can be tested without a terminal; `render` draws the dialog
//! centered on the frame.

use crate::theme::{Colors, Styles, Theme, UiConstants};
use crossterm::event::KeyCode;
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};
use std::fs;
use std::path::{Path, PathBuf};

/// A dialog shown until a key press produces an answer.
pub trait Modal {
    type Output;

    /// `Some` once the dialog is finished.
    fn handle_key(&mut self, key: KeyCode) -> Option<Self::Output>;

    fn render(&self, f: &mut Frame);
}

/// Centered dialog rectangle, clamped to the frame.
pub fn centered_rect(area: Rect, height: u16) -> Rect {
    let width = (area.width * 3 / 4)
        .clamp(UiConstants::DIALOG_MIN_WIDTH, UiConstants::DIALOG_MAX_WIDTH)
        .min(area.width);
    let height = height.min(area.height);
    let x = area.x + (area.width - width) / 2;
    let y = area.y + (area.height - height) / 2;
    Rect::new(x, y, width, height)
}

/// Lines a wrapped paragraph of `text` needs inside a dialog of `width`.
fn text_rows(text: &str, width: u16) -> u16 {
    let inner = width.saturating_sub(4).max(1) as usize;
    text.lines()
        .map(|line| line.chars().count().div_ceil(inner).max(1))
        .sum::<usize>()
        .max(1) as u16
}

fn dialog_block(title: &str) -> Block<'_> {
    Block::default()
        .borders(Borders::ALL)
        .title(Span::styled(format!(" {} ", title), Styles::title()))
        .border_style(Theme::dialog_border(title))
        .style(Styles::panel_bg())
}

fn button_line<'a>(labels: impl IntoIterator<Item = &'a str>, focused: Option<usize>) -> Line<'a> {
    let mut spans = Vec::new();
    for (i, label) in labels.into_iter().enumerate() {
        if i > 0 {
            spans.push(Span::raw("   "));
        }
        let style = if focused == Some(i) {
            Styles::button_active()
        } else {
            Styles::button_inactive()
        };
        spans.push(Span::styled(format!("[ {} ]", label), style));
    }
    Line::from(spans)
}

fn render_frame(f: &mut Frame, title: &str, rows: u16) -> Rect {
    let screen = f.area();
    f.render_widget(Block::default().style(Styles::screen_bg()), screen);
    let rect = centered_rect(screen, rows);
    f.render_widget(Clear, rect);
    f.render_widget(dialog_block(title), rect);
    Rect::new(
        rect.x + 2,
        rect.y + 1,
        rect.width.saturating_sub(4),
        rect.height.saturating_sub(2),
    )
}

fn render_hint(f: &mut Frame, area: Rect, hint: &str) {
    let line = Paragraph::new(Span::styled(hint, Styles::nav_hint())).alignment(Alignment::Center);
    f.render_widget(line, area);
}

// =============================================================================
// BUTTON DIALOG
// =============================================================================

/// Text with one or more buttons: messages, questions and three-way choices.
#[derive(Debug, Clone)]
pub struct ButtonDialog {
    pub title: String,
    pub text: String,
    pub buttons: Vec<String>,
    pub selected: usize,
    /// Button chosen by Esc, if any.
    pub escape: Option<usize>,
}

impl ButtonDialog {
    pub fn new(title: &str, text: &str, buttons: &[&str]) -> Self {
        Self {
            title: title.to_string(),
            text: text.to_string(),
            buttons: buttons.iter().map(|b| b.to_string()).collect(),
            selected: 0,
            escape: None,
        }
    }

    pub fn message(title: &str, text: &str) -> Self {
        Self::new(title, text, &["OK"]).with_escape(0)
    }

    pub fn with_escape(mut self, button: usize) -> Self {
        self.escape = Some(button);
        self
    }
}

impl Modal for ButtonDialog {
    type Output = usize;

    fn handle_key(&mut self, key: KeyCode) -> Option<usize> {
        let count = self.buttons.len().max(1);
        match key {
            KeyCode::Left | KeyCode::BackTab => {
                self.selected = (self.selected + count - 1) % count;
                None
            }
            KeyCode::Right | KeyCode::Tab => {
                self.selected = (self.selected + 1) % count;
                None
            }
            KeyCode::Enter | KeyCode::Char(' ') => Some(self.selected),
            KeyCode::Esc => self.escape,
            KeyCode::Char(c) => {
                // First letter of a button label picks it.
                let c = c.to_ascii_lowercase();
                self.buttons.iter().position(|b| {
                    b.chars().next().map(|f| f.to_ascii_lowercase()) == Some(c)
                })
            }
            _ => None,
        }
    }

    fn render(&self, f: &mut Frame) {
        let width = centered_rect(f.area(), 0).width;
        let text_height = text_rows(&self.text, width);
        let inner = render_frame(f, &self.title, text_height + 5);

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Min(1),
                Constraint::Length(1),
                Constraint::Length(1),
            ])
            .split(inner);

        let body = Paragraph::new(self.text.as_str())
            .style(Styles::text())
            .wrap(Wrap { trim: false });
        f.render_widget(body, chunks[0]);

        let buttons = Paragraph::new(button_line(
            self.buttons.iter().map(String::as_str),
            Some(self.selected),
        ))
        .alignment(Alignment::Center);
        f.render_widget(buttons, chunks[1]);
        render_hint(f, chunks[2], "←/→ move • Enter select");
    }
}

// =============================================================================
// MENU DIALOG
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuFocus {
    List,
    Ok,
    Back,
}

/// A list of choices with an OK and a back button.
#[derive(Debug, Clone)]
pub struct MenuDialog {
    pub title: String,
    pub text: String,
    pub items: Vec<String>,
    pub back_label: String,
    pub selected: usize,
    pub focus: MenuFocus,
}

impl MenuDialog {
    pub fn new(title: &str, text: &str, items: &[String], back_label: &str) -> Self {
        Self {
            title: title.to_string(),
            text: text.to_string(),
            items: items.to_vec(),
            back_label: back_label.to_string(),
            selected: 0,
            focus: MenuFocus::List,
        }
    }

    fn chosen(&self) -> Option<usize> {
        (!self.items.is_empty()).then_some(self.selected)
    }
}

impl Modal for MenuDialog {
    type Output = Option<usize>;

    fn handle_key(&mut self, key: KeyCode) -> Option<Option<usize>> {
        match key {
            KeyCode::Up | KeyCode::Char('k') => {
                self.selected = self.selected.saturating_sub(1);
                self.focus = MenuFocus::List;
                None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.selected + 1 < self.items.len() {
                    self.selected += 1;
                }
                self.focus = MenuFocus::List;
                None
            }
            KeyCode::Tab => {
                self.focus = match self.focus {
                    MenuFocus::List => MenuFocus::Ok,
                    MenuFocus::Ok => MenuFocus::Back,
                    MenuFocus::Back => MenuFocus::List,
                };
                None
            }
            KeyCode::Enter => match self.focus {
                MenuFocus::Back => Some(None),
                MenuFocus::List | MenuFocus::Ok => self.chosen().map(Some),
            },
            KeyCode::Esc => Some(None),
            _ => None,
        }
    }

    fn render(&self, f: &mut Frame) {
        let width = centered_rect(f.area(), 0).width;
        let text_height = text_rows(&self.text, width);
        let list_height = (self.items.len() as u16).clamp(1, UiConstants::LIST_ROWS);
        let inner = render_frame(f, &self.title, text_height + list_height + 7);

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(text_height),
                Constraint::Length(1),
                Constraint::Min(list_height),
                Constraint::Length(1),
                Constraint::Length(1),
            ])
            .split(inner);

        f.render_widget(
            Paragraph::new(self.text.as_str())
                .style(Styles::text())
                .wrap(Wrap { trim: false }),
            chunks[0],
        );

        let items: Vec<ListItem> = self
            .items
            .iter()
            .map(|item| ListItem::new(item.as_str()).style(Styles::text()))
            .collect();
        let highlight = if self.focus == MenuFocus::List {
            Styles::selected()
        } else {
            Styles::text_secondary()
        };
        let list = List::new(items).highlight_style(highlight);
        let mut state = ListState::default().with_selected(self.chosen());
        f.render_stateful_widget(list, chunks[2], &mut state);

        let focused = match self.focus {
            MenuFocus::List => None,
            MenuFocus::Ok => Some(0),
            MenuFocus::Back => Some(1),
        };
        let buttons = Paragraph::new(button_line(["OK", self.back_label.as_str()], focused))
            .alignment(Alignment::Center);
        f.render_widget(buttons, chunks[3]);
        render_hint(f, chunks[4], "↑/↓ move • Tab buttons • Enter select • Esc back");
    }
}

// =============================================================================
// FILE BROWSER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Browse the tree below `root` and pick a regular file.
///
/// The browser never leaves `root`; ".." is only offered below it.
#[derive(Debug, Clone)]
pub struct FileBrowser {
    pub title: String,
    pub text: String,
    root: PathBuf,
    cwd: PathBuf,
    pub entries: Vec<BrowserEntry>,
    pub selected: usize,
}

impl FileBrowser {
    pub fn new(title: &str, text: &str, root: &Path) -> Self {
        let mut browser = Self {
            title: title.to_string(),
            text: text.to_string(),
            root: root.to_path_buf(),
            cwd: root.to_path_buf(),
            entries: Vec::new(),
            selected: 0,
        };
        browser.reload();
        browser
    }

    pub fn current_dir(&self) -> &Path {
        &self.cwd
    }

    /// Re-read the current directory: ".." first, then directories, then
    /// files, each group sorted by name. Unreadable directories list empty.
    fn reload(&mut self) {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        if let Ok(read_dir) = fs::read_dir(&self.cwd) {
            for entry in read_dir.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                // Follows symlinks so linked directories can be entered.
                if entry.path().is_dir() {
                    dirs.push(name);
                } else {
                    files.push(name);
                }
            }
        }
        dirs.sort();
        files.sort();

        self.entries.clear();
        if self.cwd != self.root {
            self.entries.push(BrowserEntry {
                name: "..".to_string(),
                is_dir: true,
            });
        }
        self.entries
            .extend(dirs.into_iter().map(|name| BrowserEntry { name, is_dir: true }));
        self.entries
            .extend(files.into_iter().map(|name| BrowserEntry { name, is_dir: false }));
        self.selected = 0;
    }

    fn go_up(&mut self) {
        if self.cwd != self.root {
            if let Some(parent) = self.cwd.parent() {
                self.cwd = parent.to_path_buf();
                self.reload();
            }
        }
    }

    fn activate(&mut self) -> Option<Option<PathBuf>> {
        let entry = self.entries.get(self.selected)?.clone();
        if entry.name == ".." {
            self.go_up();
            None
        } else if entry.is_dir {
            self.cwd = self.cwd.join(&entry.name);
            self.reload();
            None
        } else {
            Some(Some(self.cwd.join(&entry.name)))
        }
    }
}

impl Modal for FileBrowser {
    type Output = Option<PathBuf>;

    fn handle_key(&mut self, key: KeyCode) -> Option<Option<PathBuf>> {
        match key {
            KeyCode::Up | KeyCode::Char('k') => {
                self.selected = self.selected.saturating_sub(1);
                None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.selected + 1 < self.entries.len() {
                    self.selected += 1;
                }
                None
            }
            KeyCode::Enter => self.activate(),
            KeyCode::Backspace | KeyCode::Left => {
                self.go_up();
                None
            }
            KeyCode::Esc => Some(None),
            _ => None,
        }
    }

    fn render(&self, f: &mut Frame) {
        let width = centered_rect(f.area(), 0).width;
        let text_height = text_rows(&self.text, width);
        let inner = render_frame(f, &self.title, text_height + UiConstants::LIST_ROWS + 5);

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(text_height),
                Constraint::Length(1),
                Constraint::Min(1),
                Constraint::Length(1),
            ])
            .split(inner);

        f.render_widget(
            Paragraph::new(self.text.as_str())
                .style(Styles::text())
                .wrap(Wrap { trim: false }),
            chunks[0],
        );
        f.render_widget(
            Paragraph::new(Span::styled(
                self.cwd.display().to_string(),
                Style::default().fg(Colors::FG_SECONDARY),
            )),
            chunks[1],
        );

        let items: Vec<ListItem> = self
            .entries
            .iter()
            .map(|entry| {
                if entry.is_dir {
                    ListItem::new(format!("{}/", entry.name)).style(Styles::directory())
                } else {
                    ListItem::new(entry.name.as_str()).style(Styles::text())
                }
            })
            .collect();
        let list = List::new(items).highlight_style(Styles::selected());
        let selected = (!self.entries.is_empty()).then_some(self.selected);
        let mut state = ListState::default().with_selected(selected);
        f.render_stateful_widget(list, chunks[2], &mut state);

        render_hint(f, chunks[3], "↑/↓ move • Enter open • Backspace up • Esc cancel");
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// Non-blocking status box.
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub title: String,
    pub text: String,
}

impl StatusLine {
    pub fn new(title: &str, text: &str) -> Self {
        Self {
            title: title.to_string(),
            text: text.to_string(),
        }
    }

    pub fn render(&self, f: &mut Frame) {
        let inner = render_frame(f, &self.title, 3);
        f.render_widget(
            Paragraph::new(self.text.as_str())
                .style(Styles::text())
                .alignment(Alignment::Center),
            inner,
        );
    }
}
