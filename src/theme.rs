//! Centralized theme and styling for the dialogs
//!
//! Single source of truth for the colors and styles the loader's terminal
//! dialogs use.
//!
//! # Usage
//! ```rust
//! use ddloader::theme::{Colors, Severity, Styles, Theme};
//! use ratatui::style::Style;
//!
//! let style = Style::default().fg(Colors::PRIMARY);
//! let title_style = Styles::title();
//! let border = Theme::severity_color(Severity::for_title("Error"));
//! ```

use ratatui::style::{Color, Modifier, Style};

// =============================================================================
// COLOR PALETTE
// =============================================================================

/// Core color palette
pub struct Colors;

impl Colors {
    /// Dialog background
    pub const BG_PRIMARY: Color = Color::Rgb(20, 20, 30);

    /// Screen background behind dialogs
    pub const BG_SCREEN: Color = Color::Black;

    /// Default foreground text color
    pub const FG_PRIMARY: Color = Color::White;

    /// Secondary/muted text color
    pub const FG_SECONDARY: Color = Color::Gray;

    /// Primary accent color - used for borders, titles, highlights
    pub const PRIMARY: Color = Color::Cyan;

    /// Directories in the file browser
    pub const DIRECTORY: Color = Color::Blue;

    pub const WARNING: Color = Color::Yellow;

    pub const ERROR: Color = Color::Red;

    /// Selected item highlight
    pub const SELECTED_BG: Color = Color::Yellow;

    /// Selected item text (for contrast on yellow bg)
    pub const SELECTED_FG: Color = Color::Black;

    /// Navigation hint color
    pub const NAV_HINT: Color = Color::DarkGray;
}

// =============================================================================
// PRE-BUILT STYLES
// =============================================================================

/// Pre-built styles for common UI patterns
pub struct Styles;

impl Styles {
    /// Default text style
    pub fn text() -> Style {
        Style::default().fg(Colors::FG_PRIMARY)
    }

    pub fn text_secondary() -> Style {
        Style::default().fg(Colors::FG_SECONDARY)
    }

    /// Dialog title (bold, accent)
    pub fn title() -> Style {
        Style::default()
            .fg(Colors::PRIMARY)
            .add_modifier(Modifier::BOLD)
    }

    pub fn panel_bg() -> Style {
        Style::default().bg(Colors::BG_PRIMARY)
    }

    pub fn screen_bg() -> Style {
        Style::default().bg(Colors::BG_SCREEN)
    }

    /// Selected/highlighted list item
    pub fn selected() -> Style {
        Style::default()
            .fg(Colors::SELECTED_FG)
            .bg(Colors::SELECTED_BG)
            .add_modifier(Modifier::BOLD)
    }

    pub fn directory() -> Style {
        Style::default()
            .fg(Colors::DIRECTORY)
            .add_modifier(Modifier::BOLD)
    }

    /// Active/selected button
    pub fn button_active() -> Style {
        Style::default()
            .fg(Colors::SELECTED_FG)
            .bg(Colors::FG_PRIMARY)
            .add_modifier(Modifier::BOLD)
    }

    /// Inactive button
    pub fn button_inactive() -> Style {
        Style::default().fg(Colors::FG_PRIMARY)
    }

    /// Navigation hint (keybindings)
    pub fn nav_hint() -> Style {
        Style::default().fg(Colors::NAV_HINT)
    }
}

// =============================================================================
// THEME CONTEXT
// =============================================================================

/// Severity level for dialogs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Danger,
}

impl Severity {
    /// Error dialogs are titled "Error" or "... Error".
    pub fn for_title(title: &str) -> Self {
        if title.ends_with("Error") {
            Severity::Danger
        } else if title.contains("Insert") || title.contains("detected") {
            Severity::Warning
        } else {
            Severity::Info
        }
    }
}

/// Theme context providing semantic style lookups
pub struct Theme;

impl Theme {
    /// Get border color for a severity level
    pub fn severity_color(severity: Severity) -> Color {
        match severity {
            Severity::Info => Colors::PRIMARY,
            Severity::Warning => Colors::WARNING,
            Severity::Danger => Colors::ERROR,
        }
    }

    /// Border style for a dialog with the given title
    pub fn dialog_border(title: &str) -> Style {
        Style::default().fg(Self::severity_color(Severity::for_title(title)))
    }
}

// =============================================================================
// UI CONSTANTS
// =============================================================================

/// UI dimension and layout constants
pub struct UiConstants;

impl UiConstants {
    /// Default dialog max width
    pub const DIALOG_MAX_WIDTH: u16 = 72;

    /// Minimum dialog width
    pub const DIALOG_MIN_WIDTH: u16 = 40;

    /// Visible rows of menus and the file browser
    pub const LIST_ROWS: u16 = 10;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_from_title() {
        assert_eq!(Severity::for_title("Error"), Severity::Danger);
        assert_eq!(Severity::for_title("Kickstart Error"), Severity::Danger);
        assert_eq!(Severity::for_title("Insert Driver Disk"), Severity::Warning);
        assert_eq!(Severity::for_title("Driver disk"), Severity::Info);
    }

    #[test]
    fn test_dialog_border_colors() {
        assert_eq!(Theme::dialog_border("Error").fg, Some(Colors::ERROR));
        assert_eq!(
            Theme::dialog_border("Driver Disk Source").fg,
            Some(Colors::PRIMARY)
        );
    }
}
