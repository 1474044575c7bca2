use crate::controls::{Control, ControlPanel, InputView, PanelInput};
use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use ratatui::DefaultTerminal;
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Style, Stylize};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, List, ListItem, Paragraph};
use std::time::Duration;

/// Terminal rendering of the [`ControlPanel`]. Restores the terminal on drop.
pub struct PanelView {
    terminal: DefaultTerminal,
}

impl PanelView {
    pub fn new() -> Result<Self> {
        let terminal = ratatui::try_init()?;
        Ok(Self { terminal })
    }

    /// Drains pending key presses without blocking.
    pub fn poll_input(&self) -> Result<Vec<PanelInput>> {
        let mut inputs = Vec::new();
        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                if let Some(input) = map_key(key) {
                    inputs.push(input);
                }
            }
        }
        Ok(inputs)
    }

    pub fn draw(&mut self, panel: &ControlPanel, fps: f32, view: &InputView) -> Result<()> {
        self.terminal.draw(|frame| {
            let [list_area, help_area] =
                Layout::vertical([Constraint::Min(0), Constraint::Length(1)]).areas(frame.area());

            let items = panel
                .controls()
                .iter()
                .enumerate()
                .map(|(idx, control)| {
                    let mut value = panel.value(idx, fps);
                    if matches!(control, Control::Source) && view.mirrored {
                        value.push_str(" (mirrored)");
                    }
                    let line = match control {
                        Control::StaticText(text) => Line::from(Span::raw(*text).bold()),
                        Control::Slider { range, .. } => Line::from(vec![
                            Span::raw(format!("{:<26}", control.title())),
                            Span::raw(value).cyan(),
                            Span::raw(format!("  [{}, {}]", range.0, range.1)).dim(),
                        ]),
                        _ => Line::from(vec![
                            Span::raw(format!("{:<26}", control.title())),
                            Span::raw(value).cyan(),
                        ]),
                    };
                    let style = if idx == panel.selected() {
                        Style::new().reversed()
                    } else {
                        Style::new()
                    };
                    ListItem::new(line).style(style)
                })
                .collect::<Vec<_>>();

            frame.render_widget(
                List::new(items).block(Block::bordered().title(" facemask ")),
                list_area,
            );
            frame.render_widget(
                Paragraph::new("up/down select · left/right/space adjust · q quit").dim(),
                help_area,
            );
        })?;
        Ok(())
    }
}

impl Drop for PanelView {
    fn drop(&mut self) {
        ratatui::restore();
    }
}

fn map_key(key: KeyEvent) -> Option<PanelInput> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Up | KeyCode::Char('k') => Some(PanelInput::Up),
        KeyCode::Down | KeyCode::Char('j') => Some(PanelInput::Down),
        KeyCode::Left | KeyCode::Char('h') => Some(PanelInput::Decrease),
        KeyCode::Right | KeyCode::Char('l') => Some(PanelInput::Increase),
        KeyCode::Char(' ') | KeyCode::Enter => Some(PanelInput::Toggle),
        KeyCode::Char('q') | KeyCode::Esc => Some(PanelInput::Quit),
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(PanelInput::Quit)
        }
        _ => None,
    }
}
