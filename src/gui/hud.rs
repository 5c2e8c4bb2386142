use crate::feed::{Command, SelectedSignal, SignalEntry, SignalUpdate};
use crate::gui::HudError;
use crate::observation::ReferencePoint;
use crate::Point;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    symbols,
    text::Span,
    widgets::{
        Axis, Block, Borders, Cell, Chart, Dataset, GraphType, Paragraph, Row, Table, TableState,
    },
    Frame, Terminal,
};
use std::{
    io,
    time::{Duration, Instant},
};

/// Asked every tick for a newer update. `Ok(None)` when nothing changed.
pub type UpdateSource = Box<dyn FnMut() -> Result<Option<SignalUpdate>, HudError>>;

/// Carries out a command the operator gave with a key.
pub type CommandHandler = Box<dyn FnMut(Command) -> Result<(), HudError>>;

/// What the HUD shows.
#[derive(Debug, Clone, Default)]
pub struct HudState {
    references: Vec<(String, (f64, f64))>,
    update: SignalUpdate,
    status: String,
    cursor: usize,
}

impl HudState {
    /// An empty HUD that will plot `references`.
    pub fn new(references: &[ReferencePoint]) -> Self {
        Self {
            references: references
                .iter()
                .map(|r| (r.id.to_string(), (r.position.x, r.position.y)))
                .collect(),
            update: SignalUpdate::default(),
            status: "waiting for signals".to_owned(),
            cursor: 0,
        }
    }

    /// Show `update` from now on.
    pub fn apply(&mut self, update: SignalUpdate) {
        self.status = format!(
            "{} signals, position {}",
            update.signals.len(),
            update
                .position
                .map_or_else(|| "unknown".to_owned(), |p| p.to_string())
        );
        self.cursor = self.cursor.min(update.signals.len().saturating_sub(1));
        self.update = update;
    }

    /// Move the row cursor one step, staying inside the table.
    pub fn move_cursor(&mut self, down: bool) {
        self.cursor = if down {
            (self.cursor + 1).min(self.update.signals.len().saturating_sub(1))
        } else {
            self.cursor.saturating_sub(1)
        };
    }

    /// The row under the cursor.
    pub fn cursor_entry(&self) -> Option<&SignalEntry> {
        self.rows().get(self.cursor).copied()
    }

    /// Follow the row under the cursor.
    pub fn track_command(&self) -> Option<Command> {
        self.cursor_entry().map(|e| Command::Track {
            kind: e.kind,
            id: e.id.as_str().into(),
        })
    }

    /// The followed device, if any.
    pub fn selected(&self) -> Option<&SelectedSignal> {
        self.update.selected.as_ref()
    }

    fn is_selected(&self, entry: &SignalEntry) -> bool {
        self.selected().is_some_and(|s| s.kind == entry.kind && s.id == entry.id)
    }

    /// Rows of the signal table, strongest first.
    pub fn rows(&self) -> Vec<&SignalEntry> {
        let mut rows: Vec<&SignalEntry> = self.update.signals.iter().collect();
        rows.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.id.cmp(&b.id)));
        rows
    }

    fn reference_points(&self) -> Vec<(f64, f64)> {
        self.references.iter().map(|(_, p)| *p).collect()
    }

    fn position_points(&self) -> Vec<(f64, f64)> {
        self.update
            .position
            .iter()
            .map(|&Point { x, y }| (x, y))
            .collect()
    }
}

struct App {
    state: HudState,
    source: UpdateSource,
    on_command: CommandHandler,
}

impl App {
    fn on_tick(&mut self) -> Result<(), HudError> {
        if let Some(update) = (self.source)()? {
            self.state.apply(update);
        }
        Ok(())
    }

    fn send(&mut self, command: Command, status: String) -> Result<(), HudError> {
        (self.on_command)(command)?;
        self.state.status = status;
        Ok(())
    }
}

/// Take over the terminal and draw the HUD until `q` is pressed.
pub fn engage_hud(
    state: HudState,
    source: UpdateSource,
    on_command: CommandHandler,
    tick_rate: Duration,
) -> Result<(), HudError> {
    // setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let app = App {
        state,
        source,
        on_command,
    };
    let res = run_app(&mut terminal, app, tick_rate);

    // restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    res
}

fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    mut app: App,
    tick_rate: Duration,
) -> Result<(), HudError> {
    let mut last_tick = Instant::now();
    app.on_tick()?;
    loop {
        terminal.draw(|f| ui(f, &app.state))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                        KeyCode::Char('c') => app.send(Command::Clear, "cleared".to_owned())?,
                        KeyCode::Up | KeyCode::Char('k') => app.state.move_cursor(false),
                        KeyCode::Down | KeyCode::Char('j') => app.state.move_cursor(true),
                        KeyCode::Char('t') => {
                            if let Some(command) = app.state.track_command() {
                                app.send(command, "tracking".to_owned())?;
                            }
                        }
                        KeyCode::Char('u') => {
                            app.send(Command::Untrack, "tracking stopped".to_owned())?
                        }
                        _ => {}
                    }
                }
            }
        }
        if last_tick.elapsed() >= tick_rate {
            app.on_tick()?;
            last_tick = Instant::now();
        }
    }
}

/// Axis bounds covering every point with a metre of margin, never smaller
/// than 2 m across.
pub fn chart_bounds(points: &[(f64, f64)]) -> ([f64; 2], [f64; 2]) {
    let span = |pick: fn(&(f64, f64)) -> f64| {
        let lo = points.iter().map(pick).fold(f64::INFINITY, f64::min);
        let hi = points.iter().map(pick).fold(f64::NEG_INFINITY, f64::max);
        if lo > hi {
            return [-1.0, 1.0];
        }
        let mid = (lo + hi) / 2.0;
        let half = ((hi - lo) / 2.0 + 1.0).max(1.0);
        [mid - half, mid + half]
    };
    (span(|p| p.0), span(|p| p.1))
}

fn axis_labels(bounds: [f64; 2]) -> Vec<Span<'static>> {
    let mid = (bounds[0] + bounds[1]) / 2.0;
    [bounds[0], mid, bounds[1]]
        .iter()
        .map(|v| Span::from(format!("{v:.1}")))
        .collect()
}

fn ui(f: &mut Frame, state: &HudState) {
    let outer = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(5), Constraint::Length(3)])
        .split(f.size());
    let panes = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(outer[0]);

    let header = Row::new(vec!["Name", "ID", "RSSI", "Type"])
        .style(Style::default().add_modifier(Modifier::BOLD));
    let rows = state.rows().into_iter().map(|s| {
        let row = Row::new(vec![
            Cell::from(s.name.clone()),
            Cell::from(s.id.clone()),
            Cell::from(format!("{} dBm", s.rssi)),
            Cell::from(s.kind.to_string()),
        ]);
        if state.is_selected(s) {
            row.style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
        } else {
            row
        }
    });
    let table = Table::new(
        rows,
        [
            Constraint::Percentage(35),
            Constraint::Percentage(35),
            Constraint::Length(9),
            Constraint::Length(9),
        ],
    )
    .header(header)
    .highlight_symbol("> ")
    .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
    .block(Block::default().title(" Signals ").borders(Borders::ALL));
    let mut table_state = TableState::default()
        .with_selected((!state.update.signals.is_empty()).then_some(state.cursor));
    f.render_stateful_widget(table, panes[0], &mut table_state);

    let references = state.reference_points();
    let position = state.position_points();
    let mut everything = references.clone();
    everything.extend(position.iter().copied());
    let (x_bounds, y_bounds) = chart_bounds(&everything);

    let chart = Chart::new(vec![
        Dataset::default()
            .name("References")
            .marker(symbols::Marker::Dot)
            .graph_type(GraphType::Scatter)
            .style(Style::default().fg(Color::Cyan))
            .data(&references),
        Dataset::default()
            .name("Position")
            .marker(symbols::Marker::Block)
            .graph_type(GraphType::Scatter)
            .style(Style::default().fg(Color::Red))
            .data(&position),
    ])
    .block(Block::default().title(" Map ").borders(Borders::ALL))
    .x_axis(
        Axis::default()
            .title(Span::styled("x (m)", Style::default().fg(Color::Red)))
            .style(Style::default().fg(Color::White))
            .bounds(x_bounds)
            .labels(axis_labels(x_bounds)),
    )
    .y_axis(
        Axis::default()
            .title(Span::styled("y (m)", Style::default().fg(Color::Red)))
            .style(Style::default().fg(Color::White))
            .bounds(y_bounds)
            .labels(axis_labels(y_bounds)),
    );
    f.render_widget(chart, panes[1]);

    let mut status = state.status.clone();
    if !state.update.objects.is_empty() {
        status.push_str(&format!(", {} objects in view", state.update.objects.len()));
    }
    if let Some(selected) = state.selected() {
        match (selected.rssi, selected.distance) {
            (Some(rssi), Some(distance)) => status.push_str(&format!(
                ", tracking {} at {rssi} dBm, ~{distance:.1} m",
                selected.name
            )),
            _ => status.push_str(&format!(", tracking {} (not heard)", selected.name)),
        }
    }
    let footer = Paragraph::new(format!(" {status}   [t] track  [u] untrack  [c] clear  [q] quit"))
        .block(Block::default().borders(Borders::ALL));
    f.render_widget(footer, outer[1]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{DeviceId, SignalKind};
    use ratatui::backend::TestBackend;

    fn entry(id: &str, rssi: i32) -> SignalEntry {
        SignalEntry {
            id: id.to_owned(),
            name: format!("dev-{id}"),
            rssi,
            kind: SignalKind::Bluetooth,
        }
    }

    #[test]
    fn rows_are_strongest_first() {
        let mut state = HudState::default();
        state.apply(SignalUpdate {
            signals: vec![entry("B", -80), entry("A", -40), entry("C", -60)],
            ..SignalUpdate::default()
        });
        let ids: Vec<&str> = state.rows().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["A", "C", "B"]);
    }

    #[test]
    fn cursor_picks_the_row_to_track() {
        let mut state = HudState::default();
        assert_eq!(state.track_command(), None);
        state.apply(SignalUpdate {
            signals: vec![entry("B", -80), entry("A", -40)],
            ..SignalUpdate::default()
        });
        assert_eq!(
            state.track_command(),
            Some(Command::Track {
                kind: SignalKind::Bluetooth,
                id: DeviceId::new("A"),
            })
        );

        state.move_cursor(true);
        state.move_cursor(true);
        assert_eq!(state.cursor_entry().unwrap().id, "B");
        state.move_cursor(false);
        assert_eq!(state.cursor_entry().unwrap().id, "A");

        // A shorter table pulls the cursor back in.
        state.move_cursor(true);
        state.apply(SignalUpdate {
            signals: vec![entry("C", -50)],
            ..SignalUpdate::default()
        });
        assert_eq!(state.cursor_entry().unwrap().id, "C");
    }

    #[test]
    fn bounds_cover_points() {
        assert_eq!(chart_bounds(&[]), ([-1.0, 1.0], [-1.0, 1.0]));
        let (x, y) = chart_bounds(&[(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)]);
        assert_eq!(x, [-1.0, 11.0]);
        assert_eq!(y, [-1.0, 11.0]);
    }

    #[test]
    fn draws_table_and_status() {
        let references = vec![ReferencePoint {
            id: DeviceId::new("anchor"),
            kind: None,
            position: Point { x: 2.0, y: 3.0 },
        }];
        let mut state = HudState::new(&references);
        state.apply(SignalUpdate {
            signals: vec![entry("AA", -55)],
            position: Some(Point { x: 1.0, y: 1.0 }),
            ..SignalUpdate::default()
        });

        let mut terminal = Terminal::new(TestBackend::new(100, 20)).unwrap();
        terminal.draw(|f| ui(f, &state)).unwrap();
        let screen: String = terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|c| c.symbol())
            .collect();
        assert!(screen.contains("dev-AA"));
        assert!(screen.contains("-55 dBm"));
        assert!(screen.contains("1 signals, position (1.000, 1.000)"));
    }

    #[test]
    fn draws_tracked_signal() {
        let mut state = HudState::default();
        state.apply(SignalUpdate {
            signals: vec![entry("AA", -60), entry("BB", -70)],
            selected: Some(SelectedSignal {
                id: "AA".to_owned(),
                kind: SignalKind::Bluetooth,
                name: "dev-AA".to_owned(),
                rssi: Some(-60),
                distance: Some(10.0),
            }),
            ..SignalUpdate::default()
        });
        assert!(state.is_selected(&entry("AA", -60)));
        assert!(!state.is_selected(&entry("BB", -70)));

        let mut terminal = Terminal::new(TestBackend::new(160, 20)).unwrap();
        terminal.draw(|f| ui(f, &state)).unwrap();
        let screen: String = terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|c| c.symbol())
            .collect();
        assert!(screen.contains("tracking dev-AA at -60 dBm, ~10.0 m"));
    }
}
