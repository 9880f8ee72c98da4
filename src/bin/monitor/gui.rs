use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use std::{
    error::Error,
    io,
    time::{Duration, Instant},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame, Terminal,
};

use headscan::{
    mesh_export::MeshExportOptions,
    session::{DepthPreview, ScanSession, SessionSnapshot},
    simulated_sensor::SimulatedSensor,
    volume::ColorFrame,
};

/// Characters from empty to full, used to draw images as text.
const RAMP: &[u8] = b" .:-=+*#%@";

/// Quality samples kept for the chart.
const HISTORY: usize = 300;

const EXPORT_PATH: &str = "headscan.ply";

struct App {
    session: ScanSession,
    sensor: SimulatedSensor,
    preview: Option<DepthPreview>,
    snapshot: Option<SessionSnapshot>,
    rendered: Option<ColorFrame>,
    quality: Vec<(f64, f64)>,
    paused: bool,
    message: String,
}

impl App {
    fn new(session: ScanSession, sensor: SimulatedSensor) -> App {
        App {
            session,
            sensor,
            preview: None,
            snapshot: None,
            rendered: None,
            quality: vec![],
            paused: false,
            message: "q quit, p pause, r reset, e export".to_string(),
        }
    }

    fn on_tick(&mut self) {
        match self.sensor.next() {
            Some(frame) => {
                if let Err(e) = self.session.on_frame(&frame) {
                    self.message = format!("frame {}: {}", frame.frame_number, e);
                }
            }
            None => self.message = "sensor finished".to_string(),
        }

        for snapshot in self.session.poll_snapshots() {
            self.quality
                .push((snapshot.frame_number as f64, snapshot.alignment_quality as f64));
            if let Some(rendered) = &snapshot.rendered {
                self.rendered = Some(rendered.clone());
            }
            self.snapshot = Some(snapshot);
        }
        if self.quality.len() > HISTORY {
            self.quality.drain(..self.quality.len() - HISTORY);
        }
        if let Some(preview) = self.session.poll_previews().pop() {
            self.preview = Some(preview);
        }
    }

    fn on_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char('p') => {
                self.paused = !self.paused;
                self.message = match self.session.set_paused(self.paused) {
                    Ok(()) if self.paused => "paused".to_string(),
                    Ok(()) => "resumed".to_string(),
                    Err(e) => e.to_string(),
                };
            }
            KeyCode::Char('r') => {
                self.session.request_reset();
                self.message = "reset requested".to_string();
            }
            KeyCode::Char('e') => {
                self.message = match self
                    .session
                    .export_mesh(EXPORT_PATH, &MeshExportOptions::default())
                {
                    Ok(mesh) => format!("wrote {} triangles to {}", mesh.triangles, EXPORT_PATH),
                    Err(e) => format!("export failed: {}", e),
                };
            }
            _ => {}
        }
    }
}

pub fn engage_gui(
    session: ScanSession,
    sensor: SimulatedSensor,
) -> Result<ScanSession, Box<dyn Error>> {
    // setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // create app and run it
    let tick_rate = Duration::from_millis(33);
    let mut app = App::new(session, sensor);
    let res = run_app(&mut terminal, &mut app, tick_rate);

    // restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("{:?}", err)
    }

    Ok(app.session)
}

fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    tick_rate: Duration,
) -> io::Result<()> {
    let mut last_tick = Instant::now();
    loop {
        terminal.draw(|f| ui(f, app))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));
        if crossterm::event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if let KeyCode::Char('q') = key.code {
                    return Ok(());
                }
                app.on_key(key.code);
            }
        }
        if last_tick.elapsed() >= tick_rate {
            app.on_tick();
            last_tick = Instant::now();
        }
    }
}

/// Draw an image as text, sampling it down to `area`.
fn image_lines(
    width: usize,
    height: usize,
    area: Rect,
    level: impl Fn(usize) -> u8,
) -> Vec<Line<'static>> {
    let (cols, rows) = (area.width.max(1) as usize, area.height.max(1) as usize);
    if width == 0 || height == 0 {
        return vec![];
    }

    (0..rows)
        .map(|row| {
            let v = row * height / rows;
            let text: String = (0..cols)
                .map(|col| {
                    let u = col * width / cols;
                    let level = level(v * width + u) as usize;
                    RAMP[level * (RAMP.len() - 1) / 255] as char
                })
                .collect();
            Line::from(text)
        })
        .collect()
}

fn ui(f: &mut Frame, app: &mut App) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(55),
            Constraint::Min(6),
            Constraint::Length(3),
        ])
        .split(f.size());
    let images = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(rows[0]);

    let depth_block = Block::default().title("Depth").borders(Borders::ALL);
    let inner = depth_block.inner(images[0]);
    let depth = match &app.preview {
        Some(p) => image_lines(p.resolution.width, p.resolution.height, inner, |i| {
            p.intensity[i]
        }),
        None => vec![],
    };
    f.render_widget(Paragraph::new(depth).block(depth_block), images[0]);

    let volume_block = Block::default().title("Volume").borders(Borders::ALL);
    let inner = volume_block.inner(images[1]);
    let volume = match &app.rendered {
        Some(image) => image_lines(image.resolution.width, image.resolution.height, inner, |i| {
            let [b, g, r, _] = image.pixel(i);
            ((b as u16 + g as u16 + r as u16) / 3) as u8
        }),
        None => vec![],
    };
    f.render_widget(Paragraph::new(volume).block(volume_block), images[1]);

    let (x_min, x_max) = match (app.quality.first(), app.quality.last()) {
        (Some(first), Some(last)) => (first.0, last.0.max(first.0 + 1.0)),
        _ => (0.0, 1.0),
    };
    let y_max = app
        .quality
        .iter()
        .map(|(_, q)| *q)
        .fold(0.2, f64::max);
    let chart = Chart::new(vec![Dataset::default()
        .name("Alignment quality")
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(Color::Cyan))
        .data(&app.quality)])
    .block(Block::default().title("Tracking").borders(Borders::ALL))
    .x_axis(
        Axis::default()
            .title(Span::styled("Frame", Style::default().fg(Color::Red)))
            .style(Style::default().fg(Color::White))
            .bounds([x_min, x_max])
            .labels(vec![
                Span::from(format!("{:.0}", x_min)),
                Span::from(format!("{:.0}", x_max)),
            ]),
    )
    .y_axis(
        Axis::default()
            .title(Span::styled("Residual", Style::default().fg(Color::Red)))
            .style(Style::default().fg(Color::White))
            .bounds([0.0, y_max])
            .labels(vec![Span::from("0.0"), Span::from(format!("{:.2}", y_max))]),
    );
    f.render_widget(chart, rows[1]);

    let status = match &app.snapshot {
        Some(s) => format!(
            "frame {}  {:?}  quality {}  failures {}  audio {:?}  |  {}",
            s.frame_number,
            s.status,
            s.quality_text,
            s.consecutive_failures,
            s.audio_state,
            app.message
        ),
        None => app.message.clone(),
    };
    f.render_widget(
        Paragraph::new(status).block(Block::default().borders(Borders::ALL)),
        rows[2],
    );
}
