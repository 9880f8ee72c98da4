use std::{
    io::stdout,
    ops::ControlFlow,
    sync::mpsc::{self, Receiver},
    thread,
    time::Duration,
};

use crate::gui::error::MonitorError;

use crossterm::{
    event::{self, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};

use ratatui::{
    prelude::*,
    widgets::{block::Title, *},
    Terminal,
};

enum ThreadMessage {
    Stop,
}

/// Generates a gui that runs a function until the user provides input.
///
/// The function can be thought of as a recursive fold. `init` contains the
/// inital state of the loop, then `f` is called on the inital state to produce
/// a new state, and then `f` is called on that new state, and so on until the
/// user presses a key or `f` returns [ControlFlow::Break]. After every step,
/// `status` describes the state in a few lines of text for the screen.
pub fn fold_until_stop<F, S, T>(title: &str, init: T, f: F, status: S) -> Result<T, MonitorError>
where
    F: FnMut(T) -> ControlFlow<T, T> + Send + 'static,
    S: Fn(&T) -> Vec<String> + Send + 'static,
    T: Send + 'static,
{
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;

    let (stop_tx, stop_rx) = mpsc::channel();
    let (status_tx, status_rx) = mpsc::channel();
    let (res_tx, res_rx) = mpsc::channel();

    let th = thread::Builder::new()
        .name("fold_until_stop".to_string())
        .spawn(move || {
            let mut f = f;
            let mut val = init;

            loop {
                let (next, finished) = match f(val) {
                    ControlFlow::Continue(next) => (next, false),
                    ControlFlow::Break(next) => (next, true),
                };
                val = next;
                let _ = status_tx.send(status(&val));

                if finished || matches!(stop_rx.try_recv(), Ok(ThreadMessage::Stop)) {
                    let _ = res_tx.send(val);
                    break;
                }
            }
        })?;

    let drawn = draw_until_stop(title, &status_rx, &res_rx);

    // The worker may already have finished on its own.
    let _ = stop_tx.send(ThreadMessage::Stop);
    let res = match drawn {
        Ok(Some(val)) => Ok(val),
        Ok(None) => res_rx.recv().map_err(MonitorError::from),
        Err(e) => Err(e),
    };
    let joined = th.join().map_err(|_| MonitorError::JoinError);

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    joined?;
    res
}

/// Redraws the latest status until a key is pressed or the worker hands its
/// state back.
fn draw_until_stop<T>(
    title: &str,
    status_rx: &Receiver<Vec<String>>,
    res_rx: &Receiver<T>,
) -> Result<Option<T>, MonitorError> {
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;
    let mut lines = vec![" Starting... ".to_string()];

    loop {
        if let Some(latest) = status_rx.try_iter().last() {
            lines = latest;
        }
        if let Ok(val) = res_rx.try_recv() {
            return Ok(Some(val));
        }

        let title = Title::from(Span::from(format!(" {} ", title)).magenta().bold());
        let footer = Title::from(" Press any key to stop ".dim());
        let text = Paragraph::new(
            lines
                .iter()
                .map(|line| Line::from(line.as_str()))
                .collect::<Vec<_>>(),
        );
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                footer
                    .alignment(Alignment::Center)
                    .position(block::Position::Bottom),
            )
            .borders(Borders::ALL);
        terminal.draw(|frame| {
            let area = frame.size();
            frame.render_widget(text.block(block), area);
        })?;

        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(None);
                }
            }
        }
    }
}
