use crate::common::{CancelToken, FaceGateError, Result};
use crate::notify::{ChannelNotifier, Notifier, Status};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent},
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal,
};
use std::io::{self, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Prints status events on the terminal, coloured by outcome.
///
/// Lines end in `\r\n` so output stays aligned while raw mode is on.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalNotifier;

impl TerminalNotifier {
    fn notify_hint(&self, hint: &str) {
        let mut stdout = io::stdout();
        crossterm::execute!(
            stdout,
            SetForegroundColor(Color::DarkGrey),
            Print(hint),
            ResetColor,
            Print("\r\n")
        )
        .ok();
        stdout.flush().ok();
    }
}

impl Notifier for TerminalNotifier {
    fn notify(&self, status: &Status) {
        let color = match status {
            Status::AuthSucceeded { .. } | Status::EnrollDone { .. } => Color::Green,
            Status::AuthFailed { .. } | Status::EnrollFailed { .. } => Color::Red,
            Status::ModelStale | Status::Cancelled => Color::Yellow,
            _ => Color::Reset,
        };
        let mut stdout = io::stdout();
        crossterm::execute!(
            stdout,
            SetForegroundColor(color),
            Print(status),
            ResetColor,
            Print("\r\n")
        )
        .ok();
        stdout.flush().ok();
    }
}

/// Enables raw mode for as long as it lives.
pub struct RawModeGuard;

impl RawModeGuard {
    pub fn new() -> Result<Self> {
        terminal::enable_raw_mode()
            .map_err(|e| FaceGateError::Other(anyhow::anyhow!("Failed to enable raw mode: {}", e)))?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        terminal::disable_raw_mode().ok();
    }
}

pub fn check_for_escape() -> io::Result<bool> {
    if event::poll(Duration::from_millis(0))? {
        if let Event::Key(KeyEvent { code, .. }) = event::read()? {
            return Ok(code == KeyCode::Esc);
        }
    }
    Ok(false)
}

/// Runs `session` on a worker thread while this thread renders its status
/// events and turns an Esc key press into cancellation.
pub fn run_interactive<T, F>(session: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(ChannelNotifier, CancelToken) -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let cancel = CancelToken::new();
    let worker = {
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("facegate-session".into())
            .spawn(move || session(ChannelNotifier::new(tx), cancel))?
    };

    let renderer = TerminalNotifier;
    let raw_mode = RawModeGuard::new();
    if raw_mode.is_ok() {
        renderer.notify_hint("Press ESC to cancel");
    }

    loop {
        if raw_mode.is_ok() && !cancel.is_cancelled() && check_for_escape().unwrap_or(false) {
            tracing::info!("Escape pressed, cancelling session");
            cancel.cancel();
        }

        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(status) => renderer.notify(&status),
            Err(RecvTimeoutError::Timeout) => {}
            // The worker dropped its notifier: the session is over.
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    drop(raw_mode);

    worker
        .join()
        .map_err(|_| FaceGateError::Other(anyhow::anyhow!("Session thread panicked")))?
}
