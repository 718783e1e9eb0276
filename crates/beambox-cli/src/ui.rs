//! UI utilities for Beambox CLI.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use qrcode::render::unicode;
use qrcode::{EcLevel, QrCode};

use beambox_core::file::format_size;
use beambox_core::protocol::messages::FileExploreFile;
use beambox_core::transfer::{FileTransferObserver, FileTransferState, SpeedObserver};

const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

/// Truncate a string to fit within a maximum width.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{}…", truncated)
    }
}

/// Render `payload` as a QR code made of Unicode half blocks.
pub fn render_qr(payload: &str) -> Result<String> {
    let qr_code = QrCode::with_error_correction_level(payload, EcLevel::M)
        .context("Failed to generate QR code")?;

    Ok(qr_code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

#[derive(Default)]
struct DisplayState {
    progress: HashMap<String, u64>,
    speed: String,
    current: String,
    last_draw: Option<Instant>,
}

/// Prints a one-line progress bar for a running transfer.
///
/// Register it with both the transfer and its
/// [`beambox_core::transfer::SpeedCalculator`].
pub struct TransferDisplay {
    total_size: u64,
    quiet: bool,
    state: Mutex<DisplayState>,
}

impl TransferDisplay {
    /// Create a display for a transfer of `total_size` bytes.
    pub fn new(total_size: u64, quiet: bool) -> Arc<Self> {
        Arc::new(Self {
            total_size,
            quiet,
            state: Mutex::new(DisplayState::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DisplayState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn draw(&self, state: &mut DisplayState, force: bool) {
        if self.quiet {
            return;
        }
        let now = Instant::now();
        if !force
            && state
                .last_draw
                .is_some_and(|last| now.duration_since(last) < REDRAW_INTERVAL)
        {
            return;
        }
        state.last_draw = Some(now);

        let done: u64 = state.progress.values().sum();
        let pct = if self.total_size == 0 {
            100.0
        } else {
            done as f64 * 100.0 / self.total_size as f64
        };
        print!(
            "\r  [{:>6.2}%] {} - {} of {} - {}    ",
            pct,
            truncate_string(&state.current, 24),
            format_size(done),
            format_size(self.total_size),
            state.speed
        );
        let _ = io::stdout().flush();
    }
}

impl FileTransferObserver for TransferDisplay {
    fn on_new_state(&self, state: &FileTransferState) {
        if self.quiet || !state.is_terminal() {
            return;
        }
        let mut display = self.lock();
        self.draw(&mut display, true);
        println!();
    }

    fn on_start_file(&self, file: &FileExploreFile) {
        let mut state = self.lock();
        state.current.clone_from(&file.name);
        state.progress.insert(file.path.clone(), 0);
        self.draw(&mut state, false);
    }

    fn on_progress_update(&self, file: &FileExploreFile, progress: u64) {
        let mut state = self.lock();
        state.progress.insert(file.path.clone(), progress);
        self.draw(&mut state, false);
    }

    fn on_end_file(&self, file: &FileExploreFile) {
        let mut state = self.lock();
        state.progress.insert(file.path.clone(), file.size);
        self.draw(&mut state, false);
    }
}

impl SpeedObserver for TransferDisplay {
    fn on_speed_updated(&self, _speed_in_bytes: u64, speed_in_string: &str) {
        let mut state = self.lock();
        state.speed = speed_in_string.to_string();
        self.draw(&mut state, false);
    }
}

/// One-line summary of a finished transfer.
pub fn describe_outcome(state: &FileTransferState, files: usize, total_size: u64) -> String {
    match state {
        FileTransferState::Finished => format!(
            "Transfer complete: {} file(s), {}",
            files,
            format_size(total_size)
        ),
        FileTransferState::Canceled => "Transfer cancelled.".to_string(),
        FileTransferState::Error(msg) => format!("Transfer failed: {}", msg),
        FileTransferState::RemoteError(msg) => format!("Peer reported an error: {}", msg),
        FileTransferState::NotExecute | FileTransferState::Started => {
            format!("Transfer did not finish ({})", state)
        }
    }
}
