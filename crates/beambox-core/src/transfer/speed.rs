//! Sliding-window transfer speed estimation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::FileTransferObserver;
use crate::file::format_size;
use crate::observer::{lock, Observers};
use crate::protocol::messages::FileExploreFile;

/// How often the running calculator samples the byte counter.
pub const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Number of samples the rate is computed over.
pub const SPEED_WINDOW: usize = 4;

/// Receives speed updates.
pub trait SpeedObserver: Send + Sync {
    /// New rate in bytes per second, and the same rate formatted for display.
    fn on_speed_updated(&self, speed_in_bytes: u64, speed_in_string: &str);
}

#[derive(Default)]
struct SpeedState {
    current_size: u64,
    per_file: HashMap<String, u64>,
    window: VecDeque<(Instant, u64)>,
    speed: u64,
}

impl SpeedState {
    fn rate(&self) -> u64 {
        let (Some(&(first_at, first_size)), Some(&(last_at, last_size))) =
            (self.window.front(), self.window.back())
        else {
            return 0;
        };
        let elapsed = last_at.saturating_duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (last_size.saturating_sub(first_size) as f64 / elapsed).round() as u64
    }
}

/// Estimates throughput from a cumulative byte counter.
///
/// Feed it either directly with [`SpeedCalculator::update_current_size`] or
/// by registering it as a [`FileTransferObserver`], in which case progress of
/// parallel files is summed and the window resets on every new file.
pub struct SpeedCalculator {
    state: Mutex<SpeedState>,
    observers: Observers<dyn SpeedObserver>,
    ticker: Mutex<Option<CancellationToken>>,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self {
            state: Mutex::new(SpeedState::default()),
            observers: Observers::new(),
            ticker: Mutex::new(None),
        }
    }
}

impl SpeedCalculator {
    /// Create a stopped calculator.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the cumulative byte count.
    pub fn update_current_size(&self, size: u64) {
        lock(&self.state).current_size = size;
    }

    /// Take one sample at `now` and return the resulting rate.
    pub fn record_sample_at(&self, now: Instant) -> u64 {
        let mut state = lock(&self.state);
        let size = state.current_size;
        state.window.push_back((now, size));
        while state.window.len() > SPEED_WINDOW {
            state.window.pop_front();
        }
        state.speed = state.rate();
        state.speed
    }

    /// Most recent rate in bytes per second.
    pub fn speed(&self) -> u64 {
        lock(&self.state).speed
    }

    /// Drop all samples so the next rate starts from scratch.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.window.clear();
        state.speed = 0;
    }

    /// Register an observer. It immediately receives the current rate.
    pub fn add_observer(&self, observer: Arc<dyn SpeedObserver>) {
        self.observers.add(Arc::clone(&observer));
        let speed = self.speed();
        observer.on_speed_updated(speed, &format_speed(speed));
    }

    /// Unregister an observer.
    pub fn remove_observer(&self, observer: &Arc<dyn SpeedObserver>) {
        self.observers.remove(observer);
    }

    /// Sample every [`SPEED_SAMPLE_INTERVAL`] and notify observers until
    /// [`SpeedCalculator::stop`]. Restarting replaces the previous ticker.
    pub fn start(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.ticker).replace(token.clone()) {
            previous.cancel();
        }

        let calculator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SPEED_SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        let speed = calculator.record_sample_at(Instant::now());
                        let display = format_speed(speed);
                        for observer in calculator.observers.snapshot() {
                            observer.on_speed_updated(speed, &display);
                        }
                    }
                }
            }
        });
    }

    /// Stop sampling and clear the window.
    pub fn stop(&self) {
        if let Some(token) = lock(&self.ticker).take() {
            token.cancel();
        }
        self.reset();
    }
}

impl FileTransferObserver for SpeedCalculator {
    fn on_start_file(&self, _file: &FileExploreFile) {
        self.reset();
    }

    fn on_progress_update(&self, file: &FileExploreFile, progress: u64) {
        let mut state = lock(&self.state);
        state.per_file.insert(file.path.clone(), progress);
        state.current_size = state.per_file.values().sum();
    }
}

/// Format a rate for display, e.g. `"1.5 MB/s"`.
#[must_use]
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_size(bytes_per_sec))
}
