//! Coarse process-wide update rate.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Counts updates in a tumbling window.
///
/// The rate is the number of updates recorded since the current window
/// opened. Once `window` has elapsed the next access opens a fresh window
/// at zero.
pub struct UpdateRate {
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    opened: Instant,
    count: u64,
}

impl WindowState {
    fn roll(&mut self, window: Duration, now: Instant) {
        if now.duration_since(self.opened) >= window {
            self.opened = now;
            self.count = 0;
        }
    }
}

impl UpdateRate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(WindowState {
                opened: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Record one update and return the rate including it.
    pub fn record(&self) -> u64 {
        let mut state = self.state.lock();
        state.roll(self.window, Instant::now());
        state.count += 1;
        state.count
    }

    /// Updates recorded in the current window.
    pub fn current(&self) -> u64 {
        let mut state = self.state.lock();
        state.roll(self.window, Instant::now());
        state.count
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
