//! Aggregate progress reporting for a migration run.

use crate::util::env as env_util;
use std::time::{Duration, Instant};
use tracing::info;

/// Progress logging interval (rows). Override with env PROGRESS_INTERVAL.
fn progress_interval() -> usize {
    env_util::env_parse("PROGRESS_INTERVAL", 25usize).max(1)
}

/// One bounded progress indicator plus line logging that does not break it.
pub trait Progress: Send {
    fn start(&mut self, total: usize, initial: usize);
    fn update(&mut self, value: usize);
    fn log(&mut self, message: &str);
    fn finish(&mut self);
}

/// Renders progress as throttled tracing lines under the `progress` target.
pub struct LineProgress {
    label: String,
    total: usize,
    every: usize,
    start: Instant,
    last_log: Instant,
    processed: usize,
    finished: bool,
}

impl LineProgress {
    pub fn new<L: Into<String>>(label: L) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            total: 0,
            every: progress_interval(),
            start: now,
            last_log: now,
            processed: 0,
            finished: false,
        }
    }

    fn render(&mut self, done: bool) {
        let now = Instant::now();
        if !done && now.duration_since(self.last_log) < Duration::from_millis(200) {
            return;
        }
        self.last_log = now;

        let elapsed = now.duration_since(self.start).as_secs_f64().max(0.001);
        let rate = (self.processed as f64) / elapsed;
        let remaining = self.total.saturating_sub(self.processed);
        let pct = if self.total == 0 {
            100.0
        } else {
            (100.0 * (self.processed as f64)) / (self.total as f64)
        };

        if done {
            info!(target: "progress", label=%self.label, processed=self.processed, total=self.total, pct=%format!("{:.1}", pct), rate=%format!("{:.1}/s", rate), took=%format!("{:.1}s", elapsed), "done");
        } else {
            let eta = if self.processed > 0 {
                (remaining as f64) * (elapsed / (self.processed as f64))
            } else {
                0.0
            };
            info!(target: "progress", label=%self.label, processed=self.processed, remaining, total=self.total, pct=%format!("{:.1}", pct), rate=%format!("{:.1}/s", rate), eta=%format!("{:.1}s", eta), "progress");
        }
    }
}

impl Progress for LineProgress {
    fn start(&mut self, total: usize, initial: usize) {
        let now = Instant::now();
        self.total = total;
        self.processed = initial;
        self.start = now;
        self.last_log = now;
        self.finished = false;
    }

    fn update(&mut self, value: usize) {
        self.processed = value;
        if value == self.total {
            self.render(true);
            self.finished = true;
        } else if value % self.every == 0 {
            self.render(false);
        }
    }

    fn log(&mut self, message: &str) {
        info!(target: "migrate", "{}", message.trim_end());
    }

    fn finish(&mut self) {
        if !self.finished {
            self.render(true);
            self.finished = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_is_rendered_once() {
        let mut p = LineProgress::new("icons");
        p.start(2, 0);
        p.update(1);
        assert!(!p.finished);
        p.update(2);
        assert!(p.finished);
        p.finish();
        assert!(p.finished);
        assert_eq!(p.processed, 2);
    }

    #[test]
    fn restart_resets_counters() {
        let mut p = LineProgress::new("icons");
        p.start(3, 0);
        p.update(3);
        p.start(5, 1);
        assert_eq!(p.total, 5);
        assert_eq!(p.processed, 1);
        assert!(!p.finished);
    }
}
