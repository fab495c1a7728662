//! Throughput progress display for the CLI.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Counters the workers bump; the reporter thread samples them.
#[derive(Default)]
pub struct ProgressCounters {
    pub total_bytes: AtomicU64,
    pub done_bytes: AtomicU64,
    pub files_done: AtomicU64,
    total_known: AtomicBool,
}

impl ProgressCounters {
    pub fn new() -> Arc<ProgressCounters> {
        Arc::new(ProgressCounters::default())
    }

    pub fn add_done(&self, bytes: u64) {
        self.done_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_file(&self) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_total(&self, bytes: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
        self.total_known.store(true, Ordering::Relaxed);
    }
}

/// Bottom status line updated a few times a second.
pub struct ProgressReporter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn start(counters: Arc<ProgressCounters>) -> ProgressReporter {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("wdt-progress".into())
            .spawn(move || {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.green} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar.enable_steady_tick(Duration::from_millis(120));
                let start = Instant::now();
                while !stop2.load(Ordering::Relaxed) {
                    let done = counters.done_bytes.load(Ordering::Relaxed);
                    let total = counters.total_bytes.load(Ordering::Relaxed);
                    let files = counters.files_done.load(Ordering::Relaxed);
                    let secs = start.elapsed().as_secs_f64();
                    let rate = if secs > 0.1 {
                        done as f64 / secs / 1_048_576.0
                    } else {
                        0.0
                    };
                    let msg = if counters.total_known.load(Ordering::Relaxed) && total > 0 {
                        format!(
                            "{:.1}/{:.1} MB ({} files) @ {:.1} MB/s",
                            done as f64 / 1_048_576.0,
                            total as f64 / 1_048_576.0,
                            files,
                            rate
                        )
                    } else {
                        format!(
                            "{:.1} MB ({} files) @ {:.1} MB/s",
                            done as f64 / 1_048_576.0,
                            files,
                            rate
                        )
                    };
                    bar.set_message(msg);
                    thread::sleep(Duration::from_millis(250));
                }
                bar.finish_and_clear();
            })
            .expect("failed to spawn progress reporter");
        ProgressReporter {
            stop,
            handle: Some(handle),
        }
    }

    pub fn finish(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let c = ProgressCounters::new();
        c.set_total(100);
        c.add_done(40);
        c.add_done(20);
        c.add_file();
        assert_eq!(c.done_bytes.load(Ordering::Relaxed), 60);
        assert_eq!(c.total_bytes.load(Ordering::Relaxed), 100);
        assert_eq!(c.files_done.load(Ordering::Relaxed), 1);
    }
}
