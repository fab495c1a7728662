//! Cooperative abort signalling.
//!
//! Workers poll an [`AbortChecker`] at every loop head and around every
//! blocking call; nothing is ever forcibly killed, so joins always succeed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Things that can be cooperatively aborted share this single-method view.
pub trait AbortChecker: Send + Sync {
    fn should_abort(&self) -> bool;
}

/// The standard flag implementation, shared as `Arc<AbortFlag>`.
#[derive(Default)]
pub struct AbortFlag {
    aborted: AtomicBool,
}

impl AbortFlag {
    pub fn new() -> Arc<AbortFlag> {
        Arc::new(AbortFlag::default())
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

impl AbortChecker for AbortFlag {
    fn should_abort(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Arms a timer thread that raises the flag after `seconds`. Used by the
/// `--abort_after_seconds` flag; the thread is detached and polls in small
/// slices so a finished process does not linger on it.
pub fn abort_after(flag: Arc<AbortFlag>, seconds: u64) {
    thread::Builder::new()
        .name("wdt-abort-timer".into())
        .spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(seconds);
            while std::time::Instant::now() < deadline {
                if flag.should_abort() {
                    return;
                }
                thread::sleep(Duration::from_millis(100));
            }
            eprintln!("abort timer fired after {}s", seconds);
            flag.abort();
        })
        .expect("failed to spawn abort timer");
}

/// Sleep in bounded slices while watching the abort flag. Returns false if
/// the flag fired before the full duration elapsed.
pub fn sleep_abortable(checker: &dyn AbortChecker, total: Duration) -> bool {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if checker.should_abort() {
            return false;
        }
        let d = remaining.min(slice);
        thread::sleep(d);
        remaining = remaining.saturating_sub(d);
    }
    !checker.should_abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_observed_after_set() {
        let flag = AbortFlag::new();
        assert!(!flag.should_abort());
        flag.abort();
        assert!(flag.should_abort());
    }

    #[test]
    fn timer_raises_flag() {
        let flag = AbortFlag::new();
        abort_after(flag.clone(), 0);
        for _ in 0..50 {
            if flag.should_abort() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("abort timer never fired");
    }

    #[test]
    fn abortable_sleep_cut_short() {
        let flag = AbortFlag::new();
        flag.abort();
        let start = std::time::Instant::now();
        assert!(!sleep_abortable(&*flag, Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
