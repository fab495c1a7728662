use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Transfer activity log, written when the operator passes `--log_file`.
pub trait Logger: Send + Sync {
    fn transfer_start(&self, _role: &str, _dir: &Path, _transfer_id: &str) {}
    fn file_done(&self, _rel_path: &str, _bytes: u64) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn transfer_done(&self, _status: &str, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn transfer_start(&self, role: &str, dir: &Path, transfer_id: &str) {
        self.line(&format!(
            "START role={} dir={} id={}",
            role,
            dir.display(),
            transfer_id
        ));
    }
    fn file_done(&self, rel_path: &str, bytes: u64) {
        self.line(&format!("FILE path={} bytes={}", rel_path, bytes));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
    fn transfer_done(&self, status: &str, bytes: u64, seconds: f64) {
        self.line(&format!(
            "DONE status={status} bytes={bytes} seconds={seconds:.3}"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.transfer_start("sender", Path::new("/src"), "tid");
        logger.file_done("a.txt", 6);
        logger.transfer_done("OK", 6, 0.5);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("FILE path=a.txt bytes=6"));
    }
}
