use std::sync::Mutex;

/// Sink for the surgeon's user-facing messages.
///
/// Handed to the surgeon at construction and kept for its lifetime, so two
/// surgeons in one process can report to different places.
pub trait SurgeonLogger: std::fmt::Debug {
    fn info(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Forwards to the `log` facade.
#[derive(Debug, Clone, new)]
pub struct LogLogger {
    #[new(value = "\"ppyoloe_surgeon\"")]
    target: &'static str,
}

impl Default for LogLogger {
    fn default() -> LogLogger {
        LogLogger::new()
    }
}

impl LogLogger {
    pub fn with_target(target: &'static str) -> LogLogger {
        LogLogger { target }
    }
}

impl SurgeonLogger for LogLogger {
    fn info(&self, msg: &str) {
        info!(target: self.target, "{msg}");
    }

    fn error(&self, msg: &str) {
        error!(target: self.target, "{msg}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
}

/// Keeps every message in memory. Useful to assert on what was reported.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    records: Mutex<Vec<(Level, String)>>,
}

impl RecordingLogger {
    pub fn records(&self) -> Vec<(Level, String)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn messages(&self, level: Level) -> Vec<String> {
        self.records().into_iter().filter(|(l, _)| *l == level).map(|(_, m)| m).collect()
    }

    fn push(&self, level: Level, msg: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.push((level, msg.to_string()));
        }
    }
}

impl SurgeonLogger for RecordingLogger {
    fn info(&self, msg: &str) {
        self.push(Level::Info, msg)
    }

    fn error(&self, msg: &str) {
        self.push(Level::Error, msg)
    }
}

impl<L: SurgeonLogger + ?Sized> SurgeonLogger for std::sync::Arc<L> {
    fn info(&self, msg: &str) {
        (**self).info(msg)
    }

    fn error(&self, msg: &str) {
        (**self).error(msg)
    }
}
