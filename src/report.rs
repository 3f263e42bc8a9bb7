//! CLI progress output.
//!
//! Human mode writes one status line per event to stderr; JSON mode emits one
//! JSON object per line for scripting. Off suppresses everything. The default
//! is human on a TTY and off otherwise.

use crate::models::{ProgressEvent, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }
}

pub trait ProgressReporter: Send {
    fn report(&mut self, event: &ProgressEvent);
}

pub fn reporter(mode: ProgressMode) -> Box<dyn ProgressReporter> {
    match mode {
        ProgressMode::Off => Box::new(NullReporter),
        ProgressMode::Human => Box::new(HumanReporter),
        ProgressMode::Json => Box::new(JsonReporter),
    }
}

struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report(&mut self, _event: &ProgressEvent) {}
}

struct HumanReporter;

impl ProgressReporter for HumanReporter {
    fn report(&mut self, event: &ProgressEvent) {
        let marker = match event.status {
            TaskStatus::Completed => "done",
            TaskStatus::Error => "fail",
            TaskStatus::Cancelled => "stop",
            _ => "....",
        };
        eprintln!("[{:>3}%] {} {}", event.percent, marker, event.message);
    }
}

struct JsonReporter;

impl ProgressReporter for JsonReporter {
    fn report(&mut self, event: &ProgressEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            eprintln!("{}", line);
        }
    }
}
