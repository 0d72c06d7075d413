use std::sync::Mutex;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Success,
    Error,
}

/// The single user-facing message line shared by both workflows.
pub trait StatusSink: Send + Sync {
    fn show(&self, kind: MessageKind, message: &str);

    fn info(&self, message: &str) {
        self.show(MessageKind::Info, message);
    }

    fn success(&self, message: &str) {
        self.show(MessageKind::Success, message);
    }

    fn error(&self, message: &str) {
        self.show(MessageKind::Error, message);
    }
}

/// Routes user-facing messages into the log.
#[derive(Debug, Default)]
pub struct TracingStatus;

impl StatusSink for TracingStatus {
    fn show(&self, kind: MessageKind, message: &str) {
        match kind {
            MessageKind::Info => info!(target: "facecam::status", "{message}"),
            MessageKind::Success => info!(target: "facecam::status", success = true, "{message}"),
            MessageKind::Error => error!(target: "facecam::status", "{message}"),
        }
    }
}

/// Keeps every message shown, newest last.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Mutex<Vec<(MessageKind, String)>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(MessageKind, String)> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last(&self) -> Option<(MessageKind, String)> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

impl StatusSink for MessageLog {
    fn show(&self, kind: MessageKind, message: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((kind, message.to_string()));
    }
}
