use std::sync::Arc;

use facecam_common::status::StatusSink;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::CaptureController;

/// One line of stdin input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Capture,
    Submit(String),
    Status,
    Clear,
    Quit,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (word, arg) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match word {
            "" => Command::Empty,
            "capture" | "c" => Command::Capture,
            "submit" => Command::Submit(arg.trim().to_string()),
            "status" => Command::Status,
            "clear" => Command::Clear,
            "quit" | "exit" => Command::Quit,
            other => Command::Unknown(other.to_string()),
        }
    }
}

pub enum Outcome {
    /// Capture or submit is running in the background.
    #[allow(dead_code)]
    Started(JoinHandle<()>),
    Done,
    /// The control for this command is currently disabled.
    Refused,
    Quit,
}

/// Run one command against the controller, honouring the same enablement
/// rules the controls view reports.
pub fn dispatch(
    controller: &Arc<CaptureController>,
    status: &dyn StatusSink,
    command: Command,
) -> Outcome {
    match command {
        Command::Capture => {
            let controls = controller.controls();
            if !controls.capture_enabled {
                status.info(&controls.instruction);
                return Outcome::Refused;
            }
            let controller = Arc::clone(controller);
            Outcome::Started(tokio::spawn(async move {
                if let Err(e) = controller.capture().await {
                    debug!(error = %e, "capture not taken");
                }
            }))
        }
        Command::Submit(username) => {
            let controls = controller.controls();
            if !controls.submit_enabled {
                status.info(&controls.instruction);
                return Outcome::Refused;
            }
            let controller = Arc::clone(controller);
            Outcome::Started(tokio::spawn(async move {
                if let Err(e) = controller.submit(&username).await {
                    debug!(username = %username, error = %e, "submission not completed");
                }
            }))
        }
        Command::Status => {
            let controls = controller.controls();
            info!(
                captured = controls.captured,
                remaining = controls.remaining,
                capture_enabled = controls.capture_enabled,
                submit_enabled = controls.submit_enabled,
                submitting = controls.submitting,
                username = %controls.username,
                "{}",
                controls.instruction
            );
            Outcome::Done
        }
        Command::Clear => {
            controller.clear();
            Outcome::Done
        }
        Command::Quit => Outcome::Quit,
        Command::Empty => Outcome::Done,
        Command::Unknown(other) => {
            warn!(
                command = %other,
                "unknown command; use capture, submit <username>, status, clear or quit"
            );
            Outcome::Done
        }
    }
}
