//! Error type for the audio session backend boundary.

use thiserror::Error;

/// Errors raised by a [`SessionBackend`](super::SessionBackend).
///
/// None of these are fatal: the accessor turns every one of them into a
/// zero/false result for its callers.
#[derive(Error, Debug)]
pub enum AudioError {
    /// No active session belongs to the named process.
    #[error("No audio session for '{0}'")]
    SessionNotFound(String),

    /// An external audio tool exited unsuccessfully.
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Output from the audio subsystem could not be understood.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The audio subsystem is not reachable.
    #[error("Audio subsystem unavailable: {0}")]
    Unavailable(String),

    /// I/O error while talking to the audio subsystem.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AudioError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }
}

pub type AudioResult<T> = Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinguished() {
        assert!(AudioError::SessionNotFound("spotify".into()).is_not_found());
        assert!(!AudioError::Unavailable("no daemon".into()).is_not_found());
    }

    #[test]
    fn command_failure_display() {
        let err = AudioError::CommandFailed {
            command: "pactl info".into(),
            stderr: "Connection refused".into(),
        };
        assert_eq!(err.to_string(), "pactl info failed: Connection refused");
    }
}
