use std::{error::Error, fmt::Display, sync::mpsc};

/// Anything that can go wrong while driving the terminal.
#[derive(Debug)]
pub enum HudError {
    /// Terminal or socket I/O failed
    IOError(std::io::Error),
    /// The thread feeding updates hung up
    MPSCTryRecvError(mpsc::TryRecvError),
    /// A background thread panicked
    JoinError,
}

impl Display for HudError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HudError::IOError(e) => write!(f, "terminal I/O failed: {e}"),
            HudError::MPSCTryRecvError(e) => write!(f, "update feed stopped: {e}"),
            HudError::JoinError => write!(f, "background thread panicked"),
        }
    }
}

impl Error for HudError {}

impl From<std::io::Error> for HudError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<mpsc::TryRecvError> for HudError {
    fn from(value: mpsc::TryRecvError) -> Self {
        Self::MPSCTryRecvError(value)
    }
}
