//! Error types shared across the crate.
//!
//! Only [`ConfigError`] is ever fatal. [`ScanError`]s are logged by the
//! collector loop and the cycle is retried on the next tick.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Result alias for fallible operations that surface a crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top level error returned from startup and the binaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration was missing, malformed or inconsistent.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O failure outside of a scan cycle (binding sockets, spawning threads).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Installing the Ctrl-C handler failed.
    #[error("signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),

    /// The terminal HUD failed.
    #[error("display error: {0}")]
    Hud(#[from] crate::gui::HudError),
}

/// A problem with the static configuration, detected before anything starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying failure.
        source: io::Error,
    },

    /// The file is not valid RON for [`crate::config::Config`].
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] ron::de::SpannedError),

    /// Triangulation needs at least three references.
    #[error("need at least 3 reference points, got {have}")]
    NotEnoughReferences {
        /// Number of configured references.
        have: usize,
    },

    /// Two references share an identity.
    #[error("reference point {0} is listed more than once")]
    DuplicateReference(String),

    /// A reference has an empty identity or a non-finite coordinate.
    #[error("reference point {id:?} is invalid: {reason}")]
    InvalidReference {
        /// Identity of the offending reference.
        id: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The Wi-Fi interface name is malformed or absent from the host.
    #[error("bad network interface {name:?}: {reason}")]
    BadInterface {
        /// Configured interface name.
        name: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Any other out of range value.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Dotted path of the field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// A single failed scan cycle. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// The external scan program could not be started.
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying failure.
        source: io::Error,
    },

    /// The external scan program exited unsuccessfully.
    #[error("`{program}` exited with {status}: {stderr}")]
    CommandFailed {
        /// Program name.
        program: String,
        /// Exit status as printed by the OS.
        status: String,
        /// Trimmed standard error.
        stderr: String,
    },

    /// The scan overran its deadline and was abandoned.
    #[error("{what} timed out after {after:?}")]
    Timeout {
        /// What was being waited on.
        what: String,
        /// Deadline that was exceeded.
        after: Duration,
    },

    /// No scanning device is attached.
    #[error("no device found: {0}")]
    NoDevice(String),

    /// Reading or writing the device failed.
    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
}
