//! Error types shared by every rundaq component.
//!
//! This module defines [`DaqError`], the error type returned across the
//! control and data pipeline, together with the narrower error kinds that
//! carry a recoverability decision at the call site.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: a bad or missing setting at configure time. The
//!   component stays in its previous stable state.
//! - **`Transition`**: a command that is illegal in the current lifecycle
//!   state (e.g. `StartRun` while running). Rejected, state unchanged.
//! - **`Device`**: wraps [`DeviceError`]. Its [`DeviceErrorKind`] decides
//!   whether the acquisition loop logs and continues or aborts the run.
//! - **`Sink`**: wraps [`SinkError`]. Non-fatal unless the sink reports
//!   itself unusable.
//! - **`Registry`**: wraps [`RegistryError`]. Collisions are load-time fatal,
//!   unknown types are returned to the caller.
//! - **`Codec`**: malformed bytes on the data or control channel.
//! - **`Disconnected`** / **`RunAborted`**: transport loss and aborted runs.
//!
//! By using `#[from]`, the narrower kinds convert into `DaqError` with `?`.

use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

// =============================================================================
// Device Errors
// =============================================================================

/// Whether a device failure is local to one unit of data or breaks the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// A single failed read/write. Logged, the acquisition loop continues.
    Recoverable,
    /// The device or its transport is gone. The current run is aborted.
    Fatal,
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeviceErrorKind::Recoverable => "recoverable",
            DeviceErrorKind::Fatal => "fatal",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Device '{device}' {kind} error: {message}")]
pub struct DeviceError {
    pub device: String,
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(
        device: impl Into<String>,
        kind: DeviceErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn recoverable(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(device, DeviceErrorKind::Recoverable, message)
    }

    pub fn fatal(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(device, DeviceErrorKind::Fatal, message)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == DeviceErrorKind::Fatal
    }
}

// =============================================================================
// Sink Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkErrorKind {
    /// The event could not be persisted but the sink remains usable.
    Recoverable,
    /// The sink can no longer accept events (disk full, closed file, ...).
    Unusable,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Sink '{sink}' error: {message}")]
pub struct SinkError {
    pub sink: String,
    pub kind: SinkErrorKind,
    pub message: String,
}

impl SinkError {
    pub fn recoverable(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sink: sink.into(),
            kind: SinkErrorKind::Recoverable,
            message: message.into(),
        }
    }

    pub fn unusable(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sink: sink.into(),
            kind: SinkErrorKind::Unusable,
            message: message.into(),
        }
    }

    pub fn is_unusable(&self) -> bool {
        self.kind == SinkErrorKind::Unusable
    }
}

// =============================================================================
// Registry Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Two distinct names hash to the same id within one family.
    #[error("{family}: '{name}' collides with registered '{existing}' (id {id:#010x})")]
    Collision {
        family: &'static str,
        id: u32,
        name: String,
        existing: String,
    },

    /// The same name was registered twice within one family.
    #[error("{family}: '{name}' is already registered")]
    Duplicate { family: &'static str, name: String },

    #[error("{family}: unknown type {}", describe_unknown(.name, .id))]
    UnknownType {
        family: &'static str,
        id: u32,
        name: Option<String>,
    },

    #[error("global plugin registry already installed")]
    AlreadyInstalled,

    #[error("global plugin registry not installed")]
    NotInstalled,
}

fn describe_unknown(name: &Option<String>, id: &u32) -> String {
    match name {
        Some(name) => format!("'{}' (id {:#010x})", name, id),
        None => format!("id {:#010x}", id),
    }
}

// =============================================================================
// Codec Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated record: needed {needed} more bytes while reading {field}")]
    Truncated { field: &'static str, needed: usize },

    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported record version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("duplicate block id {0}")]
    DuplicateBlock(u32),

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown {field} value {value}")]
    UnknownValue { field: &'static str, value: u8 },
}

// =============================================================================
// Pipeline Error
// =============================================================================

/// Primary error type for the DAQ pipeline.
///
/// # Example
///
/// ```rust
/// use daq_core::error::DaqError;
///
/// fn validate_boards(n: u32) -> Result<(), DaqError> {
///     if n == 0 {
///         return Err(DaqError::Configuration("NumBoards must be positive".into()));
///     }
///     Ok(())
/// }
/// assert!(validate_boards(0).is_err());
/// ```
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration validation failed (missing key, unparsable value).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A command arrived that the current lifecycle state does not allow.
    #[error("Transition error: {0}")]
    Transition(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The peer on a data or control channel went away.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// The run was aborted by a fatal device or sink error.
    #[error("Run {run} aborted: {reason}")]
    RunAborted { run: u32, reason: String },

    /// The event stream of a run was violated (event after EORE, data before BORE).
    #[error("Stream error: {0}")]
    Stream(String),
}

impl DaqError {
    /// Returns `true` if the error is local to a single event or command and
    /// the component can carry on.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DaqError::Configuration(_)
            | DaqError::Transition(_)
            | DaqError::Registry(_)
            | DaqError::Codec(_)
            | DaqError::Toml(_)
            | DaqError::Stream(_) => true,
            DaqError::Device(e) => !e.is_fatal(),
            DaqError::Sink(e) => !e.is_unusable(),
            DaqError::Io(_) | DaqError::Disconnected(_) | DaqError::RunAborted { .. } => false,
        }
    }
}
