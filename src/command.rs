//! Run-control commands, replies and their control-channel encoding.
//!
//! On the wire a command is `kind u8, has_param u8, [len u32, utf8]` and a
//! reply is `state u8, severity u8, has_message u8, [len u32, utf8]`, each
//! carried in one length-prefixed frame (see [`crate::transport`]).

use crate::state::RunState;
use bytes::{BufMut, Bytes, BytesMut};
use daq_core::codec::{put_str, Reader};
use daq_core::error::{CodecError, DaqError};
use serde::{Deserialize, Serialize};

/// A lifecycle command sent by run control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Optional parameter is free-form initialisation text.
    Initialise(Option<String>),
    /// Optional parameter is the TOML text of the run configuration.
    Configure(Option<String>),
    StartRun(u32),
    StopRun,
    Reset,
    Terminate,
    /// Out-of-band parameter, no state change.
    Data(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandKind {
    Initialise = 0,
    Configure = 1,
    StartRun = 2,
    StopRun = 3,
    Reset = 4,
    Terminate = 5,
    Data = 6,
}

impl CommandKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CommandKind::Initialise),
            1 => Some(CommandKind::Configure),
            2 => Some(CommandKind::StartRun),
            3 => Some(CommandKind::StopRun),
            4 => Some(CommandKind::Reset),
            5 => Some(CommandKind::Terminate),
            6 => Some(CommandKind::Data),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Initialise(_) => CommandKind::Initialise,
            Command::Configure(_) => CommandKind::Configure,
            Command::StartRun(_) => CommandKind::StartRun,
            Command::StopRun => CommandKind::StopRun,
            Command::Reset => CommandKind::Reset,
            Command::Terminate => CommandKind::Terminate,
            Command::Data(_) => CommandKind::Data,
        }
    }

    pub fn param(&self) -> Option<String> {
        match self {
            Command::Initialise(p) | Command::Configure(p) => p.clone(),
            Command::StartRun(run) => Some(run.to_string()),
            Command::Data(p) => Some(p.clone()),
            Command::StopRun | Command::Reset | Command::Terminate => None,
        }
    }

    /// Rebuild a command from its kind and parameter.
    pub fn from_parts(kind: CommandKind, param: Option<String>) -> Result<Self, DaqError> {
        Ok(match kind {
            CommandKind::Initialise => Command::Initialise(param),
            CommandKind::Configure => Command::Configure(param),
            CommandKind::StartRun => {
                let raw = param.ok_or_else(|| {
                    DaqError::Configuration("StartRun requires a run number".into())
                })?;
                let run = raw.trim().parse().map_err(|_| {
                    DaqError::Configuration(format!("invalid run number '{}'", raw))
                })?;
                Command::StartRun(run)
            }
            CommandKind::StopRun => Command::StopRun,
            CommandKind::Reset => Command::Reset,
            CommandKind::Terminate => Command::Terminate,
            CommandKind::Data => Command::Data(param.unwrap_or_default()),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.kind() as u8);
        put_opt_str(&mut buf, self.param().as_deref());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DaqError> {
        let mut r = Reader::new(data);
        let raw = r.u8("command kind")?;
        let kind = CommandKind::from_u8(raw).ok_or(CodecError::UnknownValue {
            field: "command kind",
            value: raw,
        })?;
        let param = get_opt_str(&mut r, "command parameter")?;
        r.finish()?;
        Self::from_parts(kind, param)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::StartRun(run) => write!(f, "StartRun({})", run),
            Command::Data(p) => write!(f, "Data({})", p),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// How bad a reply or status is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Severity {
    Ok = 0,
    Warning = 1,
    Error = 2,
    Fatal = 3,
}

impl Severity {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Severity::Ok),
            1 => Some(Severity::Warning),
            2 => Some(Severity::Error),
            3 => Some(Severity::Fatal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Acknowledgement of exactly one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub state: RunState,
    pub severity: Severity,
    pub message: Option<String>,
}

impl Reply {
    pub fn ok(state: RunState) -> Self {
        Self {
            state,
            severity: Severity::Ok,
            message: None,
        }
    }

    pub fn with(state: RunState, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            state,
            severity,
            message: Some(message.into()),
        }
    }

    pub fn error(state: RunState, message: impl Into<String>) -> Self {
        Self::with(state, Severity::Error, message)
    }

    /// `true` unless the command failed (warnings count as success).
    pub fn is_ok(&self) -> bool {
        self.severity <= Severity::Warning
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.state.code());
        buf.put_u8(self.severity as u8);
        put_opt_str(&mut buf, self.message.as_deref());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DaqError> {
        let mut r = Reader::new(data);
        let raw_state = r.u8("reply state")?;
        let state = RunState::from_code(raw_state).ok_or(CodecError::UnknownValue {
            field: "reply state",
            value: raw_state,
        })?;
        let raw_severity = r.u8("reply severity")?;
        let severity = Severity::from_u8(raw_severity).ok_or(CodecError::UnknownValue {
            field: "reply severity",
            value: raw_severity,
        })?;
        let message = get_opt_str(&mut r, "reply message")?;
        r.finish()?;
        Ok(Self {
            state,
            severity,
            message,
        })
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.state, self.severity)?;
        if let Some(msg) = &self.message {
            write!(f, " {}", msg)?;
        }
        Ok(())
    }
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_str(r: &mut Reader<'_>, field: &'static str) -> Result<Option<String>, CodecError> {
    match r.u8(field)? {
        0 => Ok(None),
        1 => r.string(field).map(Some),
        other => Err(CodecError::UnknownValue {
            field,
            value: other,
        }),
    }
}
