//! Run-lifecycle states and the transition table.
//!
//! ```text
//! Unconnected ──Initialise──> Idle(initialised) ──Configure──> Configured
//!                                  ▲                              │   ▲
//!                                  │                      StartRun│   │Configure
//!                                Reset                            ▼   │
//!                            (from any live state)  Stopped <──StopRun── Running
//!
//! any state but Terminated ──Terminate──> Terminated
//! fatal hook failure ──> Error (only Terminate accepted)
//! ```
//!
//! [`plan`] is the single place that decides whether a command is legal in a
//! state and which hook it runs. The receiver never second-guesses it.

use crate::command::{Command, CommandKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Created, never initialised.
    Unconnected,
    Idle { initialised: bool },
    Configured,
    Running,
    /// A run has ended; behaves like `Configured`.
    Stopped,
    /// A hook failed unrecoverably. Only `Terminate` is accepted.
    Error,
    Terminated,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Unconnected => write!(f, "Unconnected"),
            RunState::Idle { initialised: true } => write!(f, "Idle(initialised)"),
            RunState::Idle { initialised: false } => write!(f, "Idle(unconfigured)"),
            RunState::Configured => write!(f, "Configured"),
            RunState::Running => write!(f, "Running"),
            RunState::Stopped => write!(f, "Configured(stopped)"),
            RunState::Error => write!(f, "Error"),
            RunState::Terminated => write!(f, "Terminated"),
        }
    }
}

impl RunState {
    /// Wire code used on the control channel.
    pub fn code(self) -> u8 {
        match self {
            RunState::Unconnected => 0,
            RunState::Idle { initialised: false } => 1,
            RunState::Idle { initialised: true } => 2,
            RunState::Configured => 3,
            RunState::Running => 4,
            RunState::Stopped => 5,
            RunState::Error => 6,
            RunState::Terminated => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => RunState::Unconnected,
            1 => RunState::Idle { initialised: false },
            2 => RunState::Idle { initialised: true },
            3 => RunState::Configured,
            4 => RunState::Running,
            5 => RunState::Stopped,
            6 => RunState::Error,
            7 => RunState::Terminated,
            _ => return None,
        })
    }

    pub fn is_initialised(self) -> bool {
        matches!(
            self,
            RunState::Idle { initialised: true }
                | RunState::Configured
                | RunState::Running
                | RunState::Stopped
        )
    }

    /// Configured and ready to start a run.
    pub fn can_start(self) -> bool {
        matches!(self, RunState::Configured | RunState::Stopped)
    }

    pub fn is_running(self) -> bool {
        self == RunState::Running
    }

    pub fn is_terminal(self) -> bool {
        self == RunState::Terminated
    }
}

/// Lifecycle hook selected for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Initialise,
    Configure,
    StartRun,
    StopRun,
    Reset,
    Terminate,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Run `hook`; on success move to `next`.
    Invoke { hook: Hook, next: RunState },
    /// Legal but nothing to do (repeated Initialise).
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{command} rejected in state {state}: {reason}")]
pub struct TransitionError {
    pub state: RunState,
    pub command: CommandKind,
    pub reason: &'static str,
}

/// Decide what `command` does in `state`.
pub fn plan(state: RunState, command: &Command) -> Result<Transition, TransitionError> {
    use RunState::*;

    let reject = |reason| TransitionError {
        state,
        command: command.kind(),
        reason,
    };

    if state == Terminated {
        return Err(reject("component is terminated"));
    }
    if state == Error && !matches!(command, Command::Terminate) {
        return Err(reject("component is in the error state, only Terminate is accepted"));
    }

    let invoke = |hook, next| Ok(Transition::Invoke { hook, next });

    match command {
        Command::Initialise(_) => match state {
            Unconnected | Idle { initialised: false } => {
                invoke(Hook::Initialise, Idle { initialised: true })
            }
            Idle { initialised: true } => Ok(Transition::NoOp),
            _ => Err(reject("already configured, Reset first")),
        },
        Command::Configure(_) => match state {
            Idle { initialised: true } | Configured | Stopped => {
                invoke(Hook::Configure, Configured)
            }
            Running => Err(reject("cannot reconfigure while running")),
            _ => Err(reject("not initialised")),
        },
        Command::StartRun(_) => match state {
            Configured | Stopped => invoke(Hook::StartRun, Running),
            Running => Err(reject("a run is already in progress")),
            _ => Err(reject("not configured")),
        },
        Command::StopRun => match state {
            Running => invoke(Hook::StopRun, Stopped),
            _ => Err(reject("no run in progress")),
        },
        Command::Reset => invoke(
            Hook::Reset,
            Idle {
                initialised: state.is_initialised(),
            },
        ),
        Command::Terminate => invoke(Hook::Terminate, Terminated),
        Command::Data(_) => invoke(Hook::Data, state),
    }
}
