//! Error injection for the simulated device.
//!
//! Each device call names its operation (`"open"`, `"read_length"`,
//! `"read_data"`, ...) and asks [`ErrorConfig::check_operation`] whether it
//! should fail. Scenarios decide the [`DeviceErrorKind`]: per-read glitches
//! are recoverable, a lost link or hardware fault is fatal and sticky.

use super::rng::MockRng;
use daq_core::error::{DeviceError, DeviceErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation probability of a recoverable failure; `"*"` matches all.
    failure_rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// Every call of `operation` after the first `count` fails (recoverable).
    FailAfterN { operation: &'static str, count: u32 },
    /// Every `period`-th call of `operation` fails (recoverable).
    FailEvery { operation: &'static str, period: u32 },
    /// Every call of `operation` times out (recoverable).
    Timeout { operation: &'static str },
    /// The link drops once `after` calls of any kind have succeeded (fatal, sticky).
    CommunicationLoss { after: u32 },
    /// The device reports a hardware fault on the next call (fatal, sticky).
    HardwareFault { code: u32 },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    total_ok: u32,
    communication_lost: bool,
    hardware_fault_code: u32,
}

impl ErrorConfig {
    /// No injected failures.
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Recoverable failures on every operation with probability `rate`.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    pub fn is_none(&self) -> bool {
        self.failure_rates.is_empty() && self.scenarios.is_empty()
    }

    /// Decide whether `operation` on `device` fails this time.
    pub fn check_operation(&self, device: &str, operation: &'static str) -> Result<(), DeviceError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(DeviceError::fatal(device, "communication lost"));
        }
        if state.hardware_fault_code != 0 {
            return Err(DeviceError::fatal(
                device,
                format!("hardware fault {}", state.hardware_fault_code),
            ));
        }

        let call = {
            let n = state.operation_counts.entry(operation).or_insert(0);
            *n += 1;
            *n
        };

        for scenario in self.scenarios.iter() {
            match *scenario {
                ErrorScenario::FailAfterN { operation: op, count } if op == operation => {
                    if call > count {
                        return Err(DeviceError::recoverable(
                            device,
                            format!("injected '{}' failure after {} calls", operation, count),
                        ));
                    }
                }
                ErrorScenario::FailEvery { operation: op, period }
                    if op == operation && period > 0 && call % period == 0 =>
                {
                    return Err(DeviceError::recoverable(
                        device,
                        format!("injected '{}' failure on call {}", operation, call),
                    ));
                }
                ErrorScenario::Timeout { operation: op } if op == operation => {
                    return Err(DeviceError::new(
                        device,
                        DeviceErrorKind::Recoverable,
                        format!("'{}' timed out", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss { after } if state.total_ok >= after => {
                    state.communication_lost = true;
                    return Err(DeviceError::fatal(device, "communication lost"));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = code;
                    return Err(DeviceError::fatal(device, format!("hardware fault {}", code)));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            return Err(DeviceError::recoverable(
                device,
                format!("random failure on '{}'", operation),
            ));
        }

        state.total_ok += 1;
        Ok(())
    }

    /// Clear counters and sticky faults.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
