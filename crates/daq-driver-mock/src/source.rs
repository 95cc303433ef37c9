//! Simulated multi-board telescope readout.
//!
//! `MockSource` drives one [`MockDevice`] per configured board. Each
//! acquisition reads one frame from every board and packs them into a single
//! `MockRaw` event with one block per board, keyed by the board id.
//!
//! # Configuration keys
//!
//! | Key | Default | Meaning |
//! |---|---|---|
//! | `DeviceAddress` / `DevicePort` | `localhost` / `49248` | endpoint passed to `open` |
//! | `NumBoards` | `6` | number of boards read per event |
//! | `Det` / `Mode` | `MIMOSA26` / `ZS2` | descriptive begin-of-run tags |
//! | `MimosaID_<n>` | `n - 1` | block id of the `n`-th board, counted from 1 |
//! | `MimosaEn_<n>` | `1` | sensor enable mask of the `n`-th board |
//! | `PayloadBytes` / `Occupancy` | `64` / `0.05` | simulated frame size and hit density |
//! | `ReadoutIntervalMs` | `1` | pause before each acquisition |
//! | `Seed` | random | RNG seed for payloads and random failures |
//! | `ErrorRate` | `0.0` | probability of a recoverable read failure |
//! | `FailEvery` | `0` (off) | every n-th `read_data` fails recoverably |
//! | `LoseConnectionAfter` | unset | link drops (fatal) after n successful calls |

use crate::common::{ErrorConfig, ErrorScenario};
use crate::device::MockDevice;
use daq_core::config::Configuration;
use daq_core::device::{DataSource, Device};
use daq_core::error::{DaqResult, DeviceError};
use daq_core::event::Event;
use std::time::{Duration, Instant};

/// Type name of the events emitted by [`MockSource`].
pub const MOCK_RAW_EVENT: &str = "MockRaw";

#[derive(Debug, Clone)]
struct Board {
    id: u32,
    sensor_enable: u32,
}

#[derive(Debug)]
pub struct MockSource {
    name: String,
    det: String,
    mode: String,
    address: String,
    port: u16,
    interval: Duration,
    boards: Vec<Board>,
    devices: Vec<MockDevice>,
    errors: Option<ErrorConfig>,
    run: u32,
    trigger: u32,
    run_start: Instant,
}

impl MockSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            det: "MIMOSA26".to_string(),
            mode: "ZS2".to_string(),
            address: "localhost".to_string(),
            port: 49248,
            interval: Duration::from_millis(1),
            boards: Vec::new(),
            devices: Vec::new(),
            errors: None,
            run: 0,
            trigger: 0,
            run_start: Instant::now(),
        }
    }

    /// Inject failures into every board, overriding the error keys of the
    /// configuration.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn num_boards(&self) -> usize {
        self.boards.len()
    }

    fn error_config(&self, config: &Configuration) -> ErrorConfig {
        if let Some(errors) = &self.errors {
            return errors.clone();
        }

        let seed = config.get::<u64>("Seed", 0);
        let seed = (seed != 0).then_some(seed);
        let rate: f64 = config.get("ErrorRate", 0.0);
        let fail_every: u32 = config.get("FailEvery", 0);
        let lose_after: Option<u32> = config.try_get("LoseConnectionAfter").ok().flatten();

        let mut scenarios = Vec::new();
        if fail_every > 0 {
            scenarios.push(ErrorScenario::FailEvery {
                operation: "read_data",
                period: fail_every,
            });
        }
        if let Some(after) = lose_after {
            scenarios.push(ErrorScenario::CommunicationLoss { after });
        }

        if rate > 0.0 {
            ErrorConfig::random_failures_seeded(rate, seed)
        } else {
            ErrorConfig::scenarios(scenarios)
        }
    }

    fn close_devices(&mut self) {
        for dev in &mut self.devices {
            if let Err(e) = dev.close() {
                tracing::warn!(producer = %self.name, error = %e, "closing mock device");
            }
        }
        self.devices.clear();
    }

    fn elapsed_ns(&self) -> u64 {
        u64::try_from(self.run_start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl DataSource for MockSource {
    fn event_type(&self) -> &str {
        MOCK_RAW_EVENT
    }

    fn configure(&mut self, config: &Configuration) -> DaqResult<()> {
        let num_boards: u32 = config.get("NumBoards", 6);
        if num_boards == 0 {
            return Err(daq_core::DaqError::Configuration(
                "NumBoards must be at least 1".into(),
            ));
        }

        self.close_devices();
        self.boards.clear();
        self.det = config.get("Det", "MIMOSA26".to_string());
        self.mode = config.get("Mode", "ZS2".to_string());
        self.address = config.get("DeviceAddress", "localhost".to_string());
        self.port = config.get("DevicePort", 49248);
        self.interval = Duration::from_millis(config.get("ReadoutIntervalMs", 1));

        let payload: usize = config.get("PayloadBytes", 64);
        let occupancy: f64 = config.get("Occupancy", 0.05);
        let seed: u64 = config.get("Seed", 0);
        let errors = self.error_config(config);

        let boards: Vec<Board> = (0..num_boards)
            .map(|i| Board {
                id: config.get(&format!("MimosaID_{}", i + 1), i),
                sensor_enable: config.get(&format!("MimosaEn_{}", i + 1), 1),
            })
            .collect();

        // Nothing is kept unless every board opens.
        let mut devices = Vec::with_capacity(boards.len());
        for (i, board) in boards.iter().enumerate() {
            let mut dev = MockDevice::new(format!("{}/board{}", self.name, board.id))
                .with_errors(errors.clone())
                .with_payload(payload, occupancy);
            if seed != 0 {
                dev = dev.with_seed(seed.wrapping_add(i as u64));
            }
            if let Err(e) = dev.open(&self.address, self.port) {
                for opened in &mut devices {
                    let _ = Device::close(opened);
                }
                return Err(e.into());
            }
            devices.push(dev);
        }
        self.boards = boards;
        self.devices = devices;

        tracing::info!(
            producer = %self.name,
            boards = num_boards,
            address = %self.address,
            port = self.port,
            "mock source configured"
        );
        Ok(())
    }

    fn start_run(&mut self, run: u32) -> DaqResult<()> {
        if self.devices.is_empty() {
            return Err(daq_core::DaqError::Configuration(
                "mock source has no open devices".into(),
            ));
        }
        self.run = run;
        self.trigger = 0;
        self.run_start = Instant::now();
        Ok(())
    }

    fn begin_run_tags(&self) -> Vec<(String, String)> {
        let mut tags = vec![
            ("DET".to_string(), self.det.clone()),
            ("MODE".to_string(), self.mode.clone()),
            ("BOARDS".to_string(), self.boards.len().to_string()),
            ("ADDRESS".to_string(), format!("{}:{}", self.address, self.port)),
        ];
        for (i, board) in self.boards.iter().enumerate() {
            tags.push((format!("ID{}", i), board.id.to_string()));
            tags.push((format!("MIMOSA_EN{}", i), board.sensor_enable.to_string()));
        }
        tags
    }

    fn acquire(&mut self) -> Result<Option<Event>, DeviceError> {
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }

        let begin = self.elapsed_ns();
        let mut ev = Event::new(MOCK_RAW_EVENT);
        for (board, dev) in self.boards.iter().zip(self.devices.iter_mut()) {
            let len = dev.read_length()?;
            let data = dev.read_data(len)?;
            ev.add_block(board.id, data);
        }
        ev.set_trigger_number(self.trigger);
        ev.set_timestamp(begin, self.elapsed_ns());
        self.trigger = self.trigger.wrapping_add(1);
        Ok(Some(ev))
    }

    fn release(&mut self) {
        self.close_devices();
    }
}
