//! Per-source stream bracketing at the collector.

use super::SourceId;
use daq_core::event::Event;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Connected, no begin-of-run seen in this run.
    AwaitingBore,
    Open { last: u32 },
    Closed,
    /// The connection dropped before the end-of-run.
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamViolation {
    #[error("event of run {got} while run {expected} is active")]
    WrongRun { expected: u32, got: u32 },
    #[error("event {0} before begin-of-run")]
    DataBeforeBore(u32),
    #[error("second begin-of-run")]
    DuplicateBore,
    #[error("event {0} after end-of-run")]
    AfterEore(u32),
    #[error("event number {got} does not follow {last}")]
    NonMonotonic { last: u32, got: u32 },
    #[error("no run is active")]
    NoRun,
}

/// Tracks where every connected source is within the current run.
#[derive(Debug, Default)]
pub struct StreamTracker {
    run: Option<u32>,
    sources: BTreeMap<SourceId, StreamPhase>,
}

impl StreamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking run `run`. Lost sources are forgotten, the rest wait
    /// for their begin-of-run.
    pub fn begin_run(&mut self, run: u32) {
        self.run = Some(run);
        self.sources.retain(|_, phase| *phase != StreamPhase::Lost);
        for phase in self.sources.values_mut() {
            *phase = StreamPhase::AwaitingBore;
        }
    }

    pub fn end_run(&mut self) {
        self.run = None;
    }

    pub fn run(&self) -> Option<u32> {
        self.run
    }

    pub fn connected(&mut self, source: &SourceId) {
        self.sources
            .insert(source.clone(), StreamPhase::AwaitingBore);
    }

    /// A source that goes away with its stream open is `Lost`; one that had
    /// not begun its stream is forgotten.
    pub fn disconnected(&mut self, source: &SourceId) {
        match self.sources.get(source) {
            Some(StreamPhase::Open { .. }) => {
                self.sources.insert(source.clone(), StreamPhase::Lost);
            }
            Some(StreamPhase::AwaitingBore) => {
                self.sources.remove(source);
            }
            _ => {}
        }
    }

    pub fn phase(&self, source: &str) -> Option<StreamPhase> {
        self.sources.get(source).copied()
    }

    /// Check `ev` against the source's stream and advance it.
    pub fn observe(&mut self, source: &SourceId, ev: &Event) -> Result<(), StreamViolation> {
        let expected = self.run.ok_or(StreamViolation::NoRun)?;
        if ev.run_number() != expected {
            return Err(StreamViolation::WrongRun {
                expected,
                got: ev.run_number(),
            });
        }

        let number = ev.event_number();
        let phase = self
            .sources
            .entry(source.clone())
            .or_insert(StreamPhase::AwaitingBore);

        let next = match *phase {
            StreamPhase::AwaitingBore | StreamPhase::Lost if ev.is_bore() => {
                StreamPhase::Open { last: number }
            }
            StreamPhase::AwaitingBore | StreamPhase::Lost => {
                return Err(StreamViolation::DataBeforeBore(number))
            }
            StreamPhase::Closed => return Err(StreamViolation::AfterEore(number)),
            StreamPhase::Open { .. } if ev.is_bore() => return Err(StreamViolation::DuplicateBore),
            StreamPhase::Open { last } if number <= last => {
                return Err(StreamViolation::NonMonotonic { last, got: number })
            }
            StreamPhase::Open { .. } if ev.is_eore() => StreamPhase::Closed,
            StreamPhase::Open { .. } => StreamPhase::Open { last: number },
        };
        *phase = next;
        Ok(())
    }

    /// Sources that still owe an end-of-run.
    pub fn open_sources(&self) -> Vec<SourceId> {
        self.sources
            .iter()
            .filter(|(_, p)| matches!(p, StreamPhase::AwaitingBore | StreamPhase::Open { .. }))
            .map(|(s, _)| s.clone())
            .collect()
    }

    /// Sources whose connection dropped in the middle of their stream.
    pub fn lost_sources(&self) -> Vec<SourceId> {
        self.sources
            .iter()
            .filter(|(_, p)| **p == StreamPhase::Lost)
            .map(|(s, _)| s.clone())
            .collect()
    }

    /// `true` once every source has either closed its stream or gone away.
    pub fn is_drained(&self) -> bool {
        self.open_sources().is_empty()
    }
}
