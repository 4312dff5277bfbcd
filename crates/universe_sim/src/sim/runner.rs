//! SimRunner: drives the kernel for many turns against one oracle.
//!
//! The runner owns the bookkeeping the kernel deliberately does not: turn
//! numbering, a structured log of what happened each turn, and summary
//! metrics. Skipped turns are counted and logged, never retried.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::kernel::{SideEffect, SimKernel, TurnError, TurnNote};
use super::oracle::ActionOracle;
use crate::universe::SpaceId;

/// One entry in the run's structured log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnLogEntry {
    /// 1-based turn number.
    pub turn: u64,
    /// Simulated time when the turn started.
    pub time: DateTime<Utc>,
    pub kind: TurnLogKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TurnLogKind {
    TurnCompleted {
        event_id: String,
        action: String,
        actor_id: String,
        context_id: Option<SpaceId>,
        observer_count: usize,
    },
    TurnSkipped {
        reason: TurnError,
    },
    SideEffectApplied {
        effect: SideEffect,
    },
    Diagnostic {
        note: TurnNote,
    },
}

/// What a single [`SimRunner::tick`] produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub turn: u64,
    pub event_id: Option<String>,
    pub skipped: Option<TurnError>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Turns attempted, including skipped ones.
    pub turns_attempted: u64,
    /// Events appended to the log.
    pub events_appended: u64,
    /// Turns skipped by turn-scoped errors.
    pub turns_skipped: u64,
    /// Spaces created by side effects.
    pub spaces_created: u64,
    /// Memberships added by side effects.
    pub members_joined: u64,
    /// events_appended over turns_attempted; zero before the first turn.
    pub completion_rate: f64,
}

pub struct SimRunner<O: ActionOracle> {
    kernel: SimKernel,
    oracle: O,
    logs: Vec<TurnLogEntry>,
    turns_attempted: u64,
    events_appended: u64,
    turns_skipped: u64,
    spaces_created: u64,
    members_joined: u64,
}

impl<O: ActionOracle> SimRunner<O> {
    pub fn new(kernel: SimKernel, oracle: O) -> Self {
        Self {
            kernel,
            oracle,
            logs: Vec::new(),
            turns_attempted: 0,
            events_appended: 0,
            turns_skipped: 0,
            spaces_created: 0,
            members_joined: 0,
        }
    }

    /// Attempts a single turn and records its outcome.
    pub fn tick(&mut self) -> TurnOutcome {
        self.turns_attempted += 1;
        let turn = self.turns_attempted;
        let time = self.kernel.now();

        match self.kernel.run_turn(&self.oracle) {
            Ok(receipt) => {
                self.events_appended += 1;
                for note in &receipt.notes {
                    self.logs.push(TurnLogEntry {
                        turn,
                        time,
                        kind: TurnLogKind::Diagnostic { note: note.clone() },
                    });
                }
                for effect in &receipt.side_effects {
                    match effect {
                        SideEffect::SpaceCreated { .. } => self.spaces_created += 1,
                        SideEffect::MemberJoined { .. } => self.members_joined += 1,
                    }
                    self.logs.push(TurnLogEntry {
                        turn,
                        time,
                        kind: TurnLogKind::SideEffectApplied {
                            effect: effect.clone(),
                        },
                    });
                }
                self.logs.push(TurnLogEntry {
                    turn,
                    time,
                    kind: TurnLogKind::TurnCompleted {
                        event_id: receipt.event.id.clone(),
                        action: receipt.event.action.clone(),
                        actor_id: receipt.event.actor_id.clone(),
                        context_id: receipt.event.context_id.clone(),
                        observer_count: receipt.event.visibility.len(),
                    },
                });
                TurnOutcome {
                    turn,
                    event_id: Some(receipt.event.id),
                    skipped: None,
                }
            }
            Err(err) => {
                self.turns_skipped += 1;
                self.logs.push(TurnLogEntry {
                    turn,
                    time,
                    kind: TurnLogKind::TurnSkipped { reason: err.clone() },
                });
                TurnOutcome {
                    turn,
                    event_id: None,
                    skipped: Some(err),
                }
            }
        }
    }

    /// Attempts exactly `turns` turns. Skipped turns are not replaced, so the
    /// log may end up shorter than `turns`; the metrics say by how much.
    pub fn run(&mut self, turns: u64) -> RunMetrics {
        for _ in 0..turns {
            self.tick();
        }
        self.metrics()
    }

    pub fn metrics(&self) -> RunMetrics {
        let completion_rate = if self.turns_attempted == 0 {
            0.0
        } else {
            self.events_appended as f64 / self.turns_attempted as f64
        };
        RunMetrics {
            turns_attempted: self.turns_attempted,
            events_appended: self.events_appended,
            turns_skipped: self.turns_skipped,
            spaces_created: self.spaces_created,
            members_joined: self.members_joined,
            completion_rate,
        }
    }

    pub fn logs(&self) -> &[TurnLogEntry] {
        &self.logs
    }

    pub fn take_logs(&mut self) -> Vec<TurnLogEntry> {
        std::mem::take(&mut self.logs)
    }

    pub fn kernel(&self) -> &SimKernel {
        &self.kernel
    }

    pub fn into_kernel(self) -> SimKernel {
        self.kernel
    }
}
