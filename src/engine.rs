//! Multi-field driver.
//!
//! Workers pull field numbers from a shared cursor, solve them with
//! [`SolveSession`] and send the records to the calling thread, which hands
//! them to the sink strictly in input order.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{ConfigError, EngineError};
use crate::field::FieldSource;
use crate::index::{check_index_set, IndexAccess};
use crate::solver::session::{CancelToken, SolveSession};
use crate::solver::{SolveResult, SolveStatus, SolverConfig};

/// Parameters of a multi-field run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker threads. Default: available parallelism.
    pub num_threads: usize,
    /// Wall-clock budget for the whole run, milliseconds. None = no limit.
    pub total_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            total_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        Ok(())
    }
}

/// The outcome for one input field.
#[derive(Debug, Clone)]
pub struct FieldRecord {
    /// Position of the field in the input.
    pub field_num: usize,
    /// The field's own id, if it could be read.
    pub field_id: Option<u64>,
    pub result: SolveResult,
}

/// Receives field records in input order.
pub trait SolutionSink {
    fn write(&mut self, record: FieldRecord) -> anyhow::Result<()>;
}

impl SolutionSink for Vec<FieldRecord> {
    fn write(&mut self, record: FieldRecord) -> anyhow::Result<()> {
        self.push(record);
        Ok(())
    }
}

/// Totals for a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunSummary {
    pub fields: usize,
    pub solved: usize,
    pub skipped: usize,
    pub elapsed_ms: f32,
}

/// Solves many fields against one set of indexes.
pub struct Engine<I: IndexAccess> {
    config: EngineConfig,
    solver: SolverConfig,
    indexes: Vec<I>,
    cancel: CancelToken,
}

impl<I: IndexAccess> Engine<I> {
    /// Validate both configurations and the index set.
    pub fn new(config: EngineConfig, solver: SolverConfig, indexes: Vec<I>) -> Result<Self, EngineError> {
        config.validate()?;
        solver.validate()?;
        check_index_set(&indexes)?;
        Ok(Self {
            config,
            solver,
            indexes,
            cancel: CancelToken::new(),
        })
    }

    pub fn solver_config(&self) -> &SolverConfig {
        &self.solver
    }

    pub fn indexes(&self) -> &[I] {
        &self.indexes
    }

    /// Token that cancels this engine's runs. Setting it is permanent.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Solve every field of `fields`, writing one record per field to `sink`.
    ///
    /// Only a sink error aborts the run; field problems become
    /// [`SolveStatus::Skipped`] records.
    pub fn run<F, S>(&self, fields: &F, sink: &mut S) -> anyhow::Result<RunSummary>
    where
        F: FieldSource + ?Sized,
        S: SolutionSink,
    {
        let t0 = Instant::now();
        let total = fields.len();
        let deadline = self
            .config
            .total_timeout_ms
            .map(|ms| t0 + Duration::from_millis(ms));
        let n_threads = self.config.num_threads.min(total.max(1));
        info!(
            "Solving {} fields with {} threads against {} indexes",
            total,
            n_threads,
            self.indexes.len()
        );

        let cursor = Mutex::new(0usize);
        let mut summary = RunSummary {
            fields: total,
            ..Default::default()
        };

        std::thread::scope(|s| -> anyhow::Result<()> {
            let (tx, rx) = mpsc::channel::<FieldRecord>();
            for _ in 0..n_threads {
                let tx = tx.clone();
                let cursor = &cursor;
                s.spawn(move || loop {
                    let n = {
                        let mut next = cursor.lock();
                        if *next >= total {
                            break;
                        }
                        *next += 1;
                        *next - 1
                    };
                    if tx.send(self.solve_one(fields, n, deadline)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            let mut pending: BTreeMap<usize, FieldRecord> = BTreeMap::new();
            let mut next = 0;
            for record in rx {
                pending.insert(record.field_num, record);
                while let Some(record) = pending.remove(&next) {
                    match record.result.status {
                        SolveStatus::Solved => summary.solved += 1,
                        SolveStatus::Skipped => summary.skipped += 1,
                        _ => {}
                    }
                    sink.write(record)
                        .with_context(|| format!("writing the record of field {}", next))?;
                    next += 1;
                }
            }
            Ok(())
        })?;

        summary.elapsed_ms = t0.elapsed().as_secs_f32() * 1000.0;
        info!(
            "Run finished: {}/{} fields solved, {} skipped, {:.1}ms",
            summary.solved, summary.fields, summary.skipped, summary.elapsed_ms
        );
        Ok(summary)
    }

    fn solve_one<F: FieldSource + ?Sized>(&self, fields: &F, n: usize, deadline: Option<Instant>) -> FieldRecord {
        match fields.field(n) {
            Ok(field) => {
                let mut session = SolveSession::new(&self.solver, &self.indexes, &field)
                    .with_cancel(self.cancel.clone());
                if let Some(d) = deadline {
                    session = session.with_deadline(d);
                }
                FieldRecord {
                    field_num: n,
                    field_id: Some(field.id),
                    result: session.run(),
                }
            }
            Err(e) => {
                warn!("Field {} skipped: {}", n, e);
                FieldRecord {
                    field_num: n,
                    field_id: None,
                    result: SolveResult::failure(SolveStatus::Skipped, 0.0),
                }
            }
        }
    }
}
