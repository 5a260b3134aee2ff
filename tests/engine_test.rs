//! Multi-field runs: ordering, skipped fields, cancellation and sink errors.

mod common;

use common::{init_tracing, truth_wcs, Sky};
use quadsolve::{
    Engine, EngineConfig, Field, FieldError, FieldRecord, FieldSource, ReferenceIndex,
    SolutionSink, SolveStatus, SolverConfig,
};

fn engine(sky: &Sky, threads: usize, total_timeout_ms: Option<u64>) -> Engine<ReferenceIndex> {
    let config = EngineConfig {
        num_threads: threads,
        total_timeout_ms,
    };
    Engine::new(config, SolverConfig::new(1.0, 4.0), vec![sky.index(1)]).unwrap()
}

/// Alternates solvable fields with distractor-only ones.
fn fields(sky: &Sky, n: usize) -> Vec<Field> {
    (0..n)
        .map(|i| {
            if i % 2 == 0 {
                sky.field(30, 5, 0.2, 100 + i as u64)
            } else {
                sky.field(0, 20, 0.0, 100 + i as u64)
            }
        })
        .collect()
}

/// Fields with one unreadable entry.
struct Gappy {
    fields: Vec<Field>,
    bad: usize,
}

impl FieldSource for Gappy {
    fn len(&self) -> usize {
        self.fields.len()
    }

    fn field(&self, n: usize) -> Result<Field, FieldError> {
        if n == self.bad {
            return Err(FieldError::Unreadable("truncated record".to_string()));
        }
        self.fields.get(n).cloned().ok_or(FieldError::Missing(n))
    }
}

#[test]
fn records_arrive_in_input_order() {
    init_tracing();
    let sky = Sky::new(truth_wcs(1.3, 0.45, 0.7, false), 160, 1);
    let input = fields(&sky, 6);
    let engine = engine(&sky, 3, None);

    let mut records: Vec<FieldRecord> = Vec::new();
    let summary = engine.run(&input, &mut records).unwrap();

    assert_eq!(records.len(), 6);
    for (n, record) in records.iter().enumerate() {
        assert_eq!(record.field_num, n);
        assert_eq!(record.field_id, Some(100 + n as u64));
        let expected = if n % 2 == 0 {
            SolveStatus::Solved
        } else {
            SolveStatus::NoMatch
        };
        assert_eq!(record.result.status, expected, "field {n}");
    }
    assert_eq!(summary.fields, 6);
    assert_eq!(summary.solved, 3);
    assert_eq!(summary.skipped, 0);
}

#[test]
fn unreadable_field_is_skipped() {
    let sky = Sky::new(truth_wcs(1.3, 0.45, 0.7, false), 160, 1);
    let source = Gappy {
        fields: fields(&sky, 4),
        bad: 2,
    };
    let mut records: Vec<FieldRecord> = Vec::new();
    let summary = engine(&sky, 2, None).run(&source, &mut records).unwrap();

    assert_eq!(records.len(), 4);
    assert_eq!(records[2].result.status, SolveStatus::Skipped);
    assert_eq!(records[2].field_id, None);
    assert_eq!(records[0].result.status, SolveStatus::Solved);
    assert_eq!(summary.skipped, 1);
}

#[test]
fn cancelled_engine_reports_every_field() {
    let sky = Sky::new(truth_wcs(1.3, 0.45, 0.7, false), 160, 1);
    let engine = engine(&sky, 2, None);
    engine.cancel_token().cancel();

    let mut records: Vec<FieldRecord> = Vec::new();
    engine.run(&fields(&sky, 4), &mut records).unwrap();
    assert_eq!(records.len(), 4);
    assert!(records
        .iter()
        .all(|r| r.result.status == SolveStatus::Cancelled));
}

#[test]
fn expired_run_budget_times_out() {
    let sky = Sky::new(truth_wcs(1.3, 0.45, 0.7, false), 160, 1);
    let mut records: Vec<FieldRecord> = Vec::new();
    engine(&sky, 2, Some(0))
        .run(&fields(&sky, 3), &mut records)
        .unwrap();
    assert!(records
        .iter()
        .all(|r| r.result.status == SolveStatus::Timeout));
}

struct FailingSink {
    written: usize,
}

impl SolutionSink for FailingSink {
    fn write(&mut self, _record: FieldRecord) -> anyhow::Result<()> {
        if self.written == 1 {
            anyhow::bail!("disk full");
        }
        self.written += 1;
        Ok(())
    }
}

#[test]
fn sink_error_aborts_the_run() {
    let sky = Sky::new(truth_wcs(1.3, 0.45, 0.7, false), 160, 1);
    let mut sink = FailingSink { written: 0 };
    let err = engine(&sky, 2, None)
        .run(&fields(&sky, 4), &mut sink)
        .unwrap_err();
    assert!(format!("{err:#}").contains("disk full"));
    assert_eq!(sink.written, 1);
}
