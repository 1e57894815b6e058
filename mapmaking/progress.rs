use crate::solver::IterationRecord;
use std::fmt;

/// Stages reported while building and solving the normal equations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SolveStage {
    Accumulation,
    OperatorAssembly,
    Iteration,
}

impl SolveStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Accumulation => "shard accumulation",
            Self::OperatorAssembly => "operator assembly",
            Self::Iteration => "conjugate-gradient iterations",
        }
    }
}

impl fmt::Display for SolveStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress of a map-making run.
pub trait SolveProgressObserver: Send {
    fn on_stage_start(&mut self, stage: SolveStage, total: usize) {
        let _ = (stage, total);
    }
    fn on_stage_advance(&mut self, stage: SolveStage, completed: usize) {
        let _ = (stage, completed);
    }
    fn on_stage_finish(&mut self, stage: SolveStage) {
        let _ = stage;
    }
    fn on_iteration(&mut self, record: &IterationRecord) {
        let _ = record;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl SolveProgressObserver for NoopProgress {}

/// Keeps every event; handy for tests and for callers that post-process the
/// convergence history.
#[derive(Default, Debug)]
pub struct RecordingProgress {
    pub events: Vec<(SolveStage, ProgressEvent)>,
    pub iterations: Vec<IterationRecord>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    Started(usize),
    Advanced(usize),
    Finished,
}

impl SolveProgressObserver for RecordingProgress {
    fn on_stage_start(&mut self, stage: SolveStage, total: usize) {
        self.events.push((stage, ProgressEvent::Started(total)));
    }
    fn on_stage_advance(&mut self, stage: SolveStage, completed: usize) {
        self.events.push((stage, ProgressEvent::Advanced(completed)));
    }
    fn on_stage_finish(&mut self, stage: SolveStage) {
        self.events.push((stage, ProgressEvent::Finished));
    }
    fn on_iteration(&mut self, record: &IterationRecord) {
        self.iterations.push(*record);
    }
}
