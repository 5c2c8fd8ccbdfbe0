//! Fit observers.
//!
//! A [`FitTracer`] is called synchronously by [`NewtonFitter::fit`] at the start
//! of a fit, after every iteration, and once at the end. It only receives
//! shared references, so it can inspect but never steer the fit.

use std::cell::RefCell;
use std::fmt::Write;
use std::rc::Rc;

use tracing::info;

use crate::fitter::{FitState, NewtonFitter};
use crate::problem::FitProblem;

/// Observer hooks invoked by the fitter.
pub trait FitTracer {
    fn initialize(&mut self, fitter: &NewtonFitter, problem: &FitProblem);

    fn step(&mut self, fitter: &NewtonFitter, problem: &FitProblem);

    fn finish(&mut self, fitter: &NewtonFitter, problem: &FitProblem);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Initialize,
    Step,
    Finish,
}

/// Snapshot of the fitter taken at one trace event.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub event: TraceEvent,
    pub iteration: usize,
    pub state: FitState,
    pub chi2: f64,
    /// Merit at the start of the iteration (step events only).
    pub start_merit: Option<f64>,
    /// Best merit reached by the line search (step events only).
    pub best_merit: Option<f64>,
    pub scale: Option<f64>,
    pub step: Option<f64>,
    /// Whether the step came from the spectral fallback.
    pub spectral: bool,
    /// Hard-constraint values at this point.
    pub constraints: Vec<f64>,
}

impl TraceRecord {
    fn capture(event: TraceEvent, fitter: &NewtonFitter, problem: &FitProblem) -> Self {
        let step = if event == TraceEvent::Step { fitter.last_step() } else { None };
        Self {
            event,
            iteration: fitter.iterations(),
            state: fitter.state(),
            chi2: fitter.chi2(),
            start_merit: step.map(|s| s.start_merit),
            best_merit: step.map(|s| s.best_merit),
            scale: step.map(|s| s.scale),
            step: step.map(|s| s.step),
            spectral: step.is_some_and(|s| s.spectral),
            constraints: problem.constraint_values(),
        }
    }

    fn format_line(&self) -> String {
        let mut line = format!(
            "[{:?}] iter {:>4} | chi2 {:>13.6e}",
            self.event, self.iteration, self.chi2
        );
        if let Some(v) = self.start_merit {
            let _ = write!(line, " | f0 {:>11.4e}", v);
        }
        if let Some(v) = self.best_merit {
            let _ = write!(line, " | f {:>11.4e}", v);
        }
        if let Some(v) = self.scale {
            let _ = write!(line, " | scale {:>8.3e}", v);
        }
        if self.spectral {
            line.push_str(" | spectral");
        }
        let gmax = self.constraints.iter().fold(0.0_f64, |m, g| m.max(g.abs()));
        let _ = write!(line, " | max|g| {:>9.3e} | {:?}", gmax, self.state);
        line
    }
}

/// Shared view of the records collected by a [`RecordingTracer`].
///
/// The tracer itself is moved into the fitter; keep a `TraceHistory` to read
/// the records back afterwards.
#[derive(Debug, Clone, Default)]
pub struct TraceHistory {
    records: Rc<RefCell<Vec<TraceRecord>>>,
}

impl TraceHistory {
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.records.borrow_mut().clear();
    }
}

/// Tracer that stores one [`TraceRecord`] per event and optionally logs it.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    history: TraceHistory,
    log: bool,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also emit every record as an `info` line.
    pub fn with_logging(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    pub fn history(&self) -> TraceHistory {
        self.history.clone()
    }

    fn record(&mut self, event: TraceEvent, fitter: &NewtonFitter, problem: &FitProblem) {
        let record = TraceRecord::capture(event, fitter, problem);
        if self.log {
            info!("{}", record.format_line());
        }
        self.history.records.borrow_mut().push(record);
    }
}

impl FitTracer for RecordingTracer {
    fn initialize(&mut self, fitter: &NewtonFitter, problem: &FitProblem) {
        self.record(TraceEvent::Initialize, fitter, problem);
    }

    fn step(&mut self, fitter: &NewtonFitter, problem: &FitProblem) {
        self.record(TraceEvent::Step, fitter, problem);
    }

    fn finish(&mut self, fitter: &NewtonFitter, problem: &FitProblem) {
        self.record(TraceEvent::Finish, fitter, problem);
    }
}
