use core::fmt;

use std::time::{Duration, Instant};

use crate::comm::{CommError, Communicator, SerialComm};
use crate::report::{
    emit_line, History, IterationReport, Reporter, SolveStatus, SolverStats, StdoutReporter,
};
use crate::state::CcgState;
use crate::step::{step, HessianProduct, Objective, StepError};

/// Configuration errors, reported before the first iteration.
#[derive(Debug, Clone)]
pub enum SolverError {
    /// No initial guess was supplied.
    EmptyInitialGuess,
    /// The initial guess contains NaN or infinity.
    NonFiniteInitialGuess { index: usize },
    /// gtol must be finite and non-negative.
    InvalidTolerance { gtol: f64 },
    /// The mean-value target must be finite and non-negative.
    InvalidMeanValue { value: f64 },
    /// At least one iteration is required.
    InvalidMaxIters,
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyInitialGuess => write!(f, "an initial guess x0 is required"),
            Self::NonFiniteInitialGuess { index } => {
                write!(f, "initial guess is not finite at index {index}")
            }
            Self::InvalidTolerance { gtol } => {
                write!(f, "gtol must be finite and non-negative (got {gtol})")
            }
            Self::InvalidMeanValue { value } => {
                write!(f, "mean value must be finite and non-negative (got {value})")
            }
            Self::InvalidMaxIters => write!(f, "max_iters must be at least 1"),
        }
    }
}

impl std::error::Error for SolverError {}

/// Errors specific to a solve call.
#[derive(Debug)]
pub enum SolveError {
    /// The options or the initial guess are invalid.
    Config(SolverError),
    /// The iterate stopped being finite; the run cannot be recovered.
    NumericalDivergence {
        iteration: usize,
        history: Option<History>,
    },
    /// A collective reduction failed.
    Comm(CommError),
}

impl fmt::Display for SolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid configuration: {err}"),
            Self::NumericalDivergence { iteration, .. } => {
                write!(f, "iterate diverged (NaN) at iteration {iteration}")
            }
            Self::Comm(err) => write!(f, "reduction failed: {err}"),
        }
    }
}

impl std::error::Error for SolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Comm(err) => Some(err),
            Self::NumericalDivergence { .. } => None,
        }
    }
}

impl From<SolverError> for SolveError {
    fn from(err: SolverError) -> Self {
        Self::Config(err)
    }
}

impl From<CommError> for SolveError {
    fn from(err: CommError) -> Self {
        Self::Comm(err)
    }
}

/// Options controlling the constrained conjugate-gradient solve.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Maximum number of iterations.
    pub max_iters: usize,
    /// Converge when the active-set residual and the penetration RMS are both <= gtol.
    pub gtol: f64,
    /// Keep mean(x) equal to this value (fixed total load).
    pub mean_value: Option<f64>,
    /// Print the per-iteration table and elapsed time (rank 0 only).
    pub verbose: bool,
    /// Collect the residual and penetration history into the stats.
    pub record_history: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iters: 5000,
            gtol: 1e-8,
            mean_value: None,
            verbose: false,
            record_history: false,
        }
    }
}

impl SolverOptions {
    pub fn validate(&self) -> Result<(), SolverError> {
        if !self.gtol.is_finite() || self.gtol < 0.0 {
            return Err(SolverError::InvalidTolerance { gtol: self.gtol });
        }
        if let Some(value) = self.mean_value {
            if !value.is_finite() || value < 0.0 {
                return Err(SolverError::InvalidMeanValue { value });
            }
        }
        if self.max_iters == 0 {
            return Err(SolverError::InvalidMaxIters);
        }
        Ok(())
    }
}

/// Outcome of [`constrained_conjugate_gradients`].
#[derive(Debug, Clone)]
pub struct CcgResult {
    /// Final iterate.
    pub x: Vec<f64>,
    /// Residual (gradient) of the last iteration.
    pub jacobian: Vec<f64>,
    pub stats: SolverStats,
}

impl CcgResult {
    pub fn success(&self) -> bool {
        self.stats.success()
    }

    pub fn message(&self) -> &'static str {
        self.stats.message()
    }

    pub fn iterations(&self) -> usize {
        self.stats.iterations
    }
}

/// Constrained conjugate-gradient solver for min f(x) subject to x >= 0.
///
/// Owns the iteration state between solves so repeated solves of the same
/// size do not reallocate. Each rank of a distributed run holds its own
/// solver over its partition of `x`.
pub struct CcgSolver<C = SerialComm> {
    comm: C,
    state: Option<CcgState>,
}

enum ReporterSlot<'a> {
    External(&'a mut dyn Reporter),
    Local(StdoutReporter),
    None,
}

impl<'a> ReporterSlot<'a> {
    fn new(reporter: Option<&'a mut dyn Reporter>, verbose: bool) -> Self {
        match reporter {
            Some(r) => Self::External(r),
            None if verbose => Self::Local(StdoutReporter::new()),
            None => Self::None,
        }
    }

    fn as_mut(&mut self) -> Option<&mut dyn Reporter> {
        match self {
            Self::External(r) => Some(*r),
            Self::Local(r) => Some(r),
            Self::None => None,
        }
    }
}

impl CcgSolver<SerialComm> {
    /// Single-process solver.
    pub fn new() -> Self {
        Self::with_comm(SerialComm)
    }
}

impl Default for CcgSolver<SerialComm> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Communicator> CcgSolver<C> {
    /// Solver whose reductions go through `comm`.
    pub fn with_comm(comm: C) -> Self {
        Self { comm, state: None }
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// State left by the last solve, if any.
    pub fn state(&self) -> Option<&CcgState> {
        self.state.as_ref()
    }

    /// Residual of the last iteration of the last solve.
    pub fn residual(&self) -> &[f64] {
        match &self.state {
            Some(state) => state.residual(),
            None => &[],
        }
    }

    /// Solve in place: `x` holds the initial guess on entry and the final
    /// iterate on return.
    pub fn solve<O, H>(
        &mut self,
        objective: &mut O,
        hessp: &mut H,
        x: &mut [f64],
        options: &SolverOptions,
        reporter: Option<&mut dyn Reporter>,
    ) -> Result<SolverStats, SolveError>
    where
        O: Objective + ?Sized,
        H: HessianProduct + ?Sized,
    {
        options.validate()?;
        let state = match self.state.take() {
            Some(mut state) => {
                // `reset` validates before touching the buffers, so a rejected
                // guess leaves the warm state intact.
                if let Err(err) = state.reset(x) {
                    self.state = Some(state);
                    return Err(err.into());
                }
                state
            }
            None => CcgState::new(x)?,
        };
        let state = self.state.insert(state);

        let root = self.comm.rank() == 0;
        let start_time = (options.verbose && root).then(Instant::now);
        let mut reporter = ReporterSlot::new(reporter, options.verbose && root);
        let mut history = options.record_history.then(History::default);

        let mut last: Option<IterationReport> = None;
        let mut status = SolveStatus::MaxIterations;
        while state.iterations() < options.max_iters {
            let report = match step(state, objective, hessp, &self.comm, options.mean_value) {
                Ok(report) => report,
                Err(StepError::Divergence { iteration }) => {
                    finish(&mut reporter, start_time);
                    log::debug!("diverged at iteration {iteration}");
                    return Err(SolveError::NumericalDivergence { iteration, history });
                }
                Err(StepError::Comm(err)) => {
                    finish(&mut reporter, start_time);
                    log::debug!(
                        "reduction failed at iteration {}: {err}",
                        state.iterations() + 1
                    );
                    return Err(SolveError::Comm(err));
                }
            };
            if let Some(history) = history.as_mut() {
                history.push(&report);
            }
            if let Some(reporter) = reporter.as_mut() {
                reporter.on_iteration(&report);
            }
            // The first iteration has no previous G to compare against.
            let converged = report.iteration >= 2
                && report.max_residual <= options.gtol
                && report.rms_penetration <= options.gtol;
            last = Some(report);
            if converged {
                status = SolveStatus::ConvergedGradient;
                break;
            }
        }

        x.copy_from_slice(state.x());
        finish(&mut reporter, start_time);
        let stats = match last {
            Some(report) => SolverStats {
                status,
                iterations: report.iteration,
                energy: report.energy,
                max_residual: report.max_residual,
                rms_penetration: report.rms_penetration,
                alpha: report.alpha,
                history,
            },
            None => SolverStats {
                status,
                iterations: 0,
                energy: f64::NAN,
                max_residual: f64::INFINITY,
                rms_penetration: f64::INFINITY,
                alpha: 0.0,
                history,
            },
        };
        log::debug!("{} after {} iterations", stats.message(), stats.iterations);
        Ok(stats)
    }
}

/// Minimize with the Polonsky-Keer constrained conjugate-gradient method
/// on a single process, starting from `x0`.
pub fn constrained_conjugate_gradients<O, H>(
    objective: &mut O,
    hessp: &mut H,
    x0: &[f64],
    options: &SolverOptions,
) -> Result<CcgResult, SolveError>
where
    O: Objective + ?Sized,
    H: HessianProduct + ?Sized,
{
    let mut solver = CcgSolver::new();
    let mut x = x0.to_vec();
    let stats = solver.solve(objective, hessp, &mut x, options, None)?;
    Ok(CcgResult {
        x,
        jacobian: solver.residual().to_vec(),
        stats,
    })
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.3} s", secs)
    } else if secs >= 1e-3 {
        format!("{:.3} ms", secs * 1e3)
    } else if secs >= 1e-6 {
        format!("{:.3} us", secs * 1e6)
    } else {
        format!("{:.0} ns", secs * 1e9)
    }
}

fn finish(reporter: &mut ReporterSlot<'_>, start_time: Option<Instant>) {
    if let Some(reporter) = reporter.as_mut() {
        reporter.on_finish();
    }
    if let Some(start) = start_time {
        let elapsed = format_duration(start.elapsed());
        emit_line(&format!("time: {elapsed}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::direction_only;

    fn identity(d: &[f64], out: &mut [f64]) {
        out.copy_from_slice(d);
    }

    #[test]
    fn solves_projected_identity() {
        let b = [1.0, -2.0, 3.0, -0.5];
        let mut objective = |x: &[f64], g: &mut [f64]| -> f64 {
            for i in 0..x.len() {
                g[i] = x[i] - b[i];
            }
            0.0
        };
        let mut solver = CcgSolver::new();
        let mut x = [0.0; 4];
        let stats = solver
            .solve(
                &mut objective,
                &mut direction_only(identity),
                &mut x,
                &SolverOptions::default(),
                None,
            )
            .unwrap();
        assert!(stats.success());
        assert_eq!(stats.iterations, 2);
        assert_eq!(x, [1.0, 0.0, 3.0, 0.0]);
        assert_eq!(solver.residual().len(), 4);
    }

    #[test]
    fn rejects_invalid_options_before_evaluating() {
        let mut calls = 0;
        let mut objective = |_x: &[f64], g: &mut [f64]| -> f64 {
            calls += 1;
            g.fill(0.0);
            0.0
        };
        let mut solver = CcgSolver::new();
        let mut x = [1.0];
        for options in [
            SolverOptions {
                gtol: f64::NAN,
                ..SolverOptions::default()
            },
            SolverOptions {
                mean_value: Some(-1.0),
                ..SolverOptions::default()
            },
            SolverOptions {
                max_iters: 0,
                ..SolverOptions::default()
            },
        ] {
            let err = solver
                .solve(
                    &mut objective,
                    &mut direction_only(identity),
                    &mut x,
                    &options,
                    None,
                )
                .unwrap_err();
            assert!(matches!(err, SolveError::Config(_)));
        }
        let err = solver
            .solve(
                &mut objective,
                &mut direction_only(identity),
                &mut [],
                &SolverOptions::default(),
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SolveError::Config(SolverError::EmptyInitialGuess)
        ));
        assert_eq!(calls, 0);
    }

    #[test]
    fn rejected_guess_keeps_warm_state() {
        let mut objective = |x: &[f64], g: &mut [f64]| -> f64 {
            g.copy_from_slice(x);
            0.0
        };
        let mut solver = CcgSolver::new();
        let mut x = [1.0, 2.0];
        solver
            .solve(
                &mut objective,
                &mut direction_only(identity),
                &mut x,
                &SolverOptions::default(),
                None,
            )
            .unwrap();
        let err = solver
            .solve(
                &mut objective,
                &mut direction_only(identity),
                &mut [1.0, f64::NAN],
                &SolverOptions::default(),
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SolveError::Config(SolverError::NonFiniteInitialGuess { index: 1 })
        ));
        let state = solver.state().unwrap();
        assert_eq!(state.len(), 2);
        assert!(state.iterations() > 0);
    }

    #[test]
    fn single_iteration_cap_never_converges() {
        let mut objective = |x: &[f64], g: &mut [f64]| -> f64 {
            g.copy_from_slice(x);
            0.0
        };
        let options = SolverOptions {
            max_iters: 1,
            ..SolverOptions::default()
        };
        let result = constrained_conjugate_gradients(
            &mut objective,
            &mut direction_only(identity),
            &[1.0],
            &options,
        )
        .unwrap();
        assert!(!result.success());
        assert_eq!(result.iterations(), 1);
    }
}
