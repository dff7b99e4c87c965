//! Bound-constrained conjugate gradients (Polonsky-Keer) for non-negative fields.
//!
//! This crate minimizes a quadratic (or locally quadratic) `f(x)` subject to
//! `x >= 0`, the problem that arises for contact pressures where the bound
//! models non-penetration.
//!
//! How it works (high level):
//! - Clamp `x` to the non-negative orthant; entries with `x > 0` form the active set.
//! - Run a Fletcher-Reeves recurrence on the active set, restarting whenever
//!   the previous step overshot the bound.
//! - Take the exact step length along the direction from a Hessian-vector product.
//! - Entries that hit the bound with a negative gradient are corrected directly
//!   (the "overlap" correction) instead of searching along the step.
//! - Optionally rescale `x` every iteration so that `mean(x)` stays fixed.
//!
//! Calling it:
//! - Implement `Objective` (value and gradient) and `HessianProduct`, or pass
//!   closures; wrap direction-only Hessian products with `direction_only`.
//! - Call `constrained_conjugate_gradients`, or `CcgSolver::solve` to reuse
//!   buffers and to run over a partitioned `x` with a `Communicator`.
//!
//! Example:
//! ```rust,no_run
//! use pk_ccg::{constrained_conjugate_gradients, direction_only, SolverOptions};
//!
//! let b = [1.0, -2.0, 3.0];
//! let mut objective = |x: &[f64], g: &mut [f64]| -> f64 {
//!     let mut energy = 0.0;
//!     for i in 0..x.len() {
//!         g[i] = x[i] - b[i];
//!         energy += 0.5 * x[i] * x[i] - b[i] * x[i];
//!     }
//!     energy
//! };
//! let mut hessp = direction_only(|d: &[f64], out: &mut [f64]| out.copy_from_slice(d));
//!
//! let result = constrained_conjugate_gradients(
//!     &mut objective,
//!     &mut hessp,
//!     &[0.0; 3],
//!     &SolverOptions::default(),
//! )
//! .unwrap();
//! assert!(result.success());
//! ```

mod comm;
mod report;
mod solver;
mod state;
mod step;

pub use comm::{block_range, CommError, Communicator, ReduceOp, SerialComm, ThreadComm};
pub use report::{History, IterationReport, Reporter, SolveStatus, SolverStats, StdoutReporter};
pub use solver::{
    constrained_conjugate_gradients, CcgResult, CcgSolver, SolveError, SolverError, SolverOptions,
};
pub use state::CcgState;
pub use step::{direction_only, step, DirectionOnly, HessianProduct, Objective, StepError};
