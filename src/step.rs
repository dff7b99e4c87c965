use core::fmt;

use crate::comm::{CommError, Communicator, ReduceOp};
use crate::report::IterationReport;
use crate::state::CcgState;

/// Objective whose gradient drives the iteration.
///
/// In contact problems the gradient is the surface gap for a pressure field `x`.
/// On a partitioned run each rank sees its own slice of `x`, fills the matching
/// slice of the gradient and returns its share of the energy; the shares are
/// summed across ranks.
pub trait Objective {
    /// Fill `gradient` at `x` and return the objective value.
    fn evaluate(&mut self, x: &[f64], gradient: &mut [f64]) -> f64;
}

impl<F> Objective for F
where
    F: FnMut(&[f64], &mut [f64]) -> f64,
{
    fn evaluate(&mut self, x: &[f64], gradient: &mut [f64]) -> f64 {
        self(x, gradient)
    }
}

/// Hessian-vector product of the objective.
pub trait HessianProduct {
    /// Fill `product` with `H(x) * direction`.
    fn apply(&mut self, x: &[f64], direction: &[f64], product: &mut [f64]);
}

impl<F> HessianProduct for F
where
    F: FnMut(&[f64], &[f64], &mut [f64]),
{
    fn apply(&mut self, x: &[f64], direction: &[f64], product: &mut [f64]) {
        self(x, direction, product)
    }
}

/// Adapter for Hessian products that do not depend on the iterate.
#[derive(Debug, Clone, Copy)]
pub struct DirectionOnly<F>(pub F);

impl<F> HessianProduct for DirectionOnly<F>
where
    F: FnMut(&[f64], &mut [f64]),
{
    fn apply(&mut self, _x: &[f64], direction: &[f64], product: &mut [f64]) {
        (self.0)(direction, product)
    }
}

/// Wrap a direction-only Hessian product, e.g. a constant influence matrix.
pub fn direction_only<F>(f: F) -> DirectionOnly<F>
where
    F: FnMut(&[f64], &mut [f64]),
{
    DirectionOnly(f)
}

/// Errors that abort a step.
#[derive(Debug, Clone)]
pub enum StepError {
    /// The iterate contains NaN or infinite entries.
    Divergence { iteration: usize },
    /// A collective reduction failed.
    Comm(CommError),
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Divergence { iteration } => {
                write!(f, "iterate is not finite after iteration {iteration}")
            }
            Self::Comm(err) => write!(f, "reduction failed: {err}"),
        }
    }
}

impl std::error::Error for StepError {}

impl From<CommError> for StepError {
    fn from(err: CommError) -> Self {
        Self::Comm(err)
    }
}

/// Perform one Polonsky-Keer constrained conjugate-gradient step.
///
/// Calls `objective` once and `hessp` at most once. Every global scalar is
/// reduced through `comm`, so all ranks holding a partition of `x` take the
/// same branches. On return every entry of `state.x` is non-negative and
/// `state.direction` is zero outside the active set the step started from.
pub fn step<O, H, C>(
    state: &mut CcgState,
    objective: &mut O,
    hessp: &mut H,
    comm: &C,
    mean_value: Option<f64>,
) -> Result<IterationReport, StepError>
where
    O: Objective + ?Sized,
    H: HessianProduct + ?Sized,
    C: Communicator + ?Sized,
{
    let iteration = state.iterations + 1;
    let restarted = !state.conjugate;
    let x = &mut state.x[..];
    let direction = &mut state.direction[..];
    let residual = &mut state.residual[..];
    let hess_dir = &mut state.hess_dir[..];
    let probe = &mut state.probe[..];

    project(x);
    let energy = objective.evaluate(x, residual);

    let active_local = x.iter().filter(|&&v| v > 0.0).count();
    let inactive_local = x.len() - active_local;
    if mean_value.is_some() {
        let mut global = [0.0; 2];
        comm.all_reduce(
            &[masked_sum(x, residual), active_local as f64],
            &mut global,
            ReduceOp::Sum,
        )?;
        subtract_mean(residual, global[0], global[1]);
    }
    let release_local = count_release(x, residual);
    let bad_residual_local = residual.iter().filter(|v| !v.is_finite()).count();

    let mut global = [0.0; 6];
    comm.all_reduce(
        &[
            masked_dot(x, residual, residual),
            active_local as f64,
            inactive_local as f64,
            release_local as f64,
            bad_residual_local as f64,
            energy,
        ],
        &mut global,
        ReduceOp::Sum,
    )?;
    let [g, active, inactive, release, bad_residual, energy] = global;
    // A NaN on a bound entry never reaches `x`, so check the residual itself.
    if bad_residual > 0.0 {
        state.iterations = iteration;
        return Err(StepError::Divergence { iteration });
    }

    let mut extremes = [0.0; 2];
    comm.all_reduce(&local_extremes(x, residual), &mut extremes, ReduceOp::Max)?;
    let max_residual = if active > 0.0 { extremes[0] } else { extremes[1] };

    let beta = if state.conjugate && state.g_old > 0.0 {
        g / state.g_old
    } else {
        0.0
    };
    for ((d, &xi), &ri) in direction.iter_mut().zip(x.iter()).zip(residual.iter()) {
        *d = if xi > 0.0 { -ri + beta * *d } else { 0.0 };
    }
    state.g_old = g;

    let rms_penetration = if inactive > 0.0 {
        (g / inactive).sqrt()
    } else {
        g.sqrt()
    };

    let alpha = if active > 0.0 {
        hessp.apply(x, direction, hess_dir);
        if mean_value.is_some() {
            let mut global = [0.0; 1];
            comm.all_reduce(&[masked_sum(x, hess_dir)], &mut global, ReduceOp::Sum)?;
            subtract_mean(hess_dir, global[0], active);
        }
        let mut global = [0.0; 2];
        comm.all_reduce(
            &[
                masked_dot(x, residual, direction),
                masked_dot(x, hess_dir, direction),
            ],
            &mut global,
            ReduceOp::Sum,
        )?;
        step_length(global[0], global[1])
    } else if release > 0.0 {
        // Nothing is active: probe along steepest descent on the entries
        // the overlap correction is about to release.
        for ((p, &xi), &ri) in probe.iter_mut().zip(x.iter()).zip(residual.iter()) {
            *p = if xi <= 0.0 && ri < 0.0 { -ri } else { 0.0 };
        }
        hessp.apply(x, probe, hess_dir);
        let mut num = 0.0;
        let mut den = 0.0;
        for ((&p, &ri), &hp) in probe.iter().zip(residual.iter()).zip(hess_dir.iter()) {
            num += ri * p;
            den += hp * p;
        }
        let mut global = [0.0; 2];
        comm.all_reduce(&[num, den], &mut global, ReduceOp::Sum)?;
        step_length(global[0], global[1])
    } else {
        0.0
    };
    if alpha < 0.0 {
        log::warn!(
            "it {iteration}: hessian is negative along the descent direction (alpha = {alpha:.3e})"
        );
    }

    let mut overlap_local = 0usize;
    for ((xi, &d), &ri) in x.iter_mut().zip(direction.iter()).zip(residual.iter()) {
        if *xi > 0.0 {
            *xi += alpha * d;
        }
        if *xi <= 0.0 {
            *xi = 0.0;
            if ri < 0.0 {
                *xi -= alpha * ri;
                if *xi < 0.0 {
                    *xi = 0.0;
                }
                overlap_local += 1;
            }
        }
    }

    let non_finite_local = x.iter().filter(|v| !v.is_finite()).count();
    let mut global = [0.0; 4];
    comm.all_reduce(
        &[
            overlap_local as f64,
            x.iter().sum::<f64>(),
            non_finite_local as f64,
            x.len() as f64,
        ],
        &mut global,
        ReduceOp::Sum,
    )?;
    let [overlap, total, non_finite, len] = global;
    state.conjugate = overlap == 0.0;
    state.alpha = alpha;
    state.iterations = iteration;
    if non_finite > 0.0 {
        return Err(StepError::Divergence { iteration });
    }

    if let Some(target) = mean_value {
        let mean = total / len;
        if mean > 0.0 {
            let scale = target / mean;
            if !scale.is_finite() {
                return Err(StepError::Divergence { iteration });
            }
            x.iter_mut().for_each(|v| *v *= scale);
        } else {
            x.fill(target);
        }
    }

    let report = IterationReport {
        iteration,
        energy,
        max_residual,
        rms_penetration,
        conjugate_norm: g,
        alpha,
        active: active as usize,
        overlap: overlap as usize,
        restarted,
    };
    log::debug!(
        "it {iteration}: G = {g:.3e}, max res = {max_residual:.3e}, rms pen = {rms_penetration:.3e}, alpha = {alpha:.3e}, overlap = {}",
        report.overlap
    );
    Ok(report)
}

fn project(x: &mut [f64]) {
    for v in x.iter_mut() {
        if *v <= 0.0 {
            *v = 0.0;
        }
    }
}

fn step_length(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        -num / den
    }
}

// Inactive entries with negative residual.
fn count_release(x: &[f64], residual: &[f64]) -> usize {
    x.iter()
        .zip(residual.iter())
        .filter(|&(&xi, &ri)| xi <= 0.0 && ri < 0.0)
        .count()
}

fn masked_sum(x: &[f64], values: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (&xi, &v) in x.iter().zip(values.iter()) {
        if xi > 0.0 {
            sum += v;
        }
    }
    sum
}

fn masked_dot(x: &[f64], a: &[f64], b: &[f64]) -> f64 {
    let mut sum = 0.0;
    for ((&xi, &ai), &bi) in x.iter().zip(a.iter()).zip(b.iter()) {
        if xi > 0.0 {
            sum += ai * bi;
        }
    }
    sum
}

fn subtract_mean(values: &mut [f64], sum: f64, count: f64) {
    if count > 0.0 {
        let mean = sum / count;
        values.iter_mut().for_each(|v| *v -= mean);
    }
}

// [max |r| over active entries, max -r over inactive entries with r < 0]
fn local_extremes(x: &[f64], residual: &[f64]) -> [f64; 2] {
    let mut active_max = 0.0f64;
    let mut release_max = 0.0f64;
    for (&xi, &ri) in x.iter().zip(residual.iter()) {
        if xi > 0.0 {
            let v = ri.abs();
            if v.is_nan() || v > active_max {
                active_max = v;
            }
        } else if ri < 0.0 && -ri > release_max {
            release_max = -ri;
        }
    }
    [active_max, release_max]
}
