use crate::solver::SolverError;

/// Iteration state of the constrained conjugate-gradient method.
///
/// Holds the iterate, the descent direction and the scalars that carry
/// over between steps. The residual and Hessian-product buffers are
/// workspace; the residual of the last step stays readable through
/// [`CcgState::residual`].
#[derive(Debug, Clone)]
pub struct CcgState {
    pub(crate) x: Vec<f64>,
    pub(crate) direction: Vec<f64>,
    pub(crate) residual: Vec<f64>,
    pub(crate) hess_dir: Vec<f64>,
    pub(crate) probe: Vec<f64>,
    pub(crate) g_old: f64,
    pub(crate) conjugate: bool,
    pub(crate) alpha: f64,
    pub(crate) iterations: usize,
}

impl CcgState {
    /// Start from `x0`; the first step is a steepest-descent step.
    pub fn new(x0: &[f64]) -> Result<Self, SolverError> {
        validate_initial(x0)?;
        let n = x0.len();
        Ok(Self {
            x: x0.to_vec(),
            direction: vec![0.0; n],
            residual: vec![0.0; n],
            hess_dir: vec![0.0; n],
            probe: vec![0.0; n],
            g_old: 1.0,
            conjugate: false,
            alpha: 0.0,
            iterations: 0,
        })
    }

    /// Re-initialize from `x0`, reusing buffers when the length is unchanged.
    pub fn reset(&mut self, x0: &[f64]) -> Result<(), SolverError> {
        validate_initial(x0)?;
        let n = x0.len();
        self.x.clear();
        self.x.extend_from_slice(x0);
        for buf in [
            &mut self.direction,
            &mut self.residual,
            &mut self.hess_dir,
            &mut self.probe,
        ] {
            buf.clear();
            buf.resize(n, 0.0);
        }
        self.g_old = 1.0;
        self.conjugate = false;
        self.alpha = 0.0;
        self.iterations = 0;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn direction(&self) -> &[f64] {
        &self.direction
    }

    /// Residual (gradient) evaluated by the last step, after any mean correction.
    pub fn residual(&self) -> &[f64] {
        &self.residual
    }

    pub fn g_old(&self) -> f64 {
        self.g_old
    }

    /// Whether the next direction continues the conjugate recurrence.
    pub fn is_conjugate(&self) -> bool {
        self.conjugate
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn into_x(self) -> Vec<f64> {
        self.x
    }
}

fn validate_initial(x0: &[f64]) -> Result<(), SolverError> {
    if x0.is_empty() {
        return Err(SolverError::EmptyInitialGuess);
    }
    if let Some(index) = x0.iter().position(|v| !v.is_finite()) {
        return Err(SolverError::NonFiniteInitialGuess { index });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_restart_and_unit_g_old() {
        let state = CcgState::new(&[0.5, -1.0, 2.0]).unwrap();
        assert_eq!(state.x(), &[0.5, -1.0, 2.0]);
        assert_eq!(state.direction(), &[0.0; 3]);
        assert_eq!(state.g_old(), 1.0);
        assert!(!state.is_conjugate());
        assert_eq!(state.iterations(), 0);
    }

    #[test]
    fn rejects_missing_or_bad_initial_guess() {
        assert!(matches!(
            CcgState::new(&[]),
            Err(SolverError::EmptyInitialGuess)
        ));
        assert!(matches!(
            CcgState::new(&[1.0, f64::NAN]),
            Err(SolverError::NonFiniteInitialGuess { index: 1 })
        ));
    }

    #[test]
    fn reset_resizes_and_clears() {
        let mut state = CcgState::new(&[1.0, 2.0]).unwrap();
        state.direction[0] = 3.0;
        state.conjugate = true;
        state.g_old = 7.0;
        state.iterations = 4;
        state.reset(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(state.len(), 3);
        assert_eq!(state.direction(), &[0.0; 3]);
        assert_eq!(state.residual().len(), 3);
        assert!(!state.is_conjugate());
        assert_eq!(state.g_old(), 1.0);
        assert_eq!(state.iterations(), 0);
    }
}
