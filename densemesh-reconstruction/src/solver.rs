//! Matrix-free conjugate gradient solver

use crate::parallel::deterministic_dot;
use densemesh_core::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A symmetric positive definite operator applied without forming a matrix
pub trait LinearOperator: Sync {
    /// Number of unknowns
    fn dim(&self) -> usize;

    /// Compute `y = A x`
    fn apply(&self, x: &[f64], y: &mut [f64]);
}

/// Termination criteria for conjugate gradient
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    pub max_iterations: usize,
    /// Stop once `|r| <= tolerance * |b|`
    pub tolerance: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-7,
        }
    }
}

/// Outcome of a solve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveReport {
    pub iterations: usize,
    pub relative_residual: f64,
    pub converged: bool,
}

fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    y.par_iter_mut().zip(x.par_iter()).for_each(|(yi, xi)| *yi += alpha * xi);
}

/// Solve `A x = b` by conjugate gradient, starting from the contents of `x`.
///
/// Reaching `max_iterations` is not an error; the report says whether the
/// tolerance was met. A non-positive curvature or a non-finite residual is.
pub fn conjugate_gradient<A: LinearOperator>(
    op: &A,
    b: &[f64],
    x: &mut [f64],
    settings: &SolverSettings,
) -> Result<SolveReport> {
    let n = op.dim();
    if b.len() != n || x.len() != n {
        return Err(Error::InvalidData(format!(
            "system of dimension {} given rhs of length {} and guess of length {}",
            n,
            b.len(),
            x.len()
        )));
    }

    let bb = deterministic_dot(b, b);
    if bb == 0.0 {
        x.par_iter_mut().for_each(|v| *v = 0.0);
        return Ok(SolveReport {
            iterations: 0,
            relative_residual: 0.0,
            converged: true,
        });
    }

    let mut r = vec![0.0; n];
    op.apply(x, &mut r);
    r.par_iter_mut().zip(b.par_iter()).for_each(|(ri, bi)| *ri = bi - *ri);
    let mut p = r.clone();
    let mut ap = vec![0.0; n];
    let mut rr = deterministic_dot(&r, &r);
    let threshold = settings.tolerance * settings.tolerance * bb;

    let mut iterations = 0;
    while iterations < settings.max_iterations && rr > threshold {
        op.apply(&p, &mut ap);
        let pap = deterministic_dot(&p, &ap);
        if !(pap.is_finite() && pap > 0.0) {
            return Err(Error::Reconstruction(format!(
                "conjugate gradient broke down at iteration {} (p.Ap = {})",
                iterations, pap
            )));
        }
        let alpha = rr / pap;
        axpy(alpha, &p, x);
        axpy(-alpha, &ap, &mut r);

        let rr_next = deterministic_dot(&r, &r);
        if !rr_next.is_finite() {
            return Err(Error::Reconstruction(
                "conjugate gradient residual is not finite".to_string(),
            ));
        }
        let beta = rr_next / rr;
        rr = rr_next;
        p.par_iter_mut().zip(r.par_iter()).for_each(|(pi, ri)| *pi = ri + beta * *pi);
        iterations += 1;
    }

    Ok(SolveReport {
        iterations,
        relative_residual: (rr / bb).sqrt(),
        converged: rr <= threshold,
    })
}
