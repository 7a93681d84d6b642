//! EigenTrust power iteration.
//!
//! ```text
//! t_{k+1} = alpha * C^T * t_k + (1 - alpha) * p
//! ```
//!
//! Iteration stops when the L1 distance between successive vectors drops
//! below the convergence threshold or the iteration cap is hit. The result
//! is always renormalized to sum to 1.

use crate::graph::TrustGraph;

/// Iteration parameters.
#[derive(Debug, Clone, Copy)]
pub struct IterationParams {
    /// Damping factor (alpha)
    pub damping: f64,
    pub convergence_threshold: f64,
    pub max_iterations: usize,
}

impl Default for IterationParams {
    fn default() -> Self {
        Self {
            damping: 0.85,
            convergence_threshold: 1e-6,
            max_iterations: 100,
        }
    }
}

/// Result of one power iteration run.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    /// Global trust, indexed like the graph's agents; sums to 1
    pub scores: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
    /// L1 distance of the last step
    pub residual: f64,
}

/// Run power iteration over `graph`.
///
/// `prior` is the teleport distribution `p` and `initial` the warm-start
/// vector `t_0`; both must have one entry per agent. Either is
/// renormalized before use, falling back to uniform if it carries no mass.
pub fn power_iterate(
    graph: &TrustGraph,
    prior: &[f64],
    initial: &[f64],
    params: IterationParams,
) -> IterationOutcome {
    let n = graph.len();
    if n == 0 {
        return IterationOutcome {
            scores: Vec::new(),
            iterations: 0,
            converged: true,
            residual: 0.0,
        };
    }

    let prior = normalized_or_uniform(prior, n);
    let mut scores = normalized_or_uniform(initial, n);
    let alpha = params.damping;
    let mut residual = f64::INFINITY;
    let mut iterations = 0;

    while iterations < params.max_iterations {
        iterations += 1;

        // Dangling rows spread their mass uniformly
        let dangling_mass: f64 = (0..n)
            .filter(|&i| graph.row(i).is_none())
            .map(|i| scores[i])
            .sum();

        let mut next = vec![alpha * dangling_mass / n as f64; n];
        for (i, &t_i) in scores.iter().enumerate() {
            if let Some(row) = graph.row(i) {
                for (&j, &c_ij) in row {
                    next[j] += alpha * c_ij * t_i;
                }
            }
        }
        for (value, p) in next.iter_mut().zip(&prior) {
            *value += (1.0 - alpha) * p;
        }
        normalize(&mut next);

        residual = scores
            .iter()
            .zip(&next)
            .map(|(a, b)| (a - b).abs())
            .sum();
        scores = next;

        if residual < params.convergence_threshold {
            break;
        }
    }

    IterationOutcome {
        converged: residual < params.convergence_threshold,
        scores,
        iterations,
        residual,
    }
}

fn normalize(values: &mut [f64]) {
    let total: f64 = values.iter().sum();
    if total > 0.0 && total.is_finite() {
        for v in values.iter_mut() {
            *v /= total;
        }
    }
}

fn normalized_or_uniform(values: &[f64], n: usize) -> Vec<f64> {
    let valid = values.len() == n && values.iter().all(|v| v.is_finite() && *v >= 0.0);
    let total: f64 = if valid { values.iter().sum() } else { 0.0 };
    if total > 0.0 {
        values.iter().map(|v| v / total).collect()
    } else {
        vec![1.0 / n as f64; n]
    }
}
