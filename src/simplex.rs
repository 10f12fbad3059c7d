//! Downhill simplex (Nelder-Mead) minimization.
//!
//! Derivative-free minimizer for the flux/position objective, which is far
//! too expensive and noisy for gradient methods: each evaluation runs an
//! injection and a full PSF subtraction. Standard reflection, expansion,
//! contraction and shrink steps over an n+1 point simplex.

use tracing::{debug, info};

use crate::error::{PipelineError, Result};

const RHO: f64 = 1.0;
const CHI: f64 = 2.0;
const PSI: f64 = 0.5;
const SIGMA: f64 = 0.5;

/// Relative step used to build the initial simplex from the starting point.
const NONZERO_DELTA: f64 = 0.05;
/// Absolute step for coordinates that start at zero.
const ZERO_DELTA: f64 = 0.00025;

/// Nelder-Mead configuration.
#[derive(Debug, Clone)]
pub struct NelderMead {
    /// Convergence threshold on the simplex extent: the search stops when
    /// every vertex is within this distance of the best one, per coordinate.
    pub x_tolerance: f64,
    pub max_iterations: usize,
}

/// Outcome of a simplex minimization.
#[derive(Debug, Clone)]
pub struct SimplexResult {
    /// Best vertex found.
    pub x: Vec<f64>,
    /// Objective value at the best vertex.
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            x_tolerance: 1e-4,
            max_iterations: 200,
        }
    }
}

impl NelderMead {
    /// Minimize `objective` starting from `initial`.
    ///
    /// The objective is fallible; any error aborts the search and is
    /// propagated to the caller.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty starting point or a
    /// non-positive tolerance, and forwards objective failures.
    pub fn minimize<F>(&self, initial: &[f64], mut objective: F) -> Result<SimplexResult>
    where
        F: FnMut(&[f64]) -> Result<f64>,
    {
        if initial.is_empty() {
            return Err(PipelineError::configuration(
                "simplex minimization needs at least one parameter",
            ));
        }
        if self.x_tolerance <= 0.0 {
            return Err(PipelineError::configuration(
                "simplex tolerance must be positive",
            ));
        }

        let dim = initial.len();

        // Initial simplex: the starting point plus one perturbed copy per
        // coordinate.
        let mut vertices: Vec<Vec<f64>> = Vec::with_capacity(dim + 1);
        vertices.push(initial.to_vec());
        for k in 0..dim {
            let mut vertex = initial.to_vec();
            if vertex[k] != 0.0 {
                vertex[k] *= 1.0 + NONZERO_DELTA;
            } else {
                vertex[k] = ZERO_DELTA;
            }
            vertices.push(vertex);
        }

        let mut costs: Vec<f64> = Vec::with_capacity(dim + 1);
        for vertex in &vertices {
            costs.push(objective(vertex)?);
        }

        let mut iterations = 0;
        let mut converged = false;
        while iterations < self.max_iterations {
            sort_simplex(&mut vertices, &mut costs);

            if simplex_extent(&vertices) <= self.x_tolerance {
                converged = true;
                break;
            }
            iterations += 1;

            // Centroid of all vertices except the worst.
            let mut centroid = vec![0.0; dim];
            for vertex in &vertices[..dim] {
                for (c, v) in centroid.iter_mut().zip(vertex) {
                    *c += v / dim as f64;
                }
            }

            let worst = dim;
            let reflected = blend(&centroid, &vertices[worst], 1.0 + RHO, -RHO);
            let reflected_cost = objective(&reflected)?;

            if reflected_cost < costs[0] {
                let expanded = blend(&centroid, &vertices[worst], 1.0 + RHO * CHI, -RHO * CHI);
                let expanded_cost = objective(&expanded)?;
                if expanded_cost < reflected_cost {
                    vertices[worst] = expanded;
                    costs[worst] = expanded_cost;
                } else {
                    vertices[worst] = reflected;
                    costs[worst] = reflected_cost;
                }
            } else if reflected_cost < costs[dim - 1] {
                vertices[worst] = reflected;
                costs[worst] = reflected_cost;
            } else {
                let shrink = if reflected_cost < costs[worst] {
                    // Outside contraction.
                    let contracted =
                        blend(&centroid, &vertices[worst], 1.0 + PSI * RHO, -PSI * RHO);
                    let contracted_cost = objective(&contracted)?;
                    if contracted_cost <= reflected_cost {
                        vertices[worst] = contracted;
                        costs[worst] = contracted_cost;
                        false
                    } else {
                        true
                    }
                } else {
                    // Inside contraction.
                    let contracted = blend(&centroid, &vertices[worst], 1.0 - PSI, PSI);
                    let contracted_cost = objective(&contracted)?;
                    if contracted_cost < costs[worst] {
                        vertices[worst] = contracted;
                        costs[worst] = contracted_cost;
                        false
                    } else {
                        true
                    }
                };

                if shrink {
                    let best = vertices[0].clone();
                    for j in 1..=dim {
                        for (v, b) in vertices[j].iter_mut().zip(&best) {
                            *v = b + SIGMA * (*v - b);
                        }
                        costs[j] = objective(&vertices[j])?;
                    }
                }
            }

            debug!(
                iteration = iterations,
                best_cost = costs[0],
                "simplex step"
            );
        }

        sort_simplex(&mut vertices, &mut costs);
        info!(
            iterations,
            converged,
            cost = costs[0],
            "simplex minimization finished"
        );

        Ok(SimplexResult {
            x: vertices.swap_remove(0),
            cost: costs[0],
            iterations,
            converged,
        })
    }
}

/// `a * centroid + b * vertex`, element-wise.
fn blend(centroid: &[f64], vertex: &[f64], a: f64, b: f64) -> Vec<f64> {
    centroid
        .iter()
        .zip(vertex)
        .map(|(c, v)| a * c + b * v)
        .collect()
}

fn sort_simplex(vertices: &mut [Vec<f64>], costs: &mut [f64]) {
    let mut order: Vec<usize> = (0..costs.len()).collect();
    order.sort_by(|&a, &b| costs[a].total_cmp(&costs[b]));

    let sorted_vertices: Vec<Vec<f64>> = order.iter().map(|&i| vertices[i].clone()).collect();
    let sorted_costs: Vec<f64> = order.iter().map(|&i| costs[i]).collect();
    vertices.clone_from_slice(&sorted_vertices);
    costs.copy_from_slice(&sorted_costs);
}

/// Largest coordinate distance of any vertex from the best one.
fn simplex_extent(vertices: &[Vec<f64>]) -> f64 {
    let best = &vertices[0];
    vertices[1..]
        .iter()
        .flat_map(|vertex| vertex.iter().zip(best).map(|(v, b)| (v - b).abs()))
        .fold(0.0, f64::max)
}
