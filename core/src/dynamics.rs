//! State transition models.
//!
//! The particle filters only ever need the deterministic part of the dynamics,
//! `x' = f(x)`; the additive process noise is sampled separately from the transition
//! covariance. Nonlinear transitions are applied to each particle directly, without any
//! linearization. The Kalman baseline uses [`TransitionModel::matrix`] when the model is linear.

use crate::errors::{FilterError, Result};

use nalgebra::{DMatrix, DVector};

/// Deterministic part of a Markov transition `x_t = f(x_{t-1}) + w_t`.
pub trait TransitionModel: Send + Sync {
    /// State dimension D.
    fn dimension(&self) -> usize;
    /// Apply `f` to a single state.
    fn propagate(&self, state: &DVector<f64>) -> DVector<f64>;
    /// Transition matrix `F` when `f(x) = F x`.
    fn matrix(&self) -> Option<&DMatrix<f64>> {
        None
    }
    /// Apply `f` to every column of a `D × N` matrix of states.
    fn propagate_columns(&self, states: &DMatrix<f64>) -> DMatrix<f64> {
        match self.matrix() {
            Some(f) => f * states,
            None => {
                let mut out = DMatrix::zeros(states.nrows(), states.ncols());
                for (i, column) in states.column_iter().enumerate() {
                    out.set_column(i, &self.propagate(&column.clone_owned()));
                }
                out
            }
        }
    }
}

/// Linear transition `x' = F x`.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearTransition {
    matrix: DMatrix<f64>,
}

impl LinearTransition {
    pub fn new(matrix: DMatrix<f64>) -> Result<Self> {
        if !matrix.is_square() {
            return Err(FilterError::dimension(
                "transition matrix columns",
                matrix.nrows(),
                matrix.ncols(),
            ));
        }
        Ok(LinearTransition { matrix })
    }
    /// Nearly-constant-velocity kinematics for `spatial_dims` axes:
    /// state `[p_1..p_k, v_1..v_k]`, `F = [[I, dt I], [0, I]]`.
    pub fn constant_velocity(spatial_dims: usize, time_step: f64) -> Self {
        let n = 2 * spatial_dims;
        let mut matrix = DMatrix::<f64>::identity(n, n);
        for i in 0..spatial_dims {
            matrix[(i, spatial_dims + i)] = time_step;
        }
        LinearTransition { matrix }
    }
}

impl TransitionModel for LinearTransition {
    fn dimension(&self) -> usize {
        self.matrix.nrows()
    }
    fn propagate(&self, state: &DVector<f64>) -> DVector<f64> {
        &self.matrix * state
    }
    fn matrix(&self) -> Option<&DMatrix<f64>> {
        Some(&self.matrix)
    }
}

/// Arbitrary nonlinear transition given as a closure.
pub struct FnTransition<F> {
    dimension: usize,
    function: F,
}

impl<F> FnTransition<F>
where
    F: Fn(&DVector<f64>) -> DVector<f64> + Send + Sync,
{
    pub fn new(dimension: usize, function: F) -> Self {
        FnTransition {
            dimension,
            function,
        }
    }
}

impl<F> TransitionModel for FnTransition<F>
where
    F: Fn(&DVector<f64>) -> DVector<f64> + Send + Sync,
{
    fn dimension(&self) -> usize {
        self.dimension
    }
    fn propagate(&self, state: &DVector<f64>) -> DVector<f64> {
        (self.function)(state)
    }
}

/// Gas-phase reversible reaction `2A ⇌ B` in a well-mixed reactor, Euler-discretized.
///
/// State `[c_A, c_B]` (partial pressures).
/// ```text
/// c_A' = c_A - dt 2 k1 c_A² + dt 2 k2 c_B
/// c_B' = c_B + dt k1 c_A²   - dt k2 c_B
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReversibleReaction {
    pub forward_rate: f64,
    pub reverse_rate: f64,
    pub time_step: f64,
}

impl Default for ReversibleReaction {
    fn default() -> Self {
        ReversibleReaction {
            forward_rate: 0.16,
            reverse_rate: 0.0064,
            time_step: 0.1,
        }
    }
}

impl TransitionModel for ReversibleReaction {
    fn dimension(&self) -> usize {
        2
    }
    fn propagate(&self, state: &DVector<f64>) -> DVector<f64> {
        let a = state[0];
        let b = state[1];
        let forward = self.forward_rate * a * a;
        let reverse = self.reverse_rate * b;
        DVector::from_vec(vec![
            a - self.time_step * 2.0 * forward + self.time_step * 2.0 * reverse,
            b + self.time_step * forward - self.time_step * reverse,
        ])
    }
}
