//! Observation models.
//!
//! An observation model maps a latent state to the noise-free observation `h(x)`. The
//! particle filter evaluates it on every particle (the "predicted observation") and hands the
//! residual `y - h(x)` to the active likelihood. The same evaluations are kept in the
//! trajectory record so scoring code never has to re-derive `h`.

use crate::errors::{FilterError, Result};
use crate::terrain::dem;

use nalgebra::{DMatrix, DVector};

/// Generic observation model trait for all types of observations
pub trait ObservationModel: Send + Sync {
    /// Observation dimension.
    fn dimension(&self) -> usize;
    /// Minimum state dimension the model reads from.
    fn state_dimension(&self) -> usize;
    /// Noise-free observation of a single state.
    fn expected(&self, state: &DVector<f64>) -> DVector<f64>;
    /// Observation matrix `H` when `h(x) = H x`.
    fn matrix(&self) -> Option<&DMatrix<f64>> {
        None
    }
    /// Evaluate `h` on every column of a `D × N` state matrix, giving an `obs_dim × N` matrix.
    fn expected_columns(&self, states: &DMatrix<f64>) -> DMatrix<f64> {
        match self.matrix() {
            Some(h) => h * states,
            None => {
                let mut out = DMatrix::zeros(self.dimension(), states.ncols());
                for (i, column) in states.column_iter().enumerate() {
                    out.set_column(i, &self.expected(&column.clone_owned()));
                }
                out
            }
        }
    }
}

/// Check that `observation` can be evaluated on states of dimension `state_dim`: a linear model
/// must have exactly `state_dim` columns, and `h(sample)` must have `dimension()` components.
pub fn check_observation_model(
    observation: &dyn ObservationModel,
    state_dim: usize,
    sample: &DVector<f64>,
) -> Result<()> {
    if observation.state_dimension() > state_dim {
        return Err(FilterError::dimension(
            "observation model state",
            state_dim,
            observation.state_dimension(),
        ));
    }
    if let Some(h) = observation.matrix()
        && h.ncols() != state_dim
    {
        return Err(FilterError::dimension("observation matrix columns", state_dim, h.ncols()));
    }
    if sample.len() != state_dim {
        return Err(FilterError::dimension("state", state_dim, sample.len()));
    }
    let expected = observation.expected(sample).len();
    if expected != observation.dimension() {
        return Err(FilterError::dimension(
            "observation model output",
            observation.dimension(),
            expected,
        ));
    }
    Ok(())
}

/// Linear observation `y = H x`.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearObservation {
    matrix: DMatrix<f64>,
}

impl LinearObservation {
    pub fn new(matrix: DMatrix<f64>) -> Result<Self> {
        if matrix.nrows() == 0 || matrix.ncols() == 0 {
            return Err(FilterError::dimension("observation matrix", 1, 0));
        }
        Ok(LinearObservation { matrix })
    }
    /// Observe the first `observed` components of a `state_dim` state directly
    /// (`H = [I 0]`).
    pub fn leading_components(observed: usize, state_dim: usize) -> Self {
        LinearObservation {
            matrix: DMatrix::identity(observed, state_dim),
        }
    }
}

impl ObservationModel for LinearObservation {
    fn dimension(&self) -> usize {
        self.matrix.nrows()
    }
    fn state_dimension(&self) -> usize {
        self.matrix.ncols()
    }
    fn expected(&self, state: &DVector<f64>) -> DVector<f64> {
        &self.matrix * state
    }
    fn matrix(&self) -> Option<&DMatrix<f64>> {
        Some(&self.matrix)
    }
}

/// Radar-altimeter style terrain observation: height above ground, `z - DEM(x, y)`.
///
/// Reads state components `[x, y, z]` in meters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TerrainObservation;

impl ObservationModel for TerrainObservation {
    fn dimension(&self) -> usize {
        1
    }
    fn state_dimension(&self) -> usize {
        3
    }
    fn expected(&self, state: &DVector<f64>) -> DVector<f64> {
        DVector::from_element(1, state[2] - dem(state[0], state[1]))
    }
}

/// Total pressure of the reactor, `c_A + c_B`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TotalPressureObservation;

impl ObservationModel for TotalPressureObservation {
    fn dimension(&self) -> usize {
        1
    }
    fn state_dimension(&self) -> usize {
        2
    }
    fn expected(&self, state: &DVector<f64>) -> DVector<f64> {
        DVector::from_element(1, state[0] + state[1])
    }
}

/// Arbitrary observation function given as a closure.
pub struct FnObservation<F> {
    dimension: usize,
    state_dimension: usize,
    function: F,
}

impl<F> FnObservation<F>
where
    F: Fn(&DVector<f64>) -> DVector<f64> + Send + Sync,
{
    pub fn new(dimension: usize, state_dimension: usize, function: F) -> Self {
        FnObservation {
            dimension,
            state_dimension,
            function,
        }
    }
}

impl<F> ObservationModel for FnObservation<F>
where
    F: Fn(&DVector<f64>) -> DVector<f64> + Send + Sync,
{
    fn dimension(&self) -> usize {
        self.dimension
    }
    fn state_dimension(&self) -> usize {
        self.state_dimension
    }
    fn expected(&self, state: &DVector<f64>) -> DVector<f64> {
        (self.function)(state)
    }
}
