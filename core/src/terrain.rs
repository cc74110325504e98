//! Synthetic terrain used by the terrain-aided navigation (TAN) model.
//!
//! The digital elevation model (DEM) is the classic `peaks` surface plus a sum of sinusoidal
//! ridges, evaluated on coordinates compressed by [`DEM_SCALE`] so that a trajectory of a few
//! tens of kilometres crosses several hills. Heights are in meters.

/// Coordinate compression applied before evaluating the surface (1/m).
pub const DEM_SCALE: f64 = 3.0 / 2.96e4;

const RIDGE_AMPLITUDES: [f64; 6] = [300.0, 80.0, 60.0, 40.0, 20.0, 10.0];
const RIDGE_FREQUENCIES_X: [f64; 6] = [5.0, 10.0, 20.0, 30.0, 80.0, 150.0];
const RIDGE_FREQUENCIES_Y: [f64; 6] = [4.0, 10.0, 20.0, 40.0, 90.0, 150.0];

/// The `peaks` test surface, scaled to a 200 m relief.
///
/// $$
/// 200 \left[ 3(1-x)^2 e^{-x^2-(y+1)^2} - 10\left(\frac{x}{5} - x^3 - y^5\right)e^{-x^2-y^2}
///   - \frac{1}{3} e^{-(x+1)^2 - y^2} \right]
/// $$
pub fn peaks(x: f64, y: f64) -> f64 {
    let first = 3.0 * (1.0 - x).powi(2) * (-(x * x) - (y + 1.0).powi(2)).exp();
    let second = -10.0 * (x / 5.0 - x.powi(3) - y.powi(5)) * (-(x * x) - y * y).exp();
    let third = -(1.0 / 3.0) * (-(x + 1.0).powi(2) - y * y).exp();
    200.0 * (first + second + third)
}

/// Terrain height at horizontal position `(x, y)` in meters.
pub fn dem(x: f64, y: f64) -> f64 {
    let qx = DEM_SCALE * x;
    let qy = DEM_SCALE * y;
    let ridges: f64 = RIDGE_AMPLITUDES
        .iter()
        .zip(RIDGE_FREQUENCIES_X.iter().zip(RIDGE_FREQUENCIES_Y.iter()))
        .map(|(a, (wx, wy))| a * (wx * qx).sin() * (wy * qy).cos())
        .sum();
    peaks(qx, qy) + ridges
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn peaks_matches_reference_values() {
        // peaks(0, 0) = 200 * (3 e^{-1} - e^{-1} / 3)
        let expected = 200.0 * (3.0 * (-1.0_f64).exp() - (-1.0_f64).exp() / 3.0);
        assert_approx_eq!(peaks(0.0, 0.0), expected, 1e-9);
        assert!(peaks(10.0, 10.0).abs() < 1e-6);
    }

    #[test]
    fn dem_is_bounded_and_smooth() {
        let mut previous = dem(-3000.0, -19200.0);
        for k in 1..1000 {
            let x = -3000.0 + 21.15 * k as f64;
            let y = -19200.0 + 21.53 * k as f64;
            let h = dem(x, y);
            assert!(h.is_finite());
            assert!(h.abs() < 2500.0, "terrain height {h} out of range");
            assert!((h - previous).abs() < 100.0, "terrain jumped at step {k}");
            previous = h;
        }
    }
}
