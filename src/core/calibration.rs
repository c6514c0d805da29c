use std::path::Path;

use itertools::Itertools;
use ordered_float::OrderedFloat;

use crate::{prelude::*, quantity::Watts};

/// Degree of the fitted command-percent → watts polynomial.
const DEGREE: usize = 5;

/// Resolution of the inverse lookup table, in percent.
const PERCENT_STEP: f64 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("failed to read the calibration file")]
    Io(#[source] std::io::Error),

    #[error("malformed calibration record: {0:?}")]
    Malformed(csv::ErrorKind),

    #[error("{0} calibration samples are not enough, need at least {min}", min = DEGREE + 1)]
    NotEnoughSamples(usize),
}

impl From<csv::Error> for CalibrationError {
    fn from(error: csv::Error) -> Self {
        match error.into_kind() {
            csv::ErrorKind::Io(error) => Self::Io(error),
            kind => Self::Malformed(kind),
        }
    }
}

/// Power response of a dimmer-driven load.
///
/// Fitted once at startup from the `(percent; watts)` samples collected by the
/// one-shot calibration run, and used in both directions afterwards: the
/// polynomial maps a duty-cycle percentage to the measured power draw, and the
/// discretized lookup table answers the inverse question when the allocator
/// needs a command for a wanted wattage.
pub struct CalibrationCurve {
    /// Polynomial coefficients over `percent / 100`, constant term first.
    coefficients: [f64; DEGREE + 1],

    /// Fitted watts at every [`PERCENT_STEP`] from 0 % to 100 %, ascending.
    lookup: Vec<f64>,
}

impl CalibrationCurve {
    /// Read `percent;watts` samples and fit the curve.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn from_csv_file(path: &Path) -> Result<Self, CalibrationError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let samples = reader
            .deserialize::<(f64, f64)>()
            .collect::<Result<Vec<_>, csv::Error>>()?;
        Self::from_samples(samples)
    }

    pub fn from_samples(mut samples: Vec<(f64, f64)>) -> Result<Self, CalibrationError> {
        if samples.len() <= DEGREE {
            return Err(CalibrationError::NotEnoughSamples(samples.len()));
        }
        samples.sort_by_key(|(percent, _)| OrderedFloat(*percent));

        let coefficients = fit(&samples);
        let n_steps = (100.0 / PERCENT_STEP) as usize;
        let lookup: Vec<f64> = (0..=n_steps)
            .map(|step| evaluate(&coefficients, step as f64 * PERCENT_STEP))
            .collect();
        if let Some(step) = lookup.iter().tuple_windows().position(|(low, high)| low > high) {
            warn!(
                percent = step as f64 * PERCENT_STEP,
                "the fitted curve is not monotonic, inverse lookups around this point may be off",
            );
        }

        Ok(Self { coefficients, lookup })
    }

    /// Evaluate the fitted polynomial. Extrapolation is allowed, the caller
    /// is responsible for clamping.
    pub fn percent_to_watts(&self, percent: f64) -> Watts {
        Watts(evaluate(&self.coefficients, percent))
    }

    /// Find the lowest command percentage that covers the wanted power.
    pub fn watts_to_percent(&self, watts: Watts) -> f64 {
        if watts.0 < 0.0 {
            return 0.0;
        }
        let index = self.lookup.partition_point(|entry| *entry < watts.0);
        if index >= self.lookup.len() {
            return 100.0;
        }
        if index == 0 {
            return 0.0;
        }
        let bracket = self.lookup[index] - self.lookup[index - 1];
        let fraction =
            if bracket > 0.0 { (watts.0 - self.lookup[index - 1]) / bracket } else { 1.0 };
        ((index - 1) as f64).mul_add(PERCENT_STEP, PERCENT_STEP * fraction).clamp(0.0, 100.0)
    }

    /// Power draw at full duty cycle.
    pub fn max_power(&self) -> Watts {
        self.percent_to_watts(100.0)
    }

    /// The `(percent, watts)` rows of the lookup table, for diagnostics.
    pub fn table(&self) -> impl Iterator<Item = (f64, f64)> {
        self.lookup.iter().enumerate().map(|(step, watts)| (step as f64 * PERCENT_STEP, *watts))
    }
}

fn evaluate(coefficients: &[f64; DEGREE + 1], percent: f64) -> f64 {
    let x = percent / 100.0;
    coefficients.iter().rev().fold(0.0, |sum, coefficient| sum.mul_add(x, *coefficient))
}

/// Least-squares polynomial fit via the normal equations, with the percents
/// scaled into `[0, 1]` to keep the system well-conditioned.
fn fit(samples: &[(f64, f64)]) -> [f64; DEGREE + 1] {
    const N: usize = DEGREE + 1;

    let mut moments = [0.0; 2 * DEGREE + 1];
    let mut rhs = [0.0; N];
    for (percent, watts) in samples {
        let x = percent / 100.0;
        let mut power = 1.0;
        for (order, moment) in moments.iter_mut().enumerate() {
            *moment += power;
            if order < N {
                rhs[order] += power * watts;
            }
            power *= x;
        }
    }

    let mut matrix = [[0.0; N + 1]; N];
    for (row, matrix_row) in matrix.iter_mut().enumerate() {
        for (column, cell) in matrix_row.iter_mut().take(N).enumerate() {
            *cell = moments[row + column];
        }
        matrix_row[N] = rhs[row];
    }

    // Gaussian elimination with partial pivoting:
    for pivot in 0..N {
        let best = (pivot..N)
            .max_by_key(|row| OrderedFloat(matrix[*row][pivot].abs()))
            .unwrap_or(pivot);
        matrix.swap(pivot, best);
        for row in (pivot + 1)..N {
            let factor = matrix[row][pivot] / matrix[pivot][pivot];
            for column in pivot..=N {
                matrix[row][column] -= factor * matrix[pivot][column];
            }
        }
    }
    let mut coefficients = [0.0; N];
    for row in (0..N).rev() {
        let mut sum = matrix[row][N];
        for column in (row + 1)..N {
            sum -= matrix[row][column] * coefficients[column];
        }
        coefficients[row] = sum / matrix[row][row];
    }
    coefficients
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    /// 11 samples of a linear 30 W-per-percent response, like the SCR rig
    /// produces on a purely resistive load.
    fn linear_curve() -> CalibrationCurve {
        let samples =
            (0..=10).map(|step| (f64::from(step) * 10.0, f64::from(step) * 300.0)).collect();
        CalibrationCurve::from_samples(samples).unwrap()
    }

    #[test]
    fn test_too_few_samples() {
        let samples = (0..5).map(|step| (f64::from(step), f64::from(step))).collect();
        assert!(matches!(
            CalibrationCurve::from_samples(samples),
            Err(CalibrationError::NotEnoughSamples(5)),
        ));
    }

    #[test]
    fn test_forward_evaluation() {
        let curve = linear_curve();
        assert_relative_eq!(curve.percent_to_watts(50.0).0, 1500.0, epsilon = 1.0);
        assert_relative_eq!(curve.max_power().0, 3000.0, epsilon = 1.0);
    }

    #[test]
    fn test_inverse_out_of_range() {
        let curve = linear_curve();
        assert_relative_eq!(curve.watts_to_percent(Watts(-5.0)), 0.0);
        assert_relative_eq!(curve.watts_to_percent(Watts(1e9)), 100.0);
    }

    #[test]
    fn test_inverse_is_monotonic() {
        let curve = linear_curve();
        let mut previous = 0.0;
        for watts in 0..=3000 {
            let percent = curve.watts_to_percent(Watts(f64::from(watts)));
            assert!(percent >= previous, "{watts} W mapped to {percent} % after {previous} %");
            previous = percent;
        }
    }

    #[test]
    fn test_round_trip_within_bracket() {
        let curve = linear_curve();
        for step in 0..=200 {
            let percent = f64::from(step) * 0.5;
            let watts = curve.percent_to_watts(percent);
            let round_tripped = curve.watts_to_percent(watts);
            assert!(
                (round_tripped - percent).abs() <= 0.5,
                "{percent} % round-tripped to {round_tripped} %",
            );
        }
    }
}
