// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use log::debug;

use crate::focus_sampler::{FocusSample, SamplerConfig};

/// Autofocus operating modes. Each mode carries default exposure,
/// coarse step and point count for when the caller leaves them unset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutofocusMode {
    Full,
    Quick,
    Fine,
    Starless,
    HighPrecision,
}

impl AutofocusMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(AutofocusMode::Full),
            "quick" => Some(AutofocusMode::Quick),
            "fine" => Some(AutofocusMode::Fine),
            "starless" => Some(AutofocusMode::Starless),
            "high_precision" => Some(AutofocusMode::HighPrecision),
            _ => None,
        }
    }

    /// (exposure, coarse step, sweep points).
    pub fn defaults(&self) -> (Duration, i32, usize) {
        match self {
            AutofocusMode::Quick => (Duration::from_secs_f64(1.0), 150, 15),
            AutofocusMode::Fine => (Duration::from_secs_f64(2.0), 30, 10),
            AutofocusMode::Starless => (Duration::from_secs_f64(0.5), 200, 20),
            AutofocusMode::HighPrecision => (Duration::from_secs_f64(3.0), 50, 15),
            AutofocusMode::Full => (Duration::from_secs_f64(2.0), 100, 25),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutofocusAlgorithm {
    VCurve,
    Hyperbolic,
    Polynomial,
    Simple,
}

impl AutofocusAlgorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vcurve" => Some(AutofocusAlgorithm::VCurve),
            "hyperbolic" => Some(AutofocusAlgorithm::Hyperbolic),
            "polynomial" => Some(AutofocusAlgorithm::Polynomial),
            "simple" => Some(AutofocusAlgorithm::Simple),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AutofocusAlgorithm::VCurve => "vcurve",
            AutofocusAlgorithm::Hyperbolic => "hyperbolic",
            AutofocusAlgorithm::Polynomial => "polynomial",
            AutofocusAlgorithm::Simple => "simple",
        }
    }
}

/// The outcome of analyzing a sweep: the sampled curve, the chosen
/// best position, and how much to trust it.
#[derive(Clone, Debug)]
pub struct FocusCurve {
    pub samples: Vec<FocusSample>,
    pub best_position: i32,
    pub confidence: f64,
    pub algorithm: AutofocusAlgorithm,
}

impl FocusCurve {
    /// A curve is actionable when it has enough samples, reasonable
    /// confidence, and a best position inside the focuser limits.
    pub fn is_valid(&self, limits: (i32, i32)) -> bool {
        self.samples.len() >= 3
            && self.confidence >= 0.5
            && self.best_position >= limits.0
            && self.best_position <= limits.1
    }
}

/// Picks the best focus position from a set of samples.
pub struct CurveAnalyzer {
    pub sampler_config: SamplerConfig,
}

impl CurveAnalyzer {
    pub fn new(sampler_config: SamplerConfig) -> Self {
        CurveAnalyzer { sampler_config }
    }

    pub fn analyze(
        &self,
        samples: &[FocusSample],
        algorithm: AutofocusAlgorithm,
    ) -> FocusCurve {
        let mut curve = FocusCurve {
            samples: samples.to_vec(),
            best_position: samples.first().map(|s| s.position).unwrap_or(0),
            confidence: 0.0,
            algorithm,
        };
        if samples.is_empty() {
            return curve;
        }

        match algorithm {
            AutofocusAlgorithm::Simple => {
                let (position, _) = argmin_hfr(samples);
                curve.best_position = position;
                curve.confidence = 0.8;
            }
            AutofocusAlgorithm::VCurve => {
                let (position, index) = argmin_hfr(samples);
                curve.best_position = position;
                if samples.len() < 3 {
                    curve.confidence = 0.5;
                } else {
                    // Clear V shape: both neighbors strictly worse.
                    let clear_v = index > 0
                        && index + 1 < samples.len()
                        && samples[index - 1].hfr > samples[index].hfr
                        && samples[index + 1].hfr > samples[index].hfr;
                    curve.confidence = if clear_v { 0.95 } else { 0.9 };
                }
            }
            AutofocusAlgorithm::Hyperbolic => {
                self.analyze_hyperbolic(samples, &mut curve);
            }
            AutofocusAlgorithm::Polynomial => {
                self.analyze_polynomial(samples, &mut curve);
            }
        }

        debug!(
            "Curve analysis ({}): best={} confidence={:.2} over {} samples",
            algorithm.as_str(), curve.best_position, curve.confidence,
            samples.len());
        curve
    }

    /// Fits HFR^2 = a (p - p0)^2 + b^2 over the reliable samples by
    /// expanding to the quadratic A p^2 + B p + C and solving least
    /// squares; the vertex -B/2A is the best position. Confidence maps
    /// the fit R^2 into [0.6, 0.95].
    fn analyze_hyperbolic(&self, samples: &[FocusSample], curve: &mut FocusCurve) {
        let reliable: Vec<&FocusSample> = samples
            .iter()
            .filter(|s| s.is_reliable(&self.sampler_config))
            .collect();
        let used: Vec<&FocusSample> = if reliable.len() >= 3 {
            reliable
        } else {
            samples.iter().collect()
        };

        let points: Vec<(f64, f64)> = used
            .iter()
            .map(|s| (s.position as f64, s.hfr * s.hfr))
            .collect();
        let coefficients = match polyfit(&points, 2) {
            Some(c) => c,
            None => {
                // Degenerate geometry: fall back to the raw minimum.
                let (position, _) = argmin_hfr(samples);
                curve.best_position = position;
                curve.confidence = 0.5;
                return;
            }
        };
        let a = coefficients[2];
        let b = coefficients[1];
        if a <= 0.0 {
            // Concave fit means no focus valley in range.
            let (position, _) = argmin_hfr(samples);
            curve.best_position = position;
            curve.confidence = 0.5;
            return;
        }

        let vertex = -b / (2.0 * a);
        let (lo, hi) = position_range(samples);
        curve.best_position = (vertex.round() as i32).clamp(lo, hi);
        let r2 = r_squared(&points, &coefficients);
        curve.confidence = 0.6 + r2.clamp(0.0, 1.0) * 0.35;
    }

    /// Degree-3 least squares on (position, HFR). The best position
    /// is the root of the derivative inside the sampled range closest
    /// to the minimum sample.
    fn analyze_polynomial(&self, samples: &[FocusSample], curve: &mut FocusCurve) {
        let points: Vec<(f64, f64)> = samples
            .iter()
            .map(|s| (s.position as f64, s.hfr))
            .collect();
        let (min_position, _) = argmin_hfr(samples);
        let coefficients = match polyfit(&points, 3) {
            Some(c) => c,
            None => {
                curve.best_position = min_position;
                curve.confidence = 0.5;
                return;
            }
        };

        // Derivative 3 c3 p^2 + 2 c2 p + c1 = 0.
        let a = 3.0 * coefficients[3];
        let b = 2.0 * coefficients[2];
        let c = coefficients[1];
        let (lo, hi) = position_range(samples);
        let mut candidates: Vec<f64> = vec![];
        if a.abs() < 1e-12 {
            if b.abs() > 1e-12 {
                candidates.push(-c / b);
            }
        } else {
            let discriminant = b * b - 4.0 * a * c;
            if discriminant >= 0.0 {
                let root = discriminant.sqrt();
                candidates.push((-b + root) / (2.0 * a));
                candidates.push((-b - root) / (2.0 * a));
            }
        }
        candidates.retain(|p| *p >= lo as f64 && *p <= hi as f64);

        match candidates
            .iter()
            .min_by(|x, y| {
                (*x - min_position as f64)
                    .abs()
                    .total_cmp(&(*y - min_position as f64).abs())
            }) {
            Some(best) => {
                curve.best_position = best.round() as i32;
                let r2 = r_squared(&points, &coefficients);
                curve.confidence = 0.55 + r2.clamp(0.0, 1.0) * 0.4;
            }
            None => {
                curve.best_position = min_position;
                curve.confidence = 0.5;
            }
        }
    }
}

fn argmin_hfr(samples: &[FocusSample]) -> (i32, usize) {
    let mut best_index = 0;
    for (i, sample) in samples.iter().enumerate() {
        if sample.hfr < samples[best_index].hfr {
            best_index = i;
        }
    }
    (samples[best_index].position, best_index)
}

fn position_range(samples: &[FocusSample]) -> (i32, i32) {
    let mut lo = i32::MAX;
    let mut hi = i32::MIN;
    for sample in samples {
        lo = lo.min(sample.position);
        hi = hi.max(sample.position);
    }
    (lo, hi)
}

/// Least-squares polynomial fit of the given degree. Returns
/// coefficients [c0, c1, ..., cd], or None when the normal equations
/// are singular (e.g. too few distinct x values). Positions are
/// centered before solving to keep the system well conditioned.
pub fn polyfit(points: &[(f64, f64)], degree: usize) -> Option<Vec<f64>> {
    if points.len() < degree + 1 {
        return None;
    }
    let x_mean = points.iter().map(|p| p.0).sum::<f64>() / points.len() as f64;
    let shifted: Vec<(f64, f64)> = points.iter().map(|p| (p.0 - x_mean, p.1)).collect();

    // Normal equations: (X^T X) c = X^T y.
    let n = degree + 1;
    let mut matrix = vec![vec![0.0f64; n + 1]; n];
    for row in 0..n {
        for col in 0..n {
            matrix[row][col] = shifted
                .iter()
                .map(|(x, _)| x.powi((row + col) as i32))
                .sum();
        }
        matrix[row][n] = shifted.iter().map(|(x, y)| y * x.powi(row as i32)).sum();
    }

    // Gaussian elimination with partial pivoting.
    for pivot in 0..n {
        let mut max_row = pivot;
        for row in pivot + 1..n {
            if matrix[row][pivot].abs() > matrix[max_row][pivot].abs() {
                max_row = row;
            }
        }
        matrix.swap(pivot, max_row);
        if matrix[pivot][pivot].abs() < 1e-12 {
            return None;
        }
        for row in pivot + 1..n {
            let factor = matrix[row][pivot] / matrix[pivot][pivot];
            for col in pivot..=n {
                matrix[row][col] -= factor * matrix[pivot][col];
            }
        }
    }
    let mut shifted_coefficients = vec![0.0f64; n];
    for row in (0..n).rev() {
        let mut value = matrix[row][n];
        for col in row + 1..n {
            value -= matrix[row][col] * shifted_coefficients[col];
        }
        shifted_coefficients[row] = value / matrix[row][row];
    }

    // Expand back to the original x: substitute (x - x_mean).
    Some(unshift_polynomial(&shifted_coefficients, x_mean))
}

// Rewrites sum c_k (x - h)^k as coefficients of x^k via binomial
// expansion.
fn unshift_polynomial(coefficients: &[f64], h: f64) -> Vec<f64> {
    let n = coefficients.len();
    let mut out = vec![0.0f64; n];
    for (k, &ck) in coefficients.iter().enumerate() {
        // (x - h)^k = sum_j C(k, j) x^j (-h)^(k - j).
        let mut binomial = 1.0f64;
        for j in 0..=k {
            // C(k, j) computed incrementally.
            if j > 0 {
                binomial = binomial * (k - j + 1) as f64 / j as f64;
            }
            out[j] += ck * binomial * (-h).powi((k - j) as i32);
        }
    }
    out
}

/// Coefficient of determination for a polynomial fit.
pub fn r_squared(points: &[(f64, f64)], coefficients: &[f64]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let y_mean = points.iter().map(|p| p.1).sum::<f64>() / points.len() as f64;
    let mut ss_residual = 0.0;
    let mut ss_total = 0.0;
    for (x, y) in points {
        let predicted: f64 = coefficients
            .iter()
            .enumerate()
            .map(|(k, c)| c * x.powi(k as i32))
            .sum();
        ss_residual += (y - predicted) * (y - predicted);
        ss_total += (y - y_mean) * (y - y_mean);
    }
    if ss_total < 1e-12 {
        return 0.0;
    }
    (1.0 - ss_residual / ss_total).clamp(0.0, 1.0)
}

// mod tests.
