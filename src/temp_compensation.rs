// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime};

use canonical_error::{failed_precondition_error, invalid_argument_error, CanonicalError};
use log::{debug, info};

#[derive(Clone, Debug)]
pub struct TempCompConfig {
    /// Focuser steps per degree Celsius. Positive means focus moves
    /// out as temperature rises.
    pub coefficient: f64,

    /// Smallest temperature change that triggers a compensation.
    pub min_change_celsius: f64,

    /// Window over which the trend regression runs.
    pub trend_window: Duration,

    /// Cap on a single compensation move.
    pub max_compensation_per_cycle: f64,

    pub enable_predictive: bool,

    /// Look-ahead for the predictive component, minutes.
    pub prediction_window_minutes: f64,

    /// Bounded history capacity.
    pub history_capacity: usize,
}

impl Default for TempCompConfig {
    fn default() -> Self {
        TempCompConfig {
            coefficient: 0.0,
            min_change_celsius: 0.5,
            trend_window: Duration::from_secs(3600),
            max_compensation_per_cycle: 50.0,
            enable_predictive: false,
            prediction_window_minutes: 10.0,
            history_capacity: 1000,
        }
    }
}

// Plausible sensor range; anything outside is a read fault.
const MIN_TEMPERATURE: f64 = -50.0;
const MAX_TEMPERATURE: f64 = 80.0;

#[derive(Clone, Debug)]
pub struct TemperatureReading {
    pub taken_at: Instant,
    pub wall_time: SystemTime,
    pub celsius: f64,
    pub focus_position: i32,
}

#[derive(Clone, Debug)]
pub struct CompensationEvent {
    pub wall_time: SystemTime,
    pub old_temperature: f64,
    pub new_temperature: f64,
    pub steps: i32,
    pub reason: String,
}

/// Result of coefficient calibration.
#[derive(Clone, Copy, Debug)]
pub struct CoefficientCalibration {
    pub coefficient: f64,

    /// R^2 of the temperature/position line fit.
    pub confidence: f64,
}

#[derive(Clone, Debug, Default)]
pub struct TempCompStats {
    pub total_compensations: usize,
    pub total_compensation_steps: f64,
    pub max_compensation: f64,
    pub temperature_min: f64,
    pub temperature_max: f64,
}

/// Temperature compensation for a motorized focuser: a bounded ring
/// of (time, temperature, position) readings, a regression-based
/// trend, and step compensation `delta_T * coefficient` with an
/// optional predictive term.
pub struct TemperatureCompensator {
    pub config: TempCompConfig,
    history: VecDeque<TemperatureReading>,
    events: VecDeque<CompensationEvent>,

    // Temperature at the last applied compensation; None until the
    // first reading seeds it.
    last_compensation_temperature: Option<f64>,
    stats: TempCompStats,
}

const MAX_EVENTS: usize = 1000;

impl TemperatureCompensator {
    pub fn new(config: TempCompConfig) -> Self {
        TemperatureCompensator {
            config,
            history: VecDeque::new(),
            events: VecDeque::new(),
            last_compensation_temperature: None,
            stats: TempCompStats::default(),
        }
    }

    pub fn is_reading_valid(celsius: f64) -> bool {
        celsius.is_finite() && (MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&celsius)
    }

    /// Appends a reading to the ring. The first reading seeds the
    /// compensation baseline.
    pub fn add_reading(&mut self, celsius: f64, focus_position: i32) {
        if !Self::is_reading_valid(celsius) {
            debug!("Discarding implausible temperature reading {}", celsius);
            return;
        }
        self.history.push_back(TemperatureReading {
            taken_at: Instant::now(),
            wall_time: SystemTime::now(),
            celsius,
            focus_position,
        });
        while self.history.len() > self.config.history_capacity.max(1) {
            self.history.pop_front();
        }
        if self.last_compensation_temperature.is_none() {
            self.last_compensation_temperature = Some(celsius);
        }
        if self.stats.temperature_min == 0.0 && self.stats.temperature_max == 0.0 {
            self.stats.temperature_min = celsius;
            self.stats.temperature_max = celsius;
        } else {
            self.stats.temperature_min = self.stats.temperature_min.min(celsius);
            self.stats.temperature_max = self.stats.temperature_max.max(celsius);
        }
    }

    pub fn current_temperature(&self) -> Option<f64> {
        self.history.back().map(|r| r.celsius)
    }

    pub fn average_temperature(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().map(|r| r.celsius).sum::<f64>() / self.history.len() as f64)
    }

    /// Temperature trend in degrees per hour: the slope of a simple
    /// linear regression over readings inside the trend window.
    pub fn trend_degrees_per_hour(&self) -> f64 {
        let window: Vec<&TemperatureReading> = self
            .history
            .iter()
            .filter(|r| r.taken_at.elapsed() <= self.config.trend_window)
            .collect();
        if window.len() < 2 {
            return 0.0;
        }

        let origin = window[0].taken_at;
        let points: Vec<(f64, f64)> = window
            .iter()
            .map(|r| {
                let hours = r.taken_at.duration_since(origin).as_secs_f64() / 3600.0;
                (hours, r.celsius)
            })
            .collect();

        let n = points.len() as f64;
        let x_mean = points.iter().map(|p| p.0).sum::<f64>() / n;
        let y_mean = points.iter().map(|p| p.1).sum::<f64>() / n;
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (x, y) in &points {
            numerator += (x - x_mean) * (y - y_mean);
            denominator += (x - x_mean) * (x - x_mean);
        }
        if denominator < 1e-12 {
            return 0.0;
        }
        numerator / denominator
    }

    /// Steps to move now, or None when the temperature has not moved
    /// enough since the last compensation. The result is capped at
    /// `max_compensation_per_cycle` and includes the predictive
    /// component when enabled.
    pub fn compensation_steps(&self, current_celsius: f64) -> Option<i32> {
        let baseline = self.last_compensation_temperature?;
        let delta = current_celsius - baseline;
        if delta.abs() < self.config.min_change_celsius {
            return None;
        }

        let mut steps = delta * self.config.coefficient;
        if self.config.enable_predictive {
            steps += self.predictive_steps();
        }
        let capped = steps.clamp(
            -self.config.max_compensation_per_cycle,
            self.config.max_compensation_per_cycle,
        );
        let rounded = capped.round() as i32;
        if rounded == 0 {
            return None;
        }
        Some(rounded)
    }

    /// Predictive nudging: half of the compensation the current trend
    /// implies over the prediction window.
    fn predictive_steps(&self) -> f64 {
        let trend = self.trend_degrees_per_hour();
        let predicted_change = trend * self.config.prediction_window_minutes / 60.0;
        0.5 * predicted_change * self.config.coefficient
    }

    /// Commits an applied compensation and records the event.
    pub fn record_compensation(&mut self, new_celsius: f64, steps: i32, reason: &str) {
        let old = self.last_compensation_temperature.unwrap_or(new_celsius);
        self.last_compensation_temperature = Some(new_celsius);
        self.events.push_back(CompensationEvent {
            wall_time: SystemTime::now(),
            old_temperature: old,
            new_temperature: new_celsius,
            steps,
            reason: reason.to_string(),
        });
        while self.events.len() > MAX_EVENTS {
            self.events.pop_front();
        }
        self.stats.total_compensations += 1;
        self.stats.total_compensation_steps += steps.abs() as f64;
        self.stats.max_compensation = self.stats.max_compensation.max(steps.abs() as f64);
        info!(
            "Temperature compensation: {:.1}C -> {:.1}C, {} steps ({})",
            old, new_celsius, steps, reason);
    }

    /// Fits position = coefficient * temperature + offset over
    /// calibration points. Requires at least three points spanning
    /// 5 degrees C; the slope is the coefficient and the line's R^2
    /// is the confidence.
    pub fn calibrate_coefficient(
        points: &[(f64, i32)],
    ) -> Result<CoefficientCalibration, CanonicalError> {
        if points.len() < 3 {
            return Err(invalid_argument_error(
                "Coefficient calibration needs at least 3 points",
            ));
        }
        let mut t_min = f64::MAX;
        let mut t_max = f64::MIN;
        for (t, _) in points {
            t_min = t_min.min(*t);
            t_max = t_max.max(*t);
        }
        if t_max - t_min < 5.0 {
            return Err(failed_precondition_error(
                "Calibration temperatures must span at least 5 degrees C",
            ));
        }

        let n = points.len() as f64;
        let x_mean = points.iter().map(|p| p.0).sum::<f64>() / n;
        let y_mean = points.iter().map(|p| p.1 as f64).sum::<f64>() / n;
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (t, p) in points {
            numerator += (t - x_mean) * (*p as f64 - y_mean);
            denominator += (t - x_mean) * (t - x_mean);
        }
        if denominator < 1e-12 {
            return Err(failed_precondition_error(
                "Calibration temperatures are degenerate",
            ));
        }
        let slope = numerator / denominator;
        let intercept = y_mean - slope * x_mean;

        let mut ss_residual = 0.0;
        let mut ss_total = 0.0;
        for (t, p) in points {
            let predicted = slope * t + intercept;
            ss_residual += (*p as f64 - predicted) * (*p as f64 - predicted);
            ss_total += (*p as f64 - y_mean) * (*p as f64 - y_mean);
        }
        let confidence = if ss_total < 1e-12 {
            0.0
        } else {
            (1.0 - ss_residual / ss_total).clamp(0.0, 1.0)
        };

        Ok(CoefficientCalibration {
            coefficient: slope,
            confidence,
        })
    }

    pub fn history(&self) -> impl Iterator<Item = &TemperatureReading> {
        self.history.iter()
    }

    pub fn events(&self) -> impl Iterator<Item = &CompensationEvent> {
        self.events.iter()
    }

    pub fn stats(&self) -> TempCompStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    fn compensator(coefficient: f64) -> TemperatureCompensator {
        TemperatureCompensator::new(TempCompConfig {
            coefficient,
            ..Default::default()
        })
    }

    #[test]
    fn test_first_reading_seeds_baseline_no_compensation() {
        let mut comp = compensator(10.0);
        comp.add_reading(10.0, 25000);
        // 0.3 degrees below min_change.
        assert_eq!(comp.compensation_steps(10.3), None);
    }

    #[test]
    fn test_compensation_proportional_to_delta() {
        let mut comp = compensator(10.0);
        comp.add_reading(10.0, 25000);
        // -2 degrees at 10 steps/degree.
        assert_eq!(comp.compensation_steps(8.0), Some(-20));
        assert_eq!(comp.compensation_steps(12.5), Some(25));
    }

    #[test]
    fn test_compensation_capped_per_cycle() {
        let mut comp = compensator(30.0);
        comp.add_reading(10.0, 25000);
        // -5 degrees would be -150 steps; the cap is 50.
        assert_eq!(comp.compensation_steps(5.0), Some(-50));
    }

    #[test]
    fn test_record_compensation_moves_baseline() {
        let mut comp = compensator(10.0);
        comp.add_reading(10.0, 25000);
        assert_eq!(comp.compensation_steps(8.0), Some(-20));
        comp.record_compensation(8.0, -20, "test");
        // Baseline is now 8; a further 0.4 change is below threshold.
        assert_eq!(comp.compensation_steps(8.4), None);
        assert_eq!(comp.compensation_steps(6.0), Some(-20));

        let stats = comp.stats();
        assert_eq!(stats.total_compensations, 1);
        assert_abs_diff_eq!(stats.total_compensation_steps, 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_implausible_readings_discarded() {
        let mut comp = compensator(10.0);
        comp.add_reading(f64::NAN, 25000);
        comp.add_reading(-120.0, 25000);
        comp.add_reading(200.0, 25000);
        assert_eq!(comp.current_temperature(), None);
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let mut comp = TemperatureCompensator::new(TempCompConfig {
            history_capacity: 5,
            ..Default::default()
        });
        for i in 0..20 {
            comp.add_reading(10.0 + i as f64 * 0.1, 25000 + i);
        }
        assert_eq!(comp.history().count(), 5);
    }

    #[test]
    fn test_trend_zero_without_spread() {
        let mut comp = compensator(10.0);
        comp.add_reading(10.0, 25000);
        assert_eq!(comp.trend_degrees_per_hour(), 0.0);
    }

    #[test]
    fn test_calibration_recovers_slope() {
        let points = vec![
            (0.0, 25000),
            (3.0, 25024),
            (6.0, 25048),
            (9.0, 25072),
        ];
        let calibration =
            TemperatureCompensator::calibrate_coefficient(&points).unwrap();
        assert_abs_diff_eq!(calibration.coefficient, 8.0, epsilon = 1e-9);
        assert_abs_diff_eq!(calibration.confidence, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_calibration_requirements() {
        // Too few points.
        assert!(TemperatureCompensator::calibrate_coefficient(
            &[(0.0, 25000), (6.0, 25048)]).is_err());
        // Insufficient span.
        assert!(TemperatureCompensator::calibrate_coefficient(
            &[(0.0, 25000), (1.0, 25008), (2.0, 25016)]).is_err());
    }

    #[test]
    fn test_noisy_calibration_confidence_below_one() {
        let points = vec![
            (0.0, 25000),
            (2.0, 25030),
            (4.0, 25010),
            (6.0, 25060),
            (8.0, 25035),
        ];
        let calibration =
            TemperatureCompensator::calibrate_coefficient(&points).unwrap();
        assert!(calibration.confidence < 1.0);
        assert!(calibration.coefficient > 0.0);
    }

}  // mod tests.
