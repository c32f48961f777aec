// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use canonical_error::{failed_precondition_error, CanonicalError};
use log::{debug, info, warn};

use crate::devices::{wait_for_motion, Focuser};
use crate::focus_sampler::FocusSampler;

#[derive(Clone, Debug)]
pub struct BacklashConfig {
    /// Full span of the hysteresis measurement sweep, in steps.
    pub measurement_range: i32,

    /// Interval between measurement samples, in steps.
    pub measurement_step: i32,

    /// Extra steps past the target on a direction change.
    pub overshoot_margin: i32,

    pub auto_compensation: bool,

    /// Minimum confidence for a measurement to be used.
    pub confidence_threshold: f64,

    /// Upper bound on a believable backlash value.
    pub max_backlash_steps: i32,

    pub settle_time: Duration,
}

impl Default for BacklashConfig {
    fn default() -> Self {
        BacklashConfig {
            measurement_range: 100,
            measurement_step: 10,
            overshoot_margin: 20,
            auto_compensation: true,
            confidence_threshold: 0.8,
            max_backlash_steps: 200,
            settle_time: Duration::from_millis(500),
        }
    }
}

/// Result of a hysteresis measurement: backlash per approach
/// direction, with the sampled (position, HFR) evidence.
#[derive(Clone, Debug)]
pub struct BacklashMeasurement {
    pub timestamp: SystemTime,
    pub inward_steps: i32,
    pub outward_steps: i32,
    pub confidence: f64,
    pub method: String,
    pub data_points: Vec<(i32, f64)>,
}

impl BacklashMeasurement {
    pub fn is_valid(&self, config: &BacklashConfig) -> bool {
        self.confidence >= config.confidence_threshold
            && self.inward_steps <= config.max_backlash_steps
            && self.outward_steps <= config.max_backlash_steps
            && !self.data_points.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct BacklashStats {
    pub total_measurements: usize,
    pub total_compensations: usize,
    pub average_inward: f64,
    pub average_outward: f64,

    /// Standard deviation of measured values; low means the mechanics
    /// are repeatable.
    pub variability: f64,
}

const MAX_MEASUREMENT_HISTORY: usize = 20;

/// Measures focuser backlash and compensates direction changes by
/// overshooting past the target and returning, so the mechanism
/// always approaches from the same side.
pub struct BacklashCompensator {
    pub config: BacklashConfig,
    current: Option<BacklashMeasurement>,
    history: VecDeque<BacklashMeasurement>,

    // Direction state committed after every move; None before the
    // first move.
    last_direction_inward: Option<bool>,
    compensation_count: usize,
}

impl BacklashCompensator {
    pub fn new(config: BacklashConfig) -> Self {
        BacklashCompensator {
            config,
            current: None,
            history: VecDeque::new(),
            last_direction_inward: None,
            compensation_count: 0,
        }
    }

    pub fn current_measurement(&self) -> Option<&BacklashMeasurement> {
        self.current.as_ref()
    }

    pub fn has_valid_measurement(&self) -> bool {
        self.current
            .as_ref()
            .map(|m| m.is_valid(&self.config))
            .unwrap_or(false)
    }

    /// Installs an externally known measurement (e.g. persisted from
    /// an earlier session).
    pub fn set_measurement(&mut self, measurement: BacklashMeasurement) {
        self.history.push_back(measurement.clone());
        if self.history.len() > MAX_MEASUREMENT_HISTORY {
            self.history.pop_front();
        }
        self.current = Some(measurement);
    }

    /// Runs the two-pass hysteresis measurement around the current
    /// position. The focuser approaches the sweep range from below on
    /// the first pass and from above on the second; the offset
    /// between the two HFR minima is the backlash.
    pub fn measure(
        &mut self,
        focuser: &mut dyn Focuser,
        sampler: &mut FocusSampler,
    ) -> Result<BacklashMeasurement, CanonicalError> {
        let center = focuser.position()?;
        let half_range = self.config.measurement_range / 2;
        let step = self.config.measurement_step.max(1);
        let (lo, hi) = focuser.limits();

        let sweep_lo = center - half_range;
        let sweep_hi = center + half_range;
        if sweep_lo - self.config.overshoot_margin < lo
            || sweep_hi + self.config.overshoot_margin > hi
        {
            return Err(failed_precondition_error(
                "Backlash measurement range exceeds focuser limits",
            ));
        }

        let mut measurement = BacklashMeasurement {
            timestamp: SystemTime::now(),
            inward_steps: 0,
            outward_steps: 0,
            confidence: 0.0,
            method: "hysteresis".to_string(),
            data_points: vec![],
        };

        // Approach the range start from well below so the first pass
        // is a consistent outward run.
        self.move_direct(focuser, sweep_lo - self.config.overshoot_margin)?;

        let mut first_pass: Vec<(i32, f64)> = vec![];
        let mut position = sweep_lo;
        while position <= sweep_hi {
            let sample = sampler.sample_at(focuser, position)?;
            first_pass.push((position, sample.hfr));
            measurement.data_points.push((position, sample.hfr));
            position += step;
        }

        // Reset direction past the top, then sweep back down.
        self.move_direct(focuser, sweep_hi + self.config.overshoot_margin)?;

        let mut second_pass: Vec<(i32, f64)> = vec![];
        let mut position = sweep_hi;
        while position >= sweep_lo {
            let sample = sampler.sample_at(focuser, position)?;
            second_pass.push((position, sample.hfr));
            measurement.data_points.push((position, sample.hfr));
            position -= step;
        }

        let min_first = first_pass
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .copied();
        let min_second = second_pass
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .copied();

        if let (Some(first), Some(second)) = (min_first, min_second) {
            let offset = (first.0 - second.0).abs();
            // The pass with the sharper minimum approached without
            // play; the other direction carries the backlash.
            if first.1 < second.1 {
                measurement.inward_steps = offset;
                measurement.outward_steps = 0;
            } else {
                measurement.inward_steps = 0;
                measurement.outward_steps = offset;
            }
        }

        measurement.confidence = self.measurement_confidence(&measurement);
        info!(
            "Backlash measurement: in={} out={} confidence={:.2}",
            measurement.inward_steps, measurement.outward_steps,
            measurement.confidence);

        if !measurement.is_valid(&self.config) {
            warn!("Backlash measurement failed validation");
            return Err(failed_precondition_error(
                "Backlash measurement failed validation",
            ));
        }
        self.set_measurement(measurement.clone());
        Ok(measurement)
    }

    /// Confidence from evidence quantity, value plausibility and the
    /// curve's dynamic range.
    fn measurement_confidence(&self, measurement: &BacklashMeasurement) -> f64 {
        if measurement.data_points.len() < 5 {
            return 0.0;
        }
        if measurement.inward_steps > self.config.max_backlash_steps
            || measurement.outward_steps > self.config.max_backlash_steps
        {
            return 0.2;
        }
        let mut min_hfr = f64::MAX;
        let mut max_hfr = f64::MIN;
        for (_, hfr) in &measurement.data_points {
            min_hfr = min_hfr.min(*hfr);
            max_hfr = max_hfr.max(*hfr);
        }
        let dynamic_range = max_hfr - min_hfr;
        if dynamic_range < 0.5 {
            return 0.3;
        }
        (0.5 + dynamic_range / 10.0).min(1.0)
    }

    /// Moves to `target`, compensating when the direction changes:
    /// overshoot by the measured backlash plus the margin, then come
    /// back to the target so the final approach direction matches the
    /// previous one. Commits the direction state after every move.
    pub fn move_to(
        &mut self,
        focuser: &mut dyn Focuser,
        target: i32,
    ) -> Result<(), CanonicalError> {
        let current = focuser.position()?;
        if target == current {
            return Ok(());
        }
        let moving_inward = target < current;

        let compensate = self.config.auto_compensation
            && self.has_valid_measurement()
            && self
                .last_direction_inward
                .map(|last| last != moving_inward)
                .unwrap_or(false);

        if compensate {
            let measurement = self.current.as_ref().unwrap();
            let backlash = if moving_inward {
                measurement.inward_steps
            } else {
                measurement.outward_steps
            };
            let overshoot = backlash + self.config.overshoot_margin;
            let (lo, hi) = focuser.limits();
            let staging = if moving_inward {
                (target - overshoot).max(lo)
            } else {
                (target + overshoot).min(hi)
            };
            debug!(
                "Direction change, compensating via {} (target {})",
                staging, target);
            self.move_direct(focuser, staging)?;
            self.move_direct(focuser, target)?;
            self.compensation_count += 1;
        } else {
            self.move_direct(focuser, target)?;
        }

        self.last_direction_inward = Some(moving_inward);
        Ok(())
    }

    fn move_direct(
        &self,
        focuser: &mut dyn Focuser,
        target: i32,
    ) -> Result<(), CanonicalError> {
        focuser.move_to(target)?;
        wait_for_motion(focuser, Duration::from_secs(30))?;
        if !self.config.settle_time.is_zero() {
            std::thread::sleep(self.config.settle_time);
        }
        Ok(())
    }

    /// True when there is no usable measurement, or the mechanics
    /// have shown enough spread that remeasuring is warranted.
    pub fn should_remeasure(&self) -> bool {
        if !self.has_valid_measurement() {
            return true;
        }
        self.stats().variability > self.config.max_backlash_steps as f64 * 0.25
    }

    pub fn stats(&self) -> BacklashStats {
        let mut stats = BacklashStats {
            total_measurements: self.history.len(),
            total_compensations: self.compensation_count,
            ..Default::default()
        };
        if self.history.is_empty() {
            return stats;
        }
        let n = self.history.len() as f64;
        stats.average_inward = self
            .history
            .iter()
            .map(|m| m.inward_steps as f64)
            .sum::<f64>()
            / n;
        stats.average_outward = self
            .history
            .iter()
            .map(|m| m.outward_steps as f64)
            .sum::<f64>()
            / n;

        // Spread of the dominant (in + out) backlash across history.
        let totals: Vec<f64> = self
            .history
            .iter()
            .map(|m| (m.inward_steps + m.outward_steps) as f64)
            .collect();
        let mean = totals.iter().sum::<f64>() / n;
        let variance = totals.iter().map(|t| (t - mean) * (t - mean)).sum::<f64>() / n;
        stats.variability = variance.sqrt();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::*;
    use crate::focus_sampler::SamplerConfig;

    fn fast_sampler(shared: std::sync::Arc<std::sync::atomic::AtomicI32>,
                    optimum: i32) -> FocusSampler {
        let detector = VCurveDetector::new(shared, optimum, 0.08);
        FocusSampler::new(
            Box::new(SyntheticCamera::new()),
            Box::new(detector),
            None,
            SamplerConfig {
                settle_time: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    fn fast_config() -> BacklashConfig {
        BacklashConfig {
            settle_time: Duration::ZERO,
            ..Default::default()
        }
    }

    fn measurement(inward: i32, outward: i32, confidence: f64) -> BacklashMeasurement {
        BacklashMeasurement {
            timestamp: SystemTime::now(),
            inward_steps: inward,
            outward_steps: outward,
            confidence,
            method: "hysteresis".to_string(),
            data_points: vec![(0, 3.0), (10, 2.0), (20, 1.0), (30, 2.0), (40, 3.0)],
        }
    }

    #[test]
    fn test_measure_on_ideal_mechanics() {
        // A focuser without backlash: both passes find the same
        // minimum, so the measured backlash is zero.
        let (mut focuser, shared) = SyntheticFocuser::new(25000);
        let mut sampler = fast_sampler(shared, 25000);
        let mut compensator = BacklashCompensator::new(fast_config());

        let measurement = compensator.measure(&mut focuser, &mut sampler).unwrap();
        assert_eq!(measurement.inward_steps, 0);
        assert_eq!(measurement.outward_steps, 0);
        assert!(measurement.confidence >= 0.8);
        assert!(compensator.has_valid_measurement());
        // Both passes recorded: 11 points each.
        assert_eq!(measurement.data_points.len(), 22);
    }

    #[test]
    fn test_measurement_range_checked_against_limits() {
        let (mut focuser, shared) = SyntheticFocuser::new(50);
        focuser.limits = (0, 100_000);
        let mut sampler = fast_sampler(shared, 50);
        let mut compensator = BacklashCompensator::new(fast_config());
        // Sweep would go below the soft limit.
        assert!(compensator.measure(&mut focuser, &mut sampler).is_err());
    }

    #[test]
    fn test_sum_bounded_by_config() {
        let config = fast_config();
        let good = measurement(100, 60, 0.9);
        assert!(good.is_valid(&config));
        assert!(good.inward_steps + good.outward_steps
                <= 2 * config.max_backlash_steps);

        let bad = measurement(250, 0, 0.9);
        assert!(!bad.is_valid(&config));
    }

    #[test]
    fn test_direction_change_overshoots() {
        let (mut focuser, _) = SyntheticFocuser::new(25000);
        let mut compensator = BacklashCompensator::new(fast_config());
        compensator.set_measurement(measurement(40, 40, 0.9));

        // First move: no committed direction, goes direct.
        compensator.move_to(&mut focuser, 25200).unwrap();
        assert_eq!(focuser.position().unwrap(), 25200);
        assert_eq!(focuser.move_count, 1);

        // Same direction: direct again.
        compensator.move_to(&mut focuser, 25400).unwrap();
        assert_eq!(focuser.move_count, 2);

        // Direction change (inward): overshoot then return.
        compensator.move_to(&mut focuser, 25100).unwrap();
        assert_eq!(focuser.position().unwrap(), 25100);
        // Two physical moves for the compensated one.
        assert_eq!(focuser.move_count, 4);
        assert_eq!(compensator.stats().total_compensations, 1);

        // Now inward is committed; another inward move is direct.
        compensator.move_to(&mut focuser, 25000).unwrap();
        assert_eq!(focuser.move_count, 5);
    }

    #[test]
    fn test_no_compensation_without_measurement() {
        let (mut focuser, _) = SyntheticFocuser::new(25000);
        let mut compensator = BacklashCompensator::new(fast_config());
        compensator.move_to(&mut focuser, 25200).unwrap();
        compensator.move_to(&mut focuser, 25000).unwrap();
        // Both moves direct.
        assert_eq!(focuser.move_count, 2);
    }

    #[test]
    fn test_stats_and_remeasure() {
        let mut compensator = BacklashCompensator::new(fast_config());
        assert!(compensator.should_remeasure());

        compensator.set_measurement(measurement(30, 0, 0.9));
        compensator.set_measurement(measurement(34, 0, 0.9));
        let stats = compensator.stats();
        assert_eq!(stats.total_measurements, 2);
        assert!((stats.average_inward - 32.0).abs() < 1e-9);
        assert!(stats.variability < 5.0);
        assert!(!compensator.should_remeasure());
    }

}  // mod tests.
