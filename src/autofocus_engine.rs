// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::{failed_precondition_error, CanonicalError};
use log::{debug, info, warn};

use crate::backlash::BacklashCompensator;
use crate::devices::{wait_for_motion, Focuser};
use crate::focus_curve::{AutofocusAlgorithm, AutofocusMode, CurveAnalyzer, FocusCurve};
use crate::focus_sampler::{FocusSample, FocusSampler};
use crate::temp_compensation::TemperatureCompensator;

#[derive(Clone, Debug)]
pub struct AutofocusConfig {
    pub mode: AutofocusMode,
    pub algorithm: AutofocusAlgorithm,

    /// Zero means "use the mode default".
    pub exposure_time: Duration,
    pub step_size: i32,
    pub max_steps: usize,

    /// Convergence tolerance for iterative refinement, as a fraction
    /// of the coarse step.
    pub tolerance: f64,

    pub binning: u32,
    pub backlash_compensation: bool,
    pub temperature_compensation: bool,
    pub min_stars: usize,
    pub max_iterations: usize,

    /// Coarse sweep stride: 2 visits every second point.
    pub coarse_stride: usize,
}

impl Default for AutofocusConfig {
    fn default() -> Self {
        AutofocusConfig {
            mode: AutofocusMode::Full,
            algorithm: AutofocusAlgorithm::VCurve,
            exposure_time: Duration::ZERO,
            step_size: 0,
            max_steps: 0,
            tolerance: 0.1,
            binning: 1,
            backlash_compensation: true,
            temperature_compensation: false,
            min_stars: 5,
            max_iterations: 3,
            coarse_stride: 1,
        }
    }
}

/// The autofocus run orchestrator: coarse sweep, fine sweep, optional
/// ultra-fine sweep, curve analysis, and the final move. Sampling and
/// motion are strictly sequential.
///
/// Error policy: a failed sample skips that position unless two
/// consecutive samples fail; motion faults abort immediately. On any
/// failed run the focuser is returned to its pre-run position.
pub struct AutofocusEngine {
    focuser: Box<dyn Focuser>,
    sampler: FocusSampler,
    backlash: BacklashCompensator,
    temperature: Option<TemperatureCompensator>,
    config: AutofocusConfig,
}

impl AutofocusEngine {
    pub fn new(
        focuser: Box<dyn Focuser>,
        sampler: FocusSampler,
        backlash: BacklashCompensator,
        temperature: Option<TemperatureCompensator>,
        config: AutofocusConfig,
    ) -> Self {
        AutofocusEngine {
            focuser,
            sampler,
            backlash,
            temperature,
            config,
        }
    }

    /// Runs a full autofocus and leaves the focuser at the best
    /// position found.
    pub fn run(&mut self) -> Result<FocusCurve, CanonicalError> {
        let (mode_exposure, mode_step, mode_points) = self.config.mode.defaults();
        let exposure = if self.config.exposure_time.is_zero() {
            mode_exposure
        } else {
            self.config.exposure_time
        };
        let step = if self.config.step_size == 0 {
            mode_step
        } else {
            self.config.step_size
        };
        let points = if self.config.max_steps == 0 {
            mode_points
        } else {
            self.config.max_steps
        };

        self.sampler.config.exposure = exposure;
        self.sampler.config.binning = self.config.binning;
        self.sampler.config.min_stars = self.config.min_stars;

        let start_position = self.focuser.position()?;
        info!(
            "Autofocus start: mode={:?} algorithm={} from position {}",
            self.config.mode, self.config.algorithm.as_str(), start_position);

        match self.run_sweeps(start_position, step, points) {
            Ok(curve) => Ok(curve),
            Err(e) => {
                // Leave the mechanics where the run found them.
                warn!("Autofocus failed ({}), returning to {}", e, start_position);
                if let Err(restore) = self.move_to(start_position) {
                    warn!("Restore move also failed: {}", restore);
                }
                Err(e)
            }
        }
    }

    fn run_sweeps(
        &mut self,
        start_position: i32,
        step: i32,
        points: usize,
    ) -> Result<FocusCurve, CanonicalError> {
        // Coarse sweep across the full range around the start.
        let half_span = (points as i32 / 2) * step;
        let stride = self.config.coarse_stride.max(1) as i32;
        let coarse_positions = sweep_positions(
            start_position - half_span,
            start_position + half_span,
            step * stride,
        );
        let coarse = self.sweep(&coarse_positions, 1)?;
        let coarse_best = best_position(&coarse).ok_or_else(|| {
            failed_precondition_error("Coarse sweep produced no usable samples")
        })?;
        debug!("Coarse sweep minimum at {}", coarse_best);

        // Fine sweep around the coarse minimum.
        let fine_step = (step / 5).max(1);
        let analyzer = CurveAnalyzer::new(self.sampler.config.clone());
        let mut center = coarse_best;
        let mut curve;
        let mut iteration = 0;
        loop {
            let fine_positions = sweep_positions(center - step, center + step, fine_step);
            let mut fine = self.sweep(&fine_positions, 1)?;

            // Ultra-fine pass with heavier averaging in high
            // precision mode.
            if self.config.mode == AutofocusMode::HighPrecision {
                let ultra_step = (fine_step / 4).max(1);
                let provisional = best_position(&fine).unwrap_or(center);
                let ultra_positions = sweep_positions(
                    provisional - fine_step,
                    provisional + fine_step,
                    ultra_step,
                );
                let ultra = self.sweep(&ultra_positions, 3)?;
                fine.extend(ultra);
                fine.sort_by_key(|s| s.position);
                fine.dedup_by_key(|s| s.position);
            }

            curve = analyzer.analyze(&fine, self.config.algorithm);
            iteration += 1;

            let tolerance_steps =
                ((self.config.tolerance * step as f64).round() as i32).max(fine_step);
            let converged = (curve.best_position - center).abs() <= tolerance_steps;
            if converged || iteration >= self.config.max_iterations.max(1) {
                break;
            }
            debug!(
                "Iteration {}: best moved {} -> {}, refining",
                iteration, center, curve.best_position);
            center = curve.best_position;
        }

        if !curve.is_valid(self.focuser.limits()) {
            return Err(failed_precondition_error(
                format!(
                    "Focus curve failed validation (confidence {:.2}, {} samples)",
                    curve.confidence,
                    curve.samples.len()
                )
                .as_str(),
            ));
        }

        self.move_to(curve.best_position)?;
        info!(
            "Autofocus complete: position {} confidence {:.2}",
            curve.best_position, curve.confidence);

        // Seed the temperature baseline at the new best focus.
        if self.config.temperature_compensation {
            if let Some(sample) = curve.samples.last() {
                if let (Some(compensator), Some(celsius)) =
                    (self.temperature.as_mut(), sample.temperature)
                {
                    compensator.add_reading(celsius, curve.best_position);
                }
            }
        }

        Ok(curve)
    }

    /// Samples each position in order. A sampler failure skips the
    /// position; two consecutive failures or any motion fault abort.
    fn sweep(
        &mut self,
        positions: &[i32],
        exposures: usize,
    ) -> Result<Vec<FocusSample>, CanonicalError> {
        let mut samples = vec![];
        let mut consecutive_failures = 0;
        for &position in positions {
            self.move_to(position)?;
            match self.sampler.sample_averaged(self.focuser.as_ref(), exposures) {
                Ok(sample) => {
                    consecutive_failures = 0;
                    samples.push(sample);
                }
                Err(e) => {
                    // Motion faults surfaced from move_to above are
                    // fatal; a detection problem is worth one skip.
                    consecutive_failures += 1;
                    warn!("Sample at {} failed ({}), skipping", position, e);
                    if consecutive_failures >= 2 {
                        return Err(failed_precondition_error(
                            "Two consecutive sample failures",
                        ));
                    }
                }
            }
        }
        Ok(samples)
    }

    fn move_to(&mut self, position: i32) -> Result<(), CanonicalError> {
        let (lo, hi) = self.focuser.limits();
        let clamped = position.clamp(lo, hi);
        if self.config.backlash_compensation {
            self.backlash.move_to(self.focuser.as_mut(), clamped)
        } else {
            self.focuser.move_to(clamped)?;
            wait_for_motion(self.focuser.as_ref(), Duration::from_secs(30))
        }
    }

    /// Measures backlash with the engine's own sampler.
    pub fn measure_backlash(&mut self) -> Result<(), CanonicalError> {
        self.backlash
            .measure(self.focuser.as_mut(), &mut self.sampler)
            .map(|_| ())
    }

    /// Feeds an external temperature reading and applies a
    /// compensation move when warranted. Returns the steps moved.
    /// Serialized against sampling by virtue of `&mut self`.
    pub fn check_temperature(&mut self, celsius: f64) -> Result<Option<i32>, CanonicalError> {
        let compensator = match self.temperature.as_mut() {
            Some(compensator) => compensator,
            None => return Ok(None),
        };
        let position = self.focuser.position()?;
        compensator.add_reading(celsius, position);
        let steps = match compensator.compensation_steps(celsius) {
            Some(steps) => steps,
            None => return Ok(None),
        };
        self.move_to(position + steps)?;
        if let Some(compensator) = self.temperature.as_mut() {
            compensator.record_compensation(celsius, steps, "automatic");
        }
        info!("Temperature compensation moved {} steps", steps);
        Ok(Some(steps))
    }

    pub fn config(&self) -> &AutofocusConfig {
        &self.config
    }

    pub fn backlash(&self) -> &BacklashCompensator {
        &self.backlash
    }

    pub fn temperature(&self) -> Option<&TemperatureCompensator> {
        self.temperature.as_ref()
    }
}

fn sweep_positions(from: i32, to: i32, step: i32) -> Vec<i32> {
    let mut positions = vec![];
    let mut position = from;
    while position <= to {
        positions.push(position);
        position += step.max(1);
    }
    positions
}

fn best_position(samples: &[FocusSample]) -> Option<i32> {
    samples
        .iter()
        .min_by(|a, b| a.hfr.total_cmp(&b.hfr))
        .map(|s| s.position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlash::BacklashConfig;
    use crate::devices::testing::*;
    use crate::focus_sampler::SamplerConfig;
    use crate::temp_compensation::TempCompConfig;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    struct Rig {
        engine: AutofocusEngine,
        shared: Arc<std::sync::atomic::AtomicI32>,
    }

    fn rig(optimum: i32, start: i32, config: AutofocusConfig, fail_detects: usize) -> Rig {
        let (focuser, shared) = SyntheticFocuser::new(start);
        let detector = VCurveDetector::new(shared.clone(), optimum, 0.02);
        *detector.fail_next.lock().unwrap() = fail_detects;
        let sampler = FocusSampler::new(
            Box::new(SyntheticCamera::new()),
            Box::new(detector),
            Some(Box::new(FixedThermometer { celsius: 12.0 })),
            SamplerConfig {
                settle_time: Duration::ZERO,
                ..Default::default()
            },
        );
        let backlash = BacklashCompensator::new(BacklashConfig {
            settle_time: Duration::ZERO,
            ..Default::default()
        });
        let temperature = TemperatureCompensator::new(TempCompConfig {
            coefficient: 10.0,
            ..Default::default()
        });
        Rig {
            engine: AutofocusEngine::new(
                Box::new(focuser),
                sampler,
                backlash,
                Some(temperature),
                config,
            ),
            shared,
        }
    }

    fn scenario_config() -> AutofocusConfig {
        AutofocusConfig {
            step_size: 100,
            max_steps: 10,
            backlash_compensation: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_v_curve_run_finds_optimum() {
        // Synthetic sampler: HFR(p) = 1.0 + 0.02 |p - 25000| over
        // [24500, 25500], coarse step 100, fine step 20.
        let mut rig = rig(25000, 25000, scenario_config(), 0);
        let curve = rig.engine.run().unwrap();
        assert!(
            (24980..=25020).contains(&curve.best_position),
            "best {}", curve.best_position
        );
        assert!(curve.confidence >= 0.9);
        assert_eq!(rig.shared.load(Ordering::SeqCst), curve.best_position);
    }

    #[test]
    fn test_off_center_start_still_converges() {
        let mut rig = rig(25000, 24800, scenario_config(), 0);
        let curve = rig.engine.run().unwrap();
        assert!((24980..=25020).contains(&curve.best_position),
                "best {}", curve.best_position);
    }

    #[test]
    fn test_hyperbolic_algorithm() {
        let mut config = scenario_config();
        config.algorithm = AutofocusAlgorithm::Hyperbolic;
        let mut rig = rig(25000, 25000, config, 0);
        let curve = rig.engine.run().unwrap();
        assert!((24980..=25020).contains(&curve.best_position),
                "best {}", curve.best_position);
        assert!(curve.confidence >= 0.6);
    }

    #[test]
    fn test_single_sample_failure_is_skipped() {
        let mut rig = rig(25000, 25000, scenario_config(), 1);
        let curve = rig.engine.run().unwrap();
        assert!((24980..=25020).contains(&curve.best_position));
        // The failed coarse sample did not poison the fine sweep.
        assert!(curve.samples.len() >= 9);
    }

    #[test]
    fn test_consecutive_failures_abort_and_restore() {
        let start = 25000;
        let mut rig = rig(25000, start, scenario_config(), 50);
        assert!(rig.engine.run().is_err());
        // The focuser came back to the pre-run position.
        assert_eq!(rig.shared.load(Ordering::SeqCst), start);
    }

    #[test]
    fn test_motion_fault_is_fatal() {
        let (mut focuser, shared) = SyntheticFocuser::new(25000);
        focuser.fail_moves = true;
        let detector = VCurveDetector::new(shared, 25000, 0.02);
        let sampler = FocusSampler::new(
            Box::new(SyntheticCamera::new()),
            Box::new(detector),
            None,
            SamplerConfig {
                settle_time: Duration::ZERO,
                ..Default::default()
            },
        );
        let mut engine = AutofocusEngine::new(
            Box::new(focuser),
            sampler,
            BacklashCompensator::new(BacklashConfig {
                settle_time: Duration::ZERO,
                ..Default::default()
            }),
            None,
            scenario_config(),
        );
        assert!(engine.run().is_err());
    }

    #[test]
    fn test_high_precision_mode_averages_more() {
        let mut config = scenario_config();
        config.mode = AutofocusMode::HighPrecision;
        config.step_size = 100;
        config.max_steps = 10;
        let mut rig = rig(25000, 25000, config, 0);
        let curve = rig.engine.run().unwrap();
        assert!((24980..=25020).contains(&curve.best_position));
        // Ultra pass adds samples beyond the fine grid alone.
        assert!(curve.samples.len() > 11);
    }

    #[test]
    fn test_temperature_compensation_move() {
        let mut config = scenario_config();
        config.temperature_compensation = true;
        let mut rig = rig(25000, 25000, config, 0);
        rig.engine.run().unwrap();

        // Baseline was seeded during the run at 12.0 C. A 2-degree
        // drop at 10 steps/C moves the focuser -20 steps.
        let best = rig.shared.load(Ordering::SeqCst);
        let moved = rig.engine.check_temperature(10.0).unwrap();
        assert_eq!(moved, Some(-20));
        assert_eq!(rig.shared.load(Ordering::SeqCst), best - 20);

        // Within the dead band: no move.
        assert_eq!(rig.engine.check_temperature(10.2).unwrap(), None);
    }

    #[test]
    fn test_mode_defaults_drive_sweep_span() {
        // Quick mode: step 150, 15 points.
        let config = AutofocusConfig {
            mode: AutofocusMode::Quick,
            backlash_compensation: false,
            ..Default::default()
        };
        let mut rig = rig(25000, 25000, config, 0);
        let curve = rig.engine.run().unwrap();
        assert!((24980..=25020).contains(&curve.best_position));
    }

}  // mod tests.
