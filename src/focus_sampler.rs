// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use canonical_error::{failed_precondition_error, CanonicalError};
use log::{debug, warn};
use medians::Medianf64;

use crate::devices::{wait_for_motion, Camera, Focuser, StarDetector, TemperatureSensor};

#[derive(Clone, Debug)]
pub struct SamplerConfig {
    /// Exposures averaged into one sample.
    pub exposures_per_sample: usize,

    pub exposure: Duration,
    pub binning: u32,

    // Reliability gates.
    pub min_stars: usize,
    pub max_hfr: f64,
    pub max_eccentricity: f64,

    /// Stars whose peak reaches this fraction of full scale count as
    /// saturated.
    pub saturation_fraction: f64,

    /// Maximum star radius in pixels; the frame-edge exclusion margin
    /// is twice this.
    pub max_star_radius: u32,

    pub move_timeout: Duration,
    pub settle_time: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            exposures_per_sample: 1,
            exposure: Duration::from_secs(2),
            binning: 1,
            min_stars: 5,
            max_hfr: 10.0,
            max_eccentricity: 0.8,
            saturation_fraction: 0.95,
            max_star_radius: 15,
            move_timeout: Duration::from_secs(30),
            settle_time: Duration::from_millis(500),
        }
    }
}

/// Focus quality banding from HFR and star count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FocusQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Bad,
}

/// Averaged focus metrics at one focuser position.
#[derive(Clone, Debug)]
pub struct FocusSample {
    pub position: i32,
    pub hfr: f64,
    pub fwhm: f64,
    pub star_count: usize,
    pub peak: f64,
    pub background: f64,
    pub eccentricity: f64,

    /// Celsius at sampling time, when a sensor is attached.
    pub temperature: Option<f64>,
    pub timestamp: SystemTime,
}

impl FocusSample {
    /// A sample is trustworthy for curve fitting when enough round,
    /// unsaturated stars away from the frame edge produced a sane HFR.
    pub fn is_reliable(&self, config: &SamplerConfig) -> bool {
        self.star_count >= config.min_stars
            && self.hfr > 0.0
            && self.hfr <= config.max_hfr
            && self.fwhm > 0.0
            && self.eccentricity <= config.max_eccentricity
    }

    pub fn quality(&self, config: &SamplerConfig) -> FocusQuality {
        if self.star_count < config.min_stars || self.hfr > 5.0 || self.hfr <= 0.0 {
            return FocusQuality::Bad;
        }
        match self.hfr {
            hfr if hfr < 2.0 => FocusQuality::Excellent,
            hfr if hfr < 3.0 => FocusQuality::Good,
            hfr if hfr < 4.0 => FocusQuality::Fair,
            _ => FocusQuality::Poor,
        }
    }
}

/// Running distribution of a sampled metric: a bounded ring of recent
/// values alongside whole-session statistics.
pub struct MetricStats {
    recent: VecDeque<f64>,
    capacity: usize,
    session: rolling_stats::Stats<f64>,
}

impl MetricStats {
    pub fn new(capacity: usize) -> Self {
        MetricStats {
            recent: VecDeque::new(),
            capacity: capacity.max(1),
            session: rolling_stats::Stats::<f64>::new(),
        }
    }

    pub fn add(&mut self, value: f64) {
        self.recent.push_back(value);
        while self.recent.len() > self.capacity {
            self.recent.pop_front();
        }
        self.session.update(value);
    }

    pub fn count(&self) -> usize {
        self.recent.len()
    }

    pub fn recent_mean(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }
        let values: Vec<f64> = self.recent.iter().copied().collect();
        Some(statistical::mean(&values))
    }

    pub fn recent_median(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }
        let values: Vec<f64> = self.recent.iter().copied().collect();
        Some(values.medf_unchecked())
    }

    pub fn recent_stddev(&self) -> Option<f64> {
        if self.recent.len() < 2 {
            return None;
        }
        let values: Vec<f64> = self.recent.iter().copied().collect();
        let mean = statistical::mean(&values);
        Some(statistical::standard_deviation(&values, Some(mean)))
    }

    /// (min, max, mean) since construction or the last reset.
    pub fn session_summary(&self) -> (f64, f64, f64) {
        (self.session.min, self.session.max, self.session.mean)
    }

    pub fn reset_session(&mut self) {
        self.session = rolling_stats::Stats::<f64>::new();
    }
}

/// Takes focus-quality samples: move to a position, wait for the
/// mechanics, expose N times, run star detection, and average the
/// per-star metrics across all exposures. Keeps a bounded history of
/// sampled HFR values for drift monitoring.
pub struct FocusSampler {
    camera: Box<dyn Camera>,
    detector: Box<dyn StarDetector>,
    sensor: Option<Box<dyn TemperatureSensor>>,
    pub config: SamplerConfig,
    pub hfr_stats: MetricStats,
}

impl FocusSampler {
    pub fn new(
        camera: Box<dyn Camera>,
        detector: Box<dyn StarDetector>,
        sensor: Option<Box<dyn TemperatureSensor>>,
        config: SamplerConfig,
    ) -> Self {
        FocusSampler {
            camera,
            detector,
            sensor,
            config,
            hfr_stats: MetricStats::new(100),
        }
    }

    /// Moves the focuser to `position` and samples there. The move is
    /// direct; callers wanting backlash compensation route the move
    /// through the compensator first and then call `sample_here`.
    pub fn sample_at(
        &mut self,
        focuser: &mut dyn Focuser,
        position: i32,
    ) -> Result<FocusSample, CanonicalError> {
        let (lo, hi) = focuser.limits();
        if position < lo || position > hi {
            return Err(failed_precondition_error(
                format!("Position {} outside limits {}..{}", position, lo, hi).as_str(),
            ));
        }
        focuser.move_to(position)?;
        wait_for_motion(focuser, self.config.move_timeout)?;
        if !self.config.settle_time.is_zero() {
            std::thread::sleep(self.config.settle_time);
        }
        self.sample_here(focuser)
    }

    /// Samples at the focuser's current position.
    pub fn sample_here(&mut self, focuser: &dyn Focuser) -> Result<FocusSample, CanonicalError> {
        self.sample_averaged(focuser, self.config.exposures_per_sample)
    }

    /// Samples with an explicit exposure count, for the ultra-fine
    /// sweep's heavier averaging.
    pub fn sample_averaged(
        &mut self,
        focuser: &dyn Focuser,
        exposures: usize,
    ) -> Result<FocusSample, CanonicalError> {
        let position = focuser.position()?;
        let exposures = exposures.max(1);

        let mut hfr_sum = 0.0;
        let mut fwhm_sum = 0.0;
        let mut peak_sum = 0.0;
        let mut background_sum = 0.0;
        let mut eccentricity_sum = 0.0;
        let mut star_count_sum = 0usize;
        let mut usable_exposures = 0usize;

        for i in 0..exposures {
            let frame = self
                .camera
                .expose(self.config.exposure, self.config.binning)?;
            let stars = self.detector.detect(&frame)?;

            let edge_margin = (self.config.max_star_radius * 2) as f64;
            let saturation = 65535.0 * self.config.saturation_fraction;
            let usable: Vec<_> = stars
                .iter()
                .filter(|star| {
                    star.peak < saturation
                        && star.x >= edge_margin
                        && star.x < frame.width as f64 - edge_margin
                        && star.y >= edge_margin
                        && star.y < frame.height as f64 - edge_margin
                })
                .collect();
            if usable.is_empty() {
                debug!("Exposure {} produced no usable stars", i);
                continue;
            }

            let n = usable.len() as f64;
            hfr_sum += usable.iter().map(|s| s.hfr).sum::<f64>() / n;
            fwhm_sum += usable.iter().map(|s| s.fwhm).sum::<f64>() / n;
            peak_sum += usable.iter().map(|s| s.peak).sum::<f64>() / n;
            background_sum += usable.iter().map(|s| s.background).sum::<f64>() / n;
            eccentricity_sum += usable.iter().map(|s| s.eccentricity).sum::<f64>() / n;
            star_count_sum += usable.len();
            usable_exposures += 1;
        }

        if usable_exposures == 0 {
            return Err(failed_precondition_error(
                format!("No usable stars at position {}", position).as_str(),
            ));
        }

        let n = usable_exposures as f64;
        self.hfr_stats.add(hfr_sum / n);
        let temperature = match &self.sensor {
            Some(sensor) => match sensor.read_celsius() {
                Ok(celsius) => Some(celsius),
                Err(e) => {
                    warn!("Temperature read failed: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(FocusSample {
            position,
            hfr: hfr_sum / n,
            fwhm: fwhm_sum / n,
            star_count: star_count_sum / usable_exposures,
            peak: peak_sum / n,
            background: background_sum / n,
            eccentricity: eccentricity_sum / n,
            temperature,
            timestamp: SystemTime::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;
    use crate::devices::testing::*;

    fn fast_config() -> SamplerConfig {
        SamplerConfig {
            settle_time: Duration::ZERO,
            exposure: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn sampler_for(optimum: i32, start: i32) -> (FocusSampler, SyntheticFocuser) {
        let (focuser, shared) = SyntheticFocuser::new(start);
        let detector = VCurveDetector::new(shared, optimum, 0.02);
        let sampler = FocusSampler::new(
            Box::new(SyntheticCamera::new()),
            Box::new(detector),
            Some(Box::new(FixedThermometer { celsius: 10.5 })),
            fast_config(),
        );
        (sampler, focuser)
    }

    #[test]
    fn test_sample_at_position() {
        let (mut sampler, mut focuser) = sampler_for(25000, 25000);
        let sample = sampler.sample_at(&mut focuser, 24900).unwrap();
        assert_eq!(sample.position, 24900);
        assert_abs_diff_eq!(sample.hfr, 3.0, epsilon = 1e-9);
        assert_eq!(sample.star_count, 20);
        assert_eq!(sample.temperature, Some(10.5));
        assert!(sample.is_reliable(&sampler.config));
    }

    #[test]
    fn test_position_outside_limits() {
        let (mut sampler, mut focuser) = sampler_for(25000, 25000);
        focuser.limits = (1000, 30000);
        assert!(sampler.sample_at(&mut focuser, 500).is_err());
        assert!(sampler.sample_at(&mut focuser, 30500).is_err());
    }

    #[test]
    fn test_reliability_gates() {
        let config = SamplerConfig::default();
        let mut sample = FocusSample {
            position: 0,
            hfr: 2.5,
            fwhm: 5.0,
            star_count: 12,
            peak: 20000.0,
            background: 800.0,
            eccentricity: 0.3,
            temperature: None,
            timestamp: SystemTime::now(),
        };
        assert!(sample.is_reliable(&config));

        sample.star_count = 2;
        assert!(!sample.is_reliable(&config));
        sample.star_count = 12;

        sample.hfr = 12.0;  // Beyond max_hfr.
        assert!(!sample.is_reliable(&config));
        sample.hfr = 2.5;

        sample.eccentricity = 0.95;
        assert!(!sample.is_reliable(&config));
    }

    #[test]
    fn test_quality_banding() {
        let config = SamplerConfig::default();
        let sample_with_hfr = |hfr: f64| FocusSample {
            position: 0,
            hfr,
            fwhm: hfr * 2.0,
            star_count: 15,
            peak: 20000.0,
            background: 800.0,
            eccentricity: 0.3,
            temperature: None,
            timestamp: SystemTime::now(),
        };
        assert_eq!(sample_with_hfr(1.5).quality(&config), FocusQuality::Excellent);
        assert_eq!(sample_with_hfr(2.5).quality(&config), FocusQuality::Good);
        assert_eq!(sample_with_hfr(3.5).quality(&config), FocusQuality::Fair);
        assert_eq!(sample_with_hfr(4.5).quality(&config), FocusQuality::Poor);
        assert_eq!(sample_with_hfr(6.0).quality(&config), FocusQuality::Bad);
    }

    #[test]
    fn test_metric_stats() {
        let mut stats = MetricStats::new(3);
        assert_eq!(stats.recent_mean(), None);
        assert_eq!(stats.recent_median(), None);

        for value in [2.0, 4.0, 6.0] {
            stats.add(value);
        }
        assert_abs_diff_eq!(stats.recent_mean().unwrap(), 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(stats.recent_median().unwrap(), 4.0, epsilon = 1e-9);
        assert!(stats.recent_stddev().unwrap() > 0.0);

        // Ring capacity: the oldest value falls out.
        stats.add(8.0);
        assert_eq!(stats.count(), 3);
        assert_abs_diff_eq!(stats.recent_mean().unwrap(), 6.0, epsilon = 1e-9);

        // Session stats survive the ring but not a reset.
        let (min, max, _) = stats.session_summary();
        assert_eq!(min, 2.0);
        assert_eq!(max, 8.0);
        stats.reset_session();
    }

    #[test]
    fn test_sampler_tracks_hfr_history() {
        let (mut sampler, mut focuser) = sampler_for(25000, 25000);
        sampler.sample_at(&mut focuser, 25000).unwrap();
        sampler.sample_at(&mut focuser, 24900).unwrap();
        assert_eq!(sampler.hfr_stats.count(), 2);
        assert_abs_diff_eq!(sampler.hfr_stats.recent_mean().unwrap(), 2.0,
                            epsilon = 1e-9);
    }

    #[test]
    fn test_detector_failure_propagates() {
        let (focuser, shared) = SyntheticFocuser::new(25000);
        let detector = VCurveDetector::new(shared, 25000, 0.02);
        *detector.fail_next.lock().unwrap() = 1;
        let mut sampler = FocusSampler::new(
            Box::new(SyntheticCamera::new()),
            Box::new(detector),
            None,
            fast_config(),
        );
        assert!(sampler.sample_here(&focuser).is_err());
    }

}  // mod tests.
