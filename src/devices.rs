// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, Instant};

use canonical_error::{deadline_exceeded_error, CanonicalError};

/// A monochrome frame as returned by the camera driver.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
    pub exposure: Duration,
    pub binning: u32,
}

/// Per-star measurement from the star detector.
#[derive(Clone, Debug, Default)]
pub struct StarMeasurement {
    // Centroid in full-resolution pixel coordinates.
    pub x: f64,
    pub y: f64,

    pub hfr: f64,
    pub fwhm: f64,

    pub peak: f64,
    pub background: f64,

    /// 0 is round; 1 is a line.
    pub eccentricity: f64,

    pub snr: f64,
}

/// Camera driver seam: expose for a duration at a binning, get a
/// frame back.
pub trait Camera: Send {
    fn expose(&mut self, exposure: Duration, binning: u32) -> Result<Frame, CanonicalError>;
}

/// Star detection seam. Implementations produce centroids and profile
/// metrics; this crate never looks at pixels itself.
pub trait StarDetector: Send {
    fn detect(&self, frame: &Frame) -> Result<Vec<StarMeasurement>, CanonicalError>;
}

/// Motorized focuser driver seam.
pub trait Focuser: Send {
    fn position(&self) -> Result<i32, CanonicalError>;

    /// Starts a move; completion is observed via `is_moving`.
    fn move_to(&mut self, position: i32) -> Result<(), CanonicalError>;

    fn is_moving(&self) -> Result<bool, CanonicalError>;

    fn abort(&mut self) -> Result<(), CanonicalError>;

    /// Soft limits (lo, hi).
    fn limits(&self) -> (i32, i32);
}

/// Optional ambient/optics temperature seam.
pub trait TemperatureSensor: Send {
    fn read_celsius(&self) -> Result<f64, CanonicalError>;
}

/// Blocks until the focuser reports motion complete, polling every
/// few milliseconds. Fails with a deadline error when `timeout`
/// elapses first.
pub fn wait_for_motion(focuser: &dyn Focuser, timeout: Duration) -> Result<(), CanonicalError> {
    let deadline = Instant::now() + timeout;
    loop {
        if !focuser.is_moving()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(deadline_exceeded_error(
                format!("Focuser still moving after {:?}", timeout).as_str(),
            ));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    /// Focuser double that moves instantly and publishes its position
    /// through a shared atomic so synthetic detectors can see it.
    pub struct SyntheticFocuser {
        pub shared_position: Arc<AtomicI32>,
        pub limits: (i32, i32),
        pub move_count: usize,
        pub fail_moves: bool,
    }

    impl SyntheticFocuser {
        pub fn new(start: i32) -> (Self, Arc<AtomicI32>) {
            let shared = Arc::new(AtomicI32::new(start));
            (
                SyntheticFocuser {
                    shared_position: shared.clone(),
                    limits: (0, 100_000),
                    move_count: 0,
                    fail_moves: false,
                },
                shared,
            )
        }
    }

    impl Focuser for SyntheticFocuser {
        fn position(&self) -> Result<i32, CanonicalError> {
            Ok(self.shared_position.load(Ordering::SeqCst))
        }

        fn move_to(&mut self, position: i32) -> Result<(), CanonicalError> {
            if self.fail_moves {
                return Err(canonical_error::aborted_error("Simulated motion fault"));
            }
            self.move_count += 1;
            self.shared_position.store(position, Ordering::SeqCst);
            Ok(())
        }

        fn is_moving(&self) -> Result<bool, CanonicalError> {
            Ok(false)
        }

        fn abort(&mut self) -> Result<(), CanonicalError> {
            Ok(())
        }

        fn limits(&self) -> (i32, i32) {
            self.limits
        }
    }

    /// Camera double producing empty frames.
    pub struct SyntheticCamera {
        pub exposures: usize,
    }

    impl SyntheticCamera {
        pub fn new() -> Self {
            SyntheticCamera { exposures: 0 }
        }
    }

    impl Camera for SyntheticCamera {
        fn expose(&mut self, exposure: Duration, binning: u32) -> Result<Frame, CanonicalError> {
            self.exposures += 1;
            Ok(Frame {
                width: 640,
                height: 480,
                data: vec![],
                exposure,
                binning,
            })
        }
    }

    /// Detector double that synthesizes a V-curve: HFR rises linearly
    /// with distance from the optimum position published by the
    /// focuser double.
    pub struct VCurveDetector {
        pub shared_position: Arc<AtomicI32>,
        pub optimum: i32,
        pub slope: f64,
        pub star_count: usize,
        pub fail_next: std::sync::Mutex<usize>,
    }

    impl VCurveDetector {
        pub fn new(shared_position: Arc<AtomicI32>, optimum: i32, slope: f64) -> Self {
            VCurveDetector {
                shared_position,
                optimum,
                slope,
                star_count: 20,
                fail_next: std::sync::Mutex::new(0),
            }
        }

        pub fn hfr_at(&self, position: i32) -> f64 {
            1.0 + self.slope * (position - self.optimum).abs() as f64
        }
    }

    impl StarDetector for VCurveDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<StarMeasurement>, CanonicalError> {
            {
                let mut fail_next = self.fail_next.lock().unwrap();
                if *fail_next > 0 {
                    *fail_next -= 1;
                    return Err(canonical_error::internal_error("Simulated detect fault"));
                }
            }
            let position = self.shared_position.load(Ordering::SeqCst);
            let hfr = self.hfr_at(position);
            let star = StarMeasurement {
                x: 320.0,
                y: 240.0,
                hfr,
                fwhm: hfr * 2.0,
                peak: 20_000.0,
                background: 800.0,
                eccentricity: 0.3,
                snr: 25.0,
            };
            Ok(vec![star; self.star_count])
        }
    }

    /// Temperature double with a settable reading.
    pub struct FixedThermometer {
        pub celsius: f64,
    }

    impl TemperatureSensor for FixedThermometer {
        fn read_celsius(&self) -> Result<f64, CanonicalError> {
            Ok(self.celsius)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_wait_for_motion_immediate() {
        let (focuser, _) = SyntheticFocuser::new(1000);
        wait_for_motion(&focuser, Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_synthetic_v_curve_shape() {
        let (mut focuser, shared) = SyntheticFocuser::new(25000);
        let detector = VCurveDetector::new(shared, 25000, 0.02);
        assert_eq!(detector.hfr_at(25000), 1.0);
        assert!((detector.hfr_at(25100) - 3.0).abs() < 1e-9);

        focuser.move_to(24900).unwrap();
        let frame = Frame::default();
        let stars = detector.detect(&frame).unwrap();
        assert_eq!(stars.len(), 20);
        assert!((stars[0].hfr - 3.0).abs() < 1e-9);
    }

}  // mod tests.
