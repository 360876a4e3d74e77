//! Fake location synthesis.
//!
//! Everything here is pure: the only non-determinism is the random draw for
//! the jitter, and the generator is passed in by the caller.

use std::f64::consts::TAU;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::prefs::PreferenceSnapshot;

/// Metres per degree of latitude, and per degree of longitude at the equator.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

/// A synthesized location. `None` fields keep the platform's real value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FakeLocation {
    pub coordinate: Coordinate,
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub vertical_accuracy: Option<f32>,
    pub speed: Option<f32>,
    pub speed_accuracy: Option<f32>,
    pub msl_altitude: Option<f64>,
    pub msl_altitude_accuracy: Option<f32>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SynthError {
    #[error("base coordinate ({0}, {1}) is not finite")]
    NonFiniteBase(f64, f64),
    #[error("randomize radius {0} is not finite")]
    NonFiniteRadius(f64),
    #[error("displaced coordinate ({0}, {1}) is not finite")]
    NonFiniteResult(f64, f64),
}

/// Displaces `base` by a point drawn uniformly over the disc of `radius_m`
/// metres around it.
///
/// Metres are turned into degrees with a flat-earth local approximation:
/// a fixed [`METERS_PER_DEGREE`] for latitude and the same scaled by
/// `cos(latitude)` for longitude. The companion app caps the radius at 2 km,
/// where the error against a great-circle offset is negligible. Nothing is
/// wrapped at the poles or the antimeridian.
pub fn randomize<R: Rng + ?Sized>(
    base: Coordinate,
    radius_m: f64,
    rng: &mut R,
) -> Result<Coordinate, SynthError> {
    if !base.is_finite() {
        return Err(SynthError::NonFiniteBase(base.latitude, base.longitude));
    }
    if !radius_m.is_finite() {
        return Err(SynthError::NonFiniteRadius(radius_m));
    }
    if radius_m <= 0.0 {
        return Ok(base);
    }

    // sqrt keeps the density uniform over the disc area
    let distance = radius_m * rng.random::<f64>().sqrt();
    let bearing = rng.random::<f64>() * TAU;

    let d_lat = distance * bearing.cos() / METERS_PER_DEGREE;
    let d_lon = distance * bearing.sin() / (METERS_PER_DEGREE * base.latitude.to_radians().cos());

    let moved = Coordinate::new(base.latitude + d_lat, base.longitude + d_lon);
    if !moved.is_finite() {
        return Err(SynthError::NonFiniteResult(moved.latitude, moved.longitude));
    }
    Ok(moved)
}

/// Distance in metres under the same approximation [`randomize`] uses,
/// measured from `from`.
pub fn equirectangular_distance_m(from: Coordinate, to: Coordinate) -> f64 {
    let dy = (to.latitude - from.latitude) * METERS_PER_DEGREE;
    let dx = (to.longitude - from.longitude) * METERS_PER_DEGREE * from.latitude.to_radians().cos();
    dx.hypot(dy)
}

/// Builds the fake location for one intercepted call.
pub fn synthesize<R: Rng + ?Sized>(
    base: Coordinate,
    snapshot: &PreferenceSnapshot,
    rng: &mut R,
) -> Result<FakeLocation, SynthError> {
    let coordinate = match snapshot.randomize.active() {
        Some(radius) => randomize(base, radius, rng)?,
        None if base.is_finite() => base,
        None => return Err(SynthError::NonFiniteBase(base.latitude, base.longitude)),
    };

    Ok(FakeLocation {
        coordinate,
        accuracy: snapshot.accuracy.active(),
        altitude: snapshot.altitude.active(),
        vertical_accuracy: snapshot.vertical_accuracy.active(),
        speed: snapshot.speed.active(),
        speed_accuracy: snapshot.speed_accuracy.active(),
        msl_altitude: snapshot.mean_sea_level.active(),
        msl_altitude_accuracy: snapshot.mean_sea_level_accuracy.active(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::Override;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const NYC: Coordinate = Coordinate {
        latitude: 40.7128,
        longitude: -74.0060,
    };

    fn playing() -> PreferenceSnapshot {
        PreferenceSnapshot {
            is_playing: true,
            base: Some(NYC),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_flags_keeps_base_and_leaves_fields_unset() {
        let mut rng = StdRng::seed_from_u64(1);
        let fake = synthesize(NYC, &playing(), &mut rng).unwrap();
        assert_eq!(fake.coordinate, NYC);
        assert_eq!(
            fake,
            FakeLocation {
                coordinate: NYC,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_only_flagged_fields_are_set() {
        let mut snapshot = playing();
        snapshot.altitude = Override::new(true, 120.5);
        snapshot.speed = Override::new(false, 12.0);
        snapshot.mean_sea_level = Override::new(true, -400.0);

        let mut rng = StdRng::seed_from_u64(2);
        let fake = synthesize(NYC, &snapshot, &mut rng).unwrap();
        assert_eq!(fake.altitude, Some(120.5));
        assert_eq!(fake.msl_altitude, Some(-400.0));
        assert_eq!(fake.speed, None);
        assert_eq!(fake.accuracy, None);
    }

    #[test]
    fn test_zero_radius_is_identity() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            assert_eq!(randomize(NYC, 0.0, &mut rng).unwrap(), NYC);
        }
        let mut snapshot = playing();
        snapshot.randomize = Override::new(true, 0.0);
        assert_eq!(synthesize(NYC, &snapshot, &mut rng).unwrap().coordinate, NYC);
    }

    #[test]
    fn test_negative_radius_is_identity() {
        let mut rng = StdRng::seed_from_u64(4);
        assert_eq!(randomize(NYC, -5.0, &mut rng).unwrap(), NYC);
    }

    #[test]
    fn test_randomized_points_stay_within_radius() {
        let mut rng = StdRng::seed_from_u64(0x6770_7372);
        for radius in [1.0, 100.0, 2000.0] {
            for _ in 0..1000 {
                let point = randomize(NYC, radius, &mut rng).unwrap();
                let distance = equirectangular_distance_m(NYC, point);
                assert!(distance <= radius + 1e-6, "{distance} > {radius}");
            }
        }
    }

    #[test]
    fn test_randomize_100m_scenario() {
        let mut snapshot = playing();
        snapshot.randomize = Override::new(true, 100.0);

        let mut rng = StdRng::seed_from_u64(42);
        let mut total = 0.0;
        for _ in 0..1000 {
            let fake = synthesize(NYC, &snapshot, &mut rng).unwrap();
            let distance = equirectangular_distance_m(NYC, fake.coordinate);
            assert!(distance <= 100.0 + 1e-6);
            total += distance;
        }
        let mean = total / 1000.0;
        // uniform over the disc: expected mean is 2r/3
        assert!(mean > 50.0 && mean < 80.0, "mean displacement {mean}");
    }

    #[test]
    fn test_randomize_reaches_all_quadrants() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = [false; 4];
        for _ in 0..1000 {
            let p = randomize(NYC, 50.0, &mut rng).unwrap();
            let north = p.latitude > NYC.latitude;
            let east = p.longitude > NYC.longitude;
            seen[(north as usize) << 1 | east as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_non_finite_inputs_fail() {
        let mut rng = StdRng::seed_from_u64(5);
        let nan_base = Coordinate::new(f64::NAN, 1.0);
        assert!(matches!(
            synthesize(nan_base, &playing(), &mut rng),
            Err(SynthError::NonFiniteBase(..))
        ));
        assert_eq!(
            randomize(NYC, f64::INFINITY, &mut rng),
            Err(SynthError::NonFiniteRadius(f64::INFINITY))
        );
    }

    #[test]
    fn test_out_of_range_base_is_still_deterministic() {
        let base = Coordinate::new(123.0, 400.0);
        let mut rng = StdRng::seed_from_u64(6);
        assert_eq!(synthesize(base, &playing(), &mut rng).unwrap().coordinate, base);

        let mut snapshot = playing();
        snapshot.randomize = Override::new(true, 10.0);
        let a = synthesize(base, &snapshot, &mut StdRng::seed_from_u64(9)).unwrap();
        let b = synthesize(base, &snapshot, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a, b);
    }
}
