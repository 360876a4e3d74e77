//! Spoofing preferences shared with the companion app.
//!
//! The companion app owns the preference file and is the only writer. This
//! side keeps a last-known-good [`PreferenceSnapshot`] and re-reads the file
//! on every intercepted call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use thiserror::Error;

use crate::synth::Coordinate;

/// Preference keys written by the companion app.
pub mod keys {
    pub const IS_PLAYING: &str = "is_playing";
    pub const LAST_CLICKED_LOCATION: &str = "last_clicked_location";
    pub const USE_ACCURACY: &str = "use_accuracy";
    pub const ACCURACY: &str = "accuracy";
    pub const USE_ALTITUDE: &str = "use_altitude";
    pub const ALTITUDE: &str = "altitude";
    pub const USE_VERTICAL_ACCURACY: &str = "use_vertical_accuracy";
    pub const VERTICAL_ACCURACY: &str = "vertical_accuracy";
    pub const USE_SPEED: &str = "use_speed";
    pub const SPEED: &str = "speed";
    pub const USE_SPEED_ACCURACY: &str = "use_speed_accuracy";
    pub const SPEED_ACCURACY: &str = "speed_accuracy";
    pub const USE_MEAN_SEA_LEVEL: &str = "use_mean_sea_level";
    pub const MEAN_SEA_LEVEL: &str = "mean_sea_level";
    pub const USE_MEAN_SEA_LEVEL_ACCURACY: &str = "use_mean_sea_level_accuracy";
    pub const MEAN_SEA_LEVEL_ACCURACY: &str = "mean_sea_level_accuracy";
    pub const USE_RANDOMIZE: &str = "use_randomize";
    pub const RANDOMIZE_RADIUS: &str = "randomize_radius";
    pub const USE_SYSTEM_HOOK: &str = "use_system_hook";
}

/// A typed entry as stored by `SharedPreferences`.
#[derive(Debug, Clone, PartialEq)]
pub enum PrefValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    String(String),
}

impl PrefValue {
    fn type_name(&self) -> &'static str {
        match self {
            PrefValue::Bool(_) => "boolean",
            PrefValue::Int(_) => "int",
            PrefValue::Long(_) => "long",
            PrefValue::Float(_) => "float",
            PrefValue::String(_) => "string",
        }
    }
}

pub type PrefMap = HashMap<String, PrefValue>;

#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("cannot read preference file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed preference file: {0}")]
    Xml(String),
    #[error("preference `{key}` holds a {found}, expected a {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("preference `{key}` has unparsable value `{value}`")]
    BadValue { key: String, value: String },
    #[error("malformed last clicked location: {0}")]
    BaseLocation(#[from] serde_json::Error),
}

/// Encodes a double the way the companion app stores it: the raw IEEE 754
/// bit pattern under a `long` entry.
pub fn encode_double(value: f64) -> i64 {
    value.to_bits() as i64
}

pub fn decode_double(bits: i64) -> f64 {
    f64::from_bits(bits as u64)
}

/// One optional override: the value only applies while `enabled` is set.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Override<T> {
    pub enabled: bool,
    pub value: T,
}

impl<T: Copy> Override<T> {
    pub fn new(enabled: bool, value: T) -> Self {
        Self { enabled, value }
    }

    /// The override value, or `None` when the real platform value must be kept.
    pub fn active(&self) -> Option<T> {
        self.enabled.then_some(self.value)
    }
}

/// Spoofing configuration at one point in time.
///
/// Missing keys fall back to the companion app's defaults: every flag off,
/// every value zero, no base coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PreferenceSnapshot {
    pub is_playing: bool,
    /// Last point picked in the companion app, `None` until one was picked.
    pub base: Option<Coordinate>,
    pub accuracy: Override<f64>,
    pub altitude: Override<f64>,
    pub vertical_accuracy: Override<f32>,
    pub speed: Override<f32>,
    pub speed_accuracy: Override<f32>,
    pub mean_sea_level: Override<f64>,
    pub mean_sea_level_accuracy: Override<f32>,
    /// Jitter radius in metres.
    pub randomize: Override<f64>,
    pub use_system_hook: bool,
}

impl PreferenceSnapshot {
    /// Builds a snapshot from raw entries. Any known key holding the wrong
    /// type or an unparsable value rejects the whole map.
    pub fn from_map(map: &PrefMap) -> Result<Self, PrefsError> {
        let base = match map.get(keys::LAST_CLICKED_LOCATION) {
            None => None,
            Some(PrefValue::String(json)) => Some(serde_json::from_str::<Coordinate>(json)?),
            Some(other) => return Err(wrong_type(keys::LAST_CLICKED_LOCATION, "string", other)),
        };

        Ok(Self {
            is_playing: get_bool(map, keys::IS_PLAYING)?,
            base,
            accuracy: Override::new(
                get_bool(map, keys::USE_ACCURACY)?,
                get_double(map, keys::ACCURACY)?,
            ),
            altitude: Override::new(
                get_bool(map, keys::USE_ALTITUDE)?,
                get_double(map, keys::ALTITUDE)?,
            ),
            vertical_accuracy: Override::new(
                get_bool(map, keys::USE_VERTICAL_ACCURACY)?,
                get_float(map, keys::VERTICAL_ACCURACY)?,
            ),
            speed: Override::new(get_bool(map, keys::USE_SPEED)?, get_float(map, keys::SPEED)?),
            speed_accuracy: Override::new(
                get_bool(map, keys::USE_SPEED_ACCURACY)?,
                get_float(map, keys::SPEED_ACCURACY)?,
            ),
            mean_sea_level: Override::new(
                get_bool(map, keys::USE_MEAN_SEA_LEVEL)?,
                get_double(map, keys::MEAN_SEA_LEVEL)?,
            ),
            mean_sea_level_accuracy: Override::new(
                get_bool(map, keys::USE_MEAN_SEA_LEVEL_ACCURACY)?,
                get_float(map, keys::MEAN_SEA_LEVEL_ACCURACY)?,
            ),
            randomize: Override::new(
                get_bool(map, keys::USE_RANDOMIZE)?,
                get_double(map, keys::RANDOMIZE_RADIUS)?,
            ),
            use_system_hook: get_bool(map, keys::USE_SYSTEM_HOOK)?,
        })
    }

    /// Base coordinate used for synthesis; (0, 0) when none was picked yet.
    pub fn base_coordinate(&self) -> Coordinate {
        self.base.unwrap_or_default()
    }

    /// Bitwise equality. Unlike `==`, a snapshot holding a NaN value is the
    /// same as itself.
    pub fn same_as(&self, other: &Self) -> bool {
        self.bits() == other.bits()
    }

    fn bits(&self) -> [u64; 21] {
        let (has_base, base) = match self.base {
            Some(base) => (1, base),
            None => (0, Coordinate::default()),
        };
        [
            self.is_playing as u64,
            has_base,
            base.latitude.to_bits(),
            base.longitude.to_bits(),
            self.accuracy.enabled as u64,
            self.accuracy.value.to_bits(),
            self.altitude.enabled as u64,
            self.altitude.value.to_bits(),
            self.vertical_accuracy.enabled as u64,
            self.vertical_accuracy.value.to_bits() as u64,
            self.speed.enabled as u64,
            self.speed.value.to_bits() as u64,
            self.speed_accuracy.enabled as u64,
            self.speed_accuracy.value.to_bits() as u64,
            self.mean_sea_level.enabled as u64,
            self.mean_sea_level.value.to_bits(),
            self.mean_sea_level_accuracy.enabled as u64,
            self.mean_sea_level_accuracy.value.to_bits() as u64,
            self.randomize.enabled as u64,
            self.randomize.value.to_bits(),
            self.use_system_hook as u64,
        ]
    }
}

fn wrong_type(key: &str, expected: &'static str, found: &PrefValue) -> PrefsError {
    PrefsError::WrongType {
        key: key.to_string(),
        expected,
        found: found.type_name(),
    }
}

fn get_bool(map: &PrefMap, key: &str) -> Result<bool, PrefsError> {
    match map.get(key) {
        None => Ok(false),
        Some(PrefValue::Bool(value)) => Ok(*value),
        Some(other) => Err(wrong_type(key, "boolean", other)),
    }
}

fn get_double(map: &PrefMap, key: &str) -> Result<f64, PrefsError> {
    match map.get(key) {
        None => Ok(0.0),
        Some(PrefValue::Long(bits)) => Ok(decode_double(*bits)),
        Some(other) => Err(wrong_type(key, "long", other)),
    }
}

fn get_float(map: &PrefMap, key: &str) -> Result<f32, PrefsError> {
    match map.get(key) {
        None => Ok(0.0),
        Some(PrefValue::Float(value)) => Ok(*value),
        Some(other) => Err(wrong_type(key, "float", other)),
    }
}

/// Read-only access to the raw backing store.
pub trait ConfigurationSource {
    fn load(&self) -> Result<Arc<PrefMap>, PrefsError>;
}

impl ConfigurationSource for PrefMap {
    fn load(&self) -> Result<Arc<PrefMap>, PrefsError> {
        Ok(Arc::new(self.clone()))
    }
}

/// What the interception layer needs from the preference store.
pub trait PreferenceReader: Send + Sync {
    /// Re-reads the backing store and returns the resulting snapshot. Never
    /// fails: an unreadable store yields the last good snapshot.
    fn reload(&self) -> PreferenceSnapshot;

    /// Last snapshot produced by [`PreferenceReader::reload`].
    fn snapshot(&self) -> PreferenceSnapshot;
}

/// Last-known-good snapshot cache over a [`ConfigurationSource`].
pub struct SnapshotStore<S> {
    source: S,
    last_good: Mutex<PreferenceSnapshot>,
    failing: AtomicBool,
}

impl<S: ConfigurationSource> SnapshotStore<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            last_good: Mutex::new(PreferenceSnapshot::default()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn cached(&self) -> PreferenceSnapshot {
        *self.last_good.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: ConfigurationSource + Send + Sync> PreferenceReader for SnapshotStore<S> {
    fn reload(&self) -> PreferenceSnapshot {
        let loaded = self
            .source
            .load()
            .and_then(|map| PreferenceSnapshot::from_map(&map));

        match loaded {
            Ok(snapshot) => {
                *self.last_good.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
                if self.failing.swap(false, Ordering::Relaxed) {
                    info!("Preferences readable again");
                }
                snapshot
            }
            Err(e) => {
                if self.failing.swap(true, Ordering::Relaxed) {
                    debug!("Preferences still unreadable: {}", e);
                } else {
                    warn!("Keeping previous preferences: {}", e);
                }
                self.cached()
            }
        }
    }

    fn snapshot(&self) -> PreferenceSnapshot {
        self.cached()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Source whose contents can be swapped between reloads.
    struct SwappableSource(Mutex<Result<PrefMap, String>>);

    impl SwappableSource {
        fn set(&self, value: Result<PrefMap, String>) {
            *self.0.lock().unwrap() = value;
        }
    }

    impl ConfigurationSource for SwappableSource {
        fn load(&self) -> Result<Arc<PrefMap>, PrefsError> {
            match &*self.0.lock().unwrap() {
                Ok(map) => Ok(Arc::new(map.clone())),
                Err(msg) => Err(PrefsError::Xml(msg.clone())),
            }
        }
    }

    fn playing_map() -> PrefMap {
        let mut map = PrefMap::new();
        map.insert(keys::IS_PLAYING.into(), PrefValue::Bool(true));
        map.insert(
            keys::LAST_CLICKED_LOCATION.into(),
            PrefValue::String(r#"{"latitude":40.7128,"longitude":-74.006}"#.into()),
        );
        map.insert(keys::USE_ALTITUDE.into(), PrefValue::Bool(true));
        map.insert(keys::ALTITUDE.into(), PrefValue::Long(encode_double(120.5)));
        map.insert(keys::SPEED.into(), PrefValue::Float(3.5));
        map
    }

    #[test]
    fn test_double_encoding_round_trip() {
        let values = [
            0.0,
            -0.0,
            1.0,
            -1.0,
            40.7128,
            -74.006,
            -400.0,
            8848.86,
            f64::MAX,
            f64::MIN_POSITIVE,
        ];
        for value in values {
            let decoded = decode_double(encode_double(value));
            assert_eq!(decoded.to_bits(), value.to_bits(), "{value}");
        }
    }

    #[test]
    fn test_double_encoding_matches_java_raw_long_bits() {
        // Double.doubleToRawLongBits(1.0) == 4607182418800017408L
        assert_eq!(encode_double(1.0), 4607182418800017408);
        // Double.doubleToRawLongBits(-400.0) == -4577627546245398528L
        assert_eq!(encode_double(-400.0), -4577627546245398528);
        assert_eq!(decode_double(-4577627546245398528), -400.0);
    }

    #[test]
    fn test_empty_map_gives_defaults() {
        let snapshot = PreferenceSnapshot::from_map(&PrefMap::new()).unwrap();
        assert_eq!(snapshot, PreferenceSnapshot::default());
        assert!(!snapshot.is_playing);
        assert_eq!(snapshot.base_coordinate(), Coordinate::default());
    }

    #[test]
    fn test_same_as_is_bitwise() {
        let mut snapshot = PreferenceSnapshot::from_map(&playing_map()).unwrap();
        snapshot.speed = Override::new(false, f32::NAN);
        snapshot.altitude = Override::new(true, f64::NAN);
        let copy = snapshot;
        assert_ne!(snapshot, copy);
        assert!(snapshot.same_as(&copy));

        let mut other = snapshot;
        other.speed = Override::new(false, 1.0);
        assert!(!snapshot.same_as(&other));

        let mut moved = snapshot;
        moved.base = None;
        assert!(!snapshot.same_as(&moved));
        assert!(PreferenceSnapshot::default().same_as(&PreferenceSnapshot::default()));
    }

    #[test]
    fn test_snapshot_from_map() {
        let snapshot = PreferenceSnapshot::from_map(&playing_map()).unwrap();
        assert!(snapshot.is_playing);
        assert_eq!(
            snapshot.base,
            Some(Coordinate {
                latitude: 40.7128,
                longitude: -74.006
            })
        );
        assert_eq!(snapshot.altitude.active(), Some(120.5));
        assert_eq!(snapshot.speed.active(), None);
        assert_eq!(snapshot.speed.value, 3.5);
        assert!(!snapshot.use_system_hook);
    }

    #[test]
    fn test_wrong_type_rejects_map() {
        let mut map = playing_map();
        map.insert(keys::ALTITUDE.into(), PrefValue::Float(1.0));
        let err = PreferenceSnapshot::from_map(&map).unwrap_err();
        assert!(matches!(err, PrefsError::WrongType { expected: "long", .. }));
    }

    #[test]
    fn test_bad_base_json_rejects_map() {
        let mut map = playing_map();
        map.insert(
            keys::LAST_CLICKED_LOCATION.into(),
            PrefValue::String("{\"latitude\":".into()),
        );
        assert!(matches!(
            PreferenceSnapshot::from_map(&map),
            Err(PrefsError::BaseLocation(_))
        ));
    }

    #[test]
    fn test_reload_keeps_last_good_on_failure() {
        let store = SnapshotStore::new(SwappableSource(Mutex::new(Ok(playing_map()))));
        let good = store.reload();
        assert!(good.is_playing);

        store.source().set(Err("truncated".into()));
        assert_eq!(store.reload(), good);
        assert_eq!(store.snapshot(), good);

        let mut corrupt = playing_map();
        corrupt.insert(keys::IS_PLAYING.into(), PrefValue::String("yes".into()));
        store.source().set(Ok(corrupt));
        assert_eq!(store.reload(), good);
    }

    #[test]
    fn test_reload_picks_up_new_values() {
        let store = SnapshotStore::new(SwappableSource(Mutex::new(Ok(playing_map()))));
        assert!(store.reload().is_playing);

        let mut stopped = playing_map();
        stopped.insert(keys::IS_PLAYING.into(), PrefValue::Bool(false));
        store.source().set(Ok(stopped));
        assert!(!store.reload().is_playing);
    }

    #[test]
    fn test_unreadable_before_first_load_is_inactive() {
        let store = SnapshotStore::new(SwappableSource(Mutex::new(Err("missing".into()))));
        assert_eq!(store.reload(), PreferenceSnapshot::default());
    }
}
