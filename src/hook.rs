//! Declarative hook tables and the installer that walks them.
//!
//! The tables say *what* gets intercepted and how the result is decided. The
//! mechanism that actually replaces a method lives behind [`HookBackend`].

use log::{info, warn};
use thiserror::Error;

use crate::prefs::PreferenceSnapshot;
use crate::synth::FakeLocation;

/// `Location` value overridden by a getter hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Latitude,
    Longitude,
    Accuracy,
    Altitude,
    VerticalAccuracy,
    Speed,
    SpeedAccuracy,
    MslAltitude,
    MslAltitudeAccuracy,
}

/// Return value of a getter, typed like the Java method returns it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Double(f64),
    Float(f32),
}

impl Value {
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Double(v) => v,
            Value::Float(v) => v as f64,
        }
    }
}

impl Field {
    pub const ALL: [Field; 9] = [
        Field::Latitude,
        Field::Longitude,
        Field::Accuracy,
        Field::Altitude,
        Field::VerticalAccuracy,
        Field::Speed,
        Field::SpeedAccuracy,
        Field::MslAltitude,
        Field::MslAltitudeAccuracy,
    ];

    /// Whether the getter returns `double` (otherwise `float`).
    pub fn is_double(self) -> bool {
        matches!(
            self,
            Field::Latitude | Field::Longitude | Field::Altitude | Field::MslAltitude
        )
    }

    /// Whether this field is overridden under `snapshot`. Coordinates only
    /// need spoofing to be on; every other field also needs its own flag.
    pub fn is_spoofed(self, snapshot: &PreferenceSnapshot) -> bool {
        if !snapshot.is_playing {
            return false;
        }
        match self {
            Field::Latitude | Field::Longitude => true,
            Field::Accuracy => snapshot.accuracy.enabled,
            Field::Altitude => snapshot.altitude.enabled,
            Field::VerticalAccuracy => snapshot.vertical_accuracy.enabled,
            Field::Speed => snapshot.speed.enabled,
            Field::SpeedAccuracy => snapshot.speed_accuracy.enabled,
            Field::MslAltitude => snapshot.mean_sea_level.enabled,
            Field::MslAltitudeAccuracy => snapshot.mean_sea_level_accuracy.enabled,
        }
    }

    /// The value `fake` holds for this field, converted to the getter's type.
    pub fn fake_value(self, fake: &FakeLocation) -> Option<Value> {
        match self {
            Field::Latitude => Some(Value::Double(fake.coordinate.latitude)),
            Field::Longitude => Some(Value::Double(fake.coordinate.longitude)),
            Field::Accuracy => fake.accuracy.map(|v| Value::Float(v as f32)),
            Field::Altitude => fake.altitude.map(Value::Double),
            Field::VerticalAccuracy => fake.vertical_accuracy.map(Value::Float),
            Field::Speed => fake.speed.map(Value::Float),
            Field::SpeedAccuracy => fake.speed_accuracy.map(Value::Float),
            Field::MslAltitude => fake.msl_altitude.map(Value::Double),
            Field::MslAltitudeAccuracy => fake.msl_altitude_accuracy.map(Value::Float),
        }
    }
}

/// Where the provider name of a fabricated last-known location comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderSource {
    /// The method's first argument, as in `getLastKnownLocation(String)`.
    Argument,
    /// A `String` field on the receiver.
    ReceiverField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Replace one getter's return value.
    Field(Field),
    /// Replace the whole returned `Location` with a fabricated one.
    LastKnownLocation(ProviderSource),
    /// Make the companion app's "module active" check return true.
    ReportActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookTarget {
    /// JNI class name, slash separated.
    pub class: &'static str,
    pub method: &'static str,
    pub signature: &'static str,
    /// First SDK level that has the method.
    pub min_sdk: u32,
    pub policy: Policy,
}

const LOCATION: &str = "android/location/Location";

const fn getter(
    method: &'static str,
    signature: &'static str,
    min_sdk: u32,
    field: Field,
) -> HookTarget {
    HookTarget {
        class: LOCATION,
        method,
        signature,
        min_sdk,
        policy: Policy::Field(field),
    }
}

/// Hooks installed into every spoofed app process.
pub static LOCATION_HOOKS: &[HookTarget] = &[
    getter("getLatitude", "()D", 1, Field::Latitude),
    getter("getLongitude", "()D", 1, Field::Longitude),
    getter("getAccuracy", "()F", 1, Field::Accuracy),
    getter("getAltitude", "()D", 1, Field::Altitude),
    getter("getVerticalAccuracyMeters", "()F", 26, Field::VerticalAccuracy),
    getter("getSpeed", "()F", 1, Field::Speed),
    getter("getSpeedAccuracyMetersPerSecond", "()F", 26, Field::SpeedAccuracy),
    getter("getMslAltitudeMeters", "()D", 34, Field::MslAltitude),
    getter("getMslAltitudeAccuracyMeters", "()F", 34, Field::MslAltitudeAccuracy),
    HookTarget {
        class: "android/location/LocationManager",
        method: "getLastKnownLocation",
        signature: "(Ljava/lang/String;)Landroid/location/Location;",
        min_sdk: 1,
        policy: Policy::LastKnownLocation(ProviderSource::Argument),
    },
];

/// Hooks for system_server, installed instead of [`LOCATION_HOOKS`] when the
/// system hook preference is on.
pub static SYSTEM_SERVER_HOOKS: &[HookTarget] = &[HookTarget {
    class: "com/android/server/location/provider/LocationProviderManager",
    method: "getLastLocation",
    signature: concat!(
        "(Landroid/location/LastLocationRequest;",
        "Landroid/location/util/identity/CallerIdentity;I)",
        "Landroid/location/Location;"
    ),
    min_sdk: 33,
    policy: Policy::LastKnownLocation(ProviderSource::ReceiverField("mName")),
}];

/// Installed into the companion app so it can tell the module is loaded.
pub static SELF_CHECK_HOOKS: &[HookTarget] = &[HookTarget {
    class: "com/dvhamham/manager/XposedChecker",
    method: "isModuleActive",
    signature: "()Z",
    min_sdk: 1,
    policy: Policy::ReportActive,
}];

#[derive(Debug, Error)]
pub enum HookError {
    #[error("class {0} not found")]
    ClassNotFound(&'static str),
    #[error("method {class}.{method}{signature} not found")]
    MethodNotFound {
        class: &'static str,
        method: &'static str,
        signature: &'static str,
    },
    #[error("runtime refused to hook {class}.{method}")]
    Rejected {
        class: &'static str,
        method: &'static str,
    },
    #[error("jni: {0}")]
    Jni(String),
}

/// Platform method replacement.
pub trait HookBackend {
    /// API level of the running OS.
    fn sdk_int(&self) -> u32;

    fn install(&mut self, target: &'static HookTarget) -> Result<(), HookError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: Vec<&'static str>,
    pub unsupported: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

impl InstallReport {
    pub fn any_installed(&self) -> bool {
        !self.installed.is_empty()
    }

    pub fn merge(&mut self, other: InstallReport) {
        self.installed.extend(other.installed);
        self.unsupported.extend(other.unsupported);
        self.failed.extend(other.failed);
    }
}

/// Installs every target of `table` the running SDK has. A target that fails
/// is logged and skipped; the rest are still installed.
pub fn install_table<B: HookBackend + ?Sized>(
    backend: &mut B,
    table: &'static [HookTarget],
) -> InstallReport {
    let sdk = backend.sdk_int();
    let mut report = InstallReport::default();

    for target in table {
        if sdk < target.min_sdk {
            info!(
                "{}.{} needs SDK {}, running {}; not hooked",
                target.class, target.method, target.min_sdk, sdk
            );
            report.unsupported.push(target.method);
            continue;
        }

        match backend.install(target) {
            Ok(()) => {
                info!("Hooked {}.{}{}", target.class, target.method, target.signature);
                report.installed.push(target.method);
            }
            Err(e) => {
                warn!("Skipping {}.{}: {}", target.class, target.method, e);
                report.failed.push(target.method);
            }
        }
    }

    report
}
