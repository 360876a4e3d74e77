//! Replacement entry points handed to the JNI method table.
//!
//! Every function here runs on an app thread in the middle of an app's call.
//! They must never unwind and never leave a pending exception they caused.

use std::ffi::c_void;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::OnceLock;

use jni::objects::{JObject, JString, JValue};
use jni::sys::{jboolean, jdouble, jfloat, jint, jobject, jstring, JNIEnv as RawEnv, JNI_TRUE};
use jni::JNIEnv;
use log::{debug, warn};

use super::location::{self, clear_exception};
use crate::gate::DeferredNotice;
use crate::hook::{Field, Policy, ProviderSource, Value};
use crate::interceptor::{guarded, Interceptor, ObjectKey};
use crate::prefs::SnapshotStore;
use crate::shared_prefs::SharedPrefsFile;

pub type ModuleInterceptor = Interceptor<SnapshotStore<SharedPrefsFile>>;

static INTERCEPTOR: OnceLock<ModuleInterceptor> = OnceLock::new();
static SDK_INT: AtomicU32 = AtomicU32::new(0);
static PROVIDER_FIELD: OnceLock<&'static str> = OnceLock::new();

/// Armed at install time, shown by the first intercepted call made on the
/// main thread once the `Application` exists.
pub static ACTIVATION_NOTICE: DeferredNotice = DeferredNotice::new();

const LAST_KNOWN_SLOT: usize = Field::ALL.len();
const SERVER_LAST_LOCATION_SLOT: usize = LAST_KNOWN_SLOT + 1;
const SLOT_COUNT: usize = SERVER_LAST_LOCATION_SLOT + 1;

static ORIGINALS: [AtomicPtr<c_void>; SLOT_COUNT] =
    [const { AtomicPtr::new(ptr::null_mut()) }; SLOT_COUNT];

type DoubleGetter = unsafe extern "C" fn(*mut RawEnv, jobject) -> jdouble;
type FloatGetter = unsafe extern "C" fn(*mut RawEnv, jobject) -> jfloat;
type LastKnownLocation = unsafe extern "C" fn(*mut RawEnv, jobject, jstring) -> jobject;
type ServerLastLocation =
    unsafe extern "C" fn(*mut RawEnv, jobject, jobject, jobject, jint) -> jobject;

/// The process-wide interceptor, reading preferences from `prefs_path` on
/// first use.
pub fn interceptor(prefs_path: &Path) -> &'static ModuleInterceptor {
    INTERCEPTOR.get_or_init(|| {
        Interceptor::new(SnapshotStore::new(SharedPrefsFile::new(prefs_path)))
    })
}

pub fn set_sdk_int(sdk: u32) {
    SDK_INT.store(sdk, Ordering::Relaxed);
}

fn slot(policy: Policy) -> Option<usize> {
    match policy {
        Policy::Field(field) => Some(field as usize),
        Policy::LastKnownLocation(ProviderSource::Argument) => Some(LAST_KNOWN_SLOT),
        Policy::LastKnownLocation(ProviderSource::ReceiverField(_)) => {
            Some(SERVER_LAST_LOCATION_SLOT)
        }
        Policy::ReportActive => None,
    }
}

pub fn store_original(policy: Policy, original: *mut c_void) {
    if let Policy::LastKnownLocation(ProviderSource::ReceiverField(name)) = policy {
        let _ = PROVIDER_FIELD.set(name);
    }
    if let Some(slot) = slot(policy) {
        ORIGINALS[slot].store(original, Ordering::Release);
    }
}

fn original(slot: usize) -> *mut c_void {
    ORIGINALS[slot].load(Ordering::Acquire)
}

pub fn replacement_for(policy: Policy) -> *mut c_void {
    match policy {
        Policy::Field(Field::Latitude) => get_latitude as *mut c_void,
        Policy::Field(Field::Longitude) => get_longitude as *mut c_void,
        Policy::Field(Field::Accuracy) => get_accuracy as *mut c_void,
        Policy::Field(Field::Altitude) => get_altitude as *mut c_void,
        Policy::Field(Field::VerticalAccuracy) => get_vertical_accuracy as *mut c_void,
        Policy::Field(Field::Speed) => get_speed as *mut c_void,
        Policy::Field(Field::SpeedAccuracy) => get_speed_accuracy as *mut c_void,
        Policy::Field(Field::MslAltitude) => get_msl_altitude as *mut c_void,
        Policy::Field(Field::MslAltitudeAccuracy) => get_msl_altitude_accuracy as *mut c_void,
        Policy::LastKnownLocation(ProviderSource::Argument) => {
            get_last_known_location as *mut c_void
        }
        Policy::LastKnownLocation(ProviderSource::ReceiverField(_)) => {
            get_last_location as *mut c_void
        }
        Policy::ReportActive => is_module_active as *mut c_void,
    }
}

/// Identity hash code of `this`, used to keep one object's fields consistent.
unsafe fn object_key(env: &mut JNIEnv, this: &JObject) -> Option<ObjectKey> {
    let hash = env
        .call_static_method(
            "java/lang/System",
            "identityHashCode",
            "(Ljava/lang/Object;)I",
            &[JValue::Object(this)],
        )
        .and_then(|v| v.i());
    match hash {
        Ok(hash) => Some(hash as u32 as ObjectKey),
        Err(_) => {
            clear_exception(env.get_raw().cast());
            None
        }
    }
}

unsafe fn real_value(raw: *mut RawEnv, this: jobject, field: Field) -> Value {
    let original = original(field as usize);
    if original.is_null() {
        return location::read_field(raw, this, field);
    }
    if field.is_double() {
        let getter: DoubleGetter = std::mem::transmute(original);
        Value::Double(getter(raw, this))
    } else {
        let getter: FloatGetter = std::mem::transmute(original);
        Value::Float(getter(raw, this))
    }
}

unsafe fn intercept_getter(raw: *mut RawEnv, this: jobject, field: Field) -> Value {
    let zero = if field.is_double() {
        Value::Double(0.0)
    } else {
        Value::Float(0.0)
    };
    let real = guarded(zero, || unsafe { real_value(raw, this, field) });

    guarded(real, || unsafe {
        let Some(interceptor) = INTERCEPTOR.get() else {
            return real;
        };
        let Ok(mut env) = JNIEnv::from_raw(raw) else {
            return real;
        };
        if env.exception_check().unwrap_or(true) {
            return real;
        }
        let this = JObject::from_raw(this);
        location::show_pending_toast(&mut env, &ACTIVATION_NOTICE);
        interceptor.on_field_with(field, || object_key(&mut env, &this), real)
    })
}

macro_rules! getter {
    ($name:ident, $ret:ty, $field:expr) => {
        unsafe extern "C" fn $name(env: *mut RawEnv, this: jobject) -> $ret {
            intercept_getter(env, this, $field).as_f64() as $ret
        }
    };
}

getter!(get_latitude, jdouble, Field::Latitude);
getter!(get_longitude, jdouble, Field::Longitude);
getter!(get_accuracy, jfloat, Field::Accuracy);
getter!(get_altitude, jdouble, Field::Altitude);
getter!(get_vertical_accuracy, jfloat, Field::VerticalAccuracy);
getter!(get_speed, jfloat, Field::Speed);
getter!(get_speed_accuracy, jfloat, Field::SpeedAccuracy);
getter!(get_msl_altitude, jdouble, Field::MslAltitude);
getter!(get_msl_altitude_accuracy, jfloat, Field::MslAltitudeAccuracy);

/// Builds the fabricated `Location` for `provider`, or `None` to keep `real`.
unsafe fn fabricate(env: &mut JNIEnv, provider: &str) -> Option<jobject> {
    let interceptor = INTERCEPTOR.get()?;
    let fake = interceptor.on_last_known_location(provider)?;

    let sdk = SDK_INT.load(Ordering::Relaxed);
    match location::new_location(env, provider, &fake, sdk) {
        Ok(location) => {
            if let Some(key) = object_key(env, &location) {
                interceptor.adopt(key, fake);
            }
            Some(location.into_raw())
        }
        Err(e) => {
            warn!("Cannot build fake location for {}: {}", provider, e);
            clear_exception(env.get_raw().cast());
            None
        }
    }
}

unsafe fn java_string(env: &mut JNIEnv, value: &JString) -> Option<String> {
    if value.is_null() {
        return None;
    }
    match env.get_string(value) {
        Ok(value) => Some(value.into()),
        Err(_) => {
            clear_exception(env.get_raw().cast());
            None
        }
    }
}

/// Shared tail of both last-location hooks.
unsafe fn replace_location(
    raw: *mut RawEnv,
    real: jobject,
    provider: impl FnOnce(&mut JNIEnv) -> Option<String>,
) -> jobject {
    guarded(real, || unsafe {
        let Ok(mut env) = JNIEnv::from_raw(raw) else {
            return real;
        };
        // the real call threw, e.g. a SecurityException; let it propagate
        if env.exception_check().unwrap_or(true) {
            return real;
        }
        location::show_pending_toast(&mut env, &ACTIVATION_NOTICE);
        let provider = provider(&mut env).unwrap_or_else(|| "gps".to_string());
        match fabricate(&mut env, &provider) {
            Some(location) => {
                debug!("Replaced last location for {}", provider);
                location
            }
            None => real,
        }
    })
}

unsafe extern "C" fn get_last_known_location(
    env: *mut RawEnv,
    this: jobject,
    provider: jstring,
) -> jobject {
    let original = original(LAST_KNOWN_SLOT);
    let real = if original.is_null() {
        ptr::null_mut()
    } else {
        let original: LastKnownLocation = std::mem::transmute(original);
        original(env, this, provider)
    };

    replace_location(env, real, |env| unsafe {
        java_string(env, &JString::from_raw(provider))
    })
}

unsafe extern "C" fn get_last_location(
    env: *mut RawEnv,
    this: jobject,
    request: jobject,
    identity: jobject,
    permission_level: jint,
) -> jobject {
    let original = original(SERVER_LAST_LOCATION_SLOT);
    let real = if original.is_null() {
        ptr::null_mut()
    } else {
        let original: ServerLastLocation = std::mem::transmute(original);
        original(env, this, request, identity, permission_level)
    };

    replace_location(env, real, |env| unsafe {
        let field = PROVIDER_FIELD.get()?;
        let this = JObject::from_raw(this);
        let name = match env
            .get_field(&this, *field, "Ljava/lang/String;")
            .and_then(|v| v.l())
        {
            Ok(name) => JString::from(name),
            Err(_) => {
                clear_exception(env.get_raw().cast());
                return None;
            }
        };
        java_string(env, &name)
    })
}

unsafe extern "C" fn is_module_active(_env: *mut RawEnv, _this: jobject) -> jboolean {
    JNI_TRUE
}
