use jni::objects::{JObject, JValue};
use jni::sys::jobject;
use jni::JNIEnv;
use log::{debug, info, trace};

use crate::gate::DeferredNotice;
use crate::hook::{Field, Value};
use crate::synth::{Coordinate, FakeLocation};

const LOCATION_CLASS: &str = "android/location/Location";
const ACTIVATION_MESSAGE: &str = "Fake Location Is Active!";

/// Drops any pending Java exception so the next JNI call is legal.
pub fn clear_exception(env: *mut jni_sys::JNIEnv) {
    let Ok(mut env) = (unsafe { JNIEnv::from_raw(env.cast()) }) else {
        return;
    };
    if env.exception_check().unwrap_or(false) {
        let _ = env.exception_clear();
    }
}

/// Backing fields of each getter. Newer releases renamed most of them.
fn backing_fields(field: Field) -> &'static [&'static str] {
    match field {
        Field::Latitude => &["mLatitudeDegrees", "mLatitude"],
        Field::Longitude => &["mLongitudeDegrees", "mLongitude"],
        Field::Accuracy => &["mHorizontalAccuracyMeters", "mAccuracy"],
        Field::Altitude => &["mAltitudeMeters", "mAltitude"],
        Field::VerticalAccuracy => &["mAltitudeAccuracyMeters", "mVerticalAccuracyMeters"],
        Field::Speed => &["mSpeedMetersPerSecond", "mSpeed"],
        Field::SpeedAccuracy => &["mSpeedAccuracyMetersPerSecond"],
        Field::MslAltitude => &["mMslAltitudeMeters"],
        Field::MslAltitudeAccuracy => &["mMslAltitudeAccuracyMeters"],
    }
}

/// Reads the real value of `field` straight from the object, for getters
/// whose original entry point is unknown. Yields zero when nothing matches.
pub unsafe fn read_field(raw: *mut jni::sys::JNIEnv, this: jobject, field: Field) -> Value {
    let (zero, sig) = if field.is_double() {
        (Value::Double(0.0), "D")
    } else {
        (Value::Float(0.0), "F")
    };
    let Ok(mut env) = JNIEnv::from_raw(raw) else {
        return zero;
    };
    let this = JObject::from_raw(this);

    for name in backing_fields(field) {
        let value = env.get_field(&this, *name, sig).and_then(|v| {
            if field.is_double() {
                v.d().map(Value::Double)
            } else {
                v.f().map(Value::Float)
            }
        });
        match value {
            Ok(value) => return value,
            Err(_) => clear_exception(raw.cast()),
        }
    }
    zero
}

fn call_setter(
    env: &mut JNIEnv,
    target: &JObject,
    name: &str,
    sig: &str,
    value: JValue,
) -> jni::errors::Result<()> {
    env.call_method(target, name, sig, &[value])?;
    Ok(())
}

/// Creates a `Location` for `provider` carrying `fake`, stamped with the
/// current wall clock and elapsed realtime. Fields `fake` leaves unset stay
/// at the platform defaults; setters newer than `sdk` are not called.
pub fn new_location<'local>(
    env: &mut JNIEnv<'local>,
    provider: &str,
    fake: &FakeLocation,
    sdk: u32,
) -> jni::errors::Result<JObject<'local>> {
    let name = env.new_string(provider)?;
    let location = env.new_object(
        LOCATION_CLASS,
        "(Ljava/lang/String;)V",
        &[JValue::Object(&name)],
    )?;
    env.delete_local_ref(name)?;

    let Coordinate {
        latitude,
        longitude,
    } = fake.coordinate;
    call_setter(env, &location, "setLatitude", "(D)V", JValue::Double(latitude))?;
    call_setter(env, &location, "setLongitude", "(D)V", JValue::Double(longitude))?;

    let now = env
        .call_static_method("java/lang/System", "currentTimeMillis", "()J", &[])?
        .j()?;
    call_setter(env, &location, "setTime", "(J)V", JValue::Long(now))?;
    let elapsed = env
        .call_static_method("android/os/SystemClock", "elapsedRealtimeNanos", "()J", &[])?
        .j()?;
    call_setter(env, &location, "setElapsedRealtimeNanos", "(J)V", JValue::Long(elapsed))?;

    if let Some(accuracy) = fake.accuracy {
        call_setter(env, &location, "setAccuracy", "(F)V", JValue::Float(accuracy as f32))?;
    }
    if let Some(altitude) = fake.altitude {
        call_setter(env, &location, "setAltitude", "(D)V", JValue::Double(altitude))?;
    }
    if let Some(speed) = fake.speed {
        call_setter(env, &location, "setSpeed", "(F)V", JValue::Float(speed))?;
    }
    if sdk >= 26 {
        if let Some(v) = fake.vertical_accuracy {
            call_setter(env, &location, "setVerticalAccuracyMeters", "(F)V", JValue::Float(v))?;
        }
        if let Some(v) = fake.speed_accuracy {
            let setter = "setSpeedAccuracyMetersPerSecond";
            call_setter(env, &location, setter, "(F)V", JValue::Float(v))?;
        }
    }
    if sdk >= 34 {
        if let Some(v) = fake.msl_altitude {
            call_setter(env, &location, "setMslAltitudeMeters", "(D)V", JValue::Double(v))?;
        }
        if let Some(v) = fake.msl_altitude_accuracy {
            let setter = "setMslAltitudeAccuracyMeters";
            call_setter(env, &location, setter, "(F)V", JValue::Float(v))?;
        }
    }

    Ok(location)
}

/// The `Application`, if it exists and the caller is on the main thread.
/// A toast can only be made on a thread with a `Looper`, and before
/// `bindApplication` there is no `Application` to make it from.
fn foreground_application<'local>(
    env: &mut JNIEnv<'local>,
) -> jni::errors::Result<Option<JObject<'local>>> {
    let looper = "android/os/Looper";
    let main = env
        .call_static_method(looper, "getMainLooper", "()Landroid/os/Looper;", &[])?
        .l()?;
    let current = env
        .call_static_method(looper, "myLooper", "()Landroid/os/Looper;", &[])?
        .l()?;
    if main.is_null() || !env.is_same_object(&main, &current)? {
        return Ok(None);
    }

    let application = env
        .call_static_method(
            "android/app/ActivityThread",
            "currentApplication",
            "()Landroid/app/Application;",
            &[],
        )?
        .l()?;
    Ok((!application.is_null()).then_some(application))
}

fn show_toast(env: &mut JNIEnv, context: &JObject) -> jni::errors::Result<()> {
    let text = env.new_string(ACTIVATION_MESSAGE)?;
    let toast = env
        .call_static_method(
            "android/widget/Toast",
            "makeText",
            "(Landroid/content/Context;Ljava/lang/CharSequence;I)Landroid/widget/Toast;",
            &[JValue::Object(context), JValue::Object(&text), JValue::Int(0)],
        )?
        .l()?;
    env.call_method(&toast, "show", "()V", &[])?;
    Ok(())
}

/// Shows the activation toast if `notice` is armed and this call can show it.
/// Otherwise the notice stays armed for a later call.
pub fn show_pending_toast(env: &mut JNIEnv, notice: &DeferredNotice) {
    if !notice.is_armed() {
        return;
    }

    let application = match foreground_application(env) {
        Ok(Some(application)) => application,
        Ok(None) => return,
        Err(e) => {
            trace!("Activation toast not shown yet: {}", e);
            clear_exception(env.get_raw().cast());
            return;
        }
    };
    let Some(package) = notice.claim() else {
        return;
    };

    match show_toast(env, &application) {
        Ok(()) => info!("Activation toast shown in {}", package),
        Err(e) => {
            debug!("No activation toast in {}: {}", package, e);
            clear_exception(env.get_raw().cast());
        }
    }
}
