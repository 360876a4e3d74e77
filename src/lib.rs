//! GPS Rider: a Zygisk module that feeds apps the location picked in the
//! companion app instead of the real one.
//!
//! Everything outside [`android`] is platform independent and tested on the
//! host; the Android side only wires it to the Zygisk and JNI surfaces.

pub mod config;
pub mod gate;
pub mod hook;
pub mod interceptor;
pub mod prefs;
pub mod shared_prefs;
pub mod synth;

#[cfg(target_os = "android")]
mod android;
