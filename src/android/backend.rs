use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};

use jni::JNIEnv;
use log::{debug, warn};
use zygisk_rs::Api;

use super::location::clear_exception;
use super::natives;

static REJECTION_EXPLAINED: AtomicBool = AtomicBool::new(false);
use crate::hook::{HookBackend, HookError, HookTarget};

/// Replaces methods through Zygisk's JNI method table hook.
///
/// Zygisk hands back the previous entry point in `fnPtr`. A null pointer
/// means the runtime had no native implementation to swap, which is the
/// case for plain bytecode methods on most ART builds.
pub struct JniBackend<'a> {
    api: &'a mut Api,
    env: *mut jni_sys::JNIEnv,
    sdk: u32,
}

impl<'a> JniBackend<'a> {
    /// # Safety
    /// `env` must be the JNI environment of the calling thread.
    pub unsafe fn new(api: &'a mut Api, env: *mut jni_sys::JNIEnv) -> Self {
        let sdk = match read_sdk_int(env) {
            Ok(sdk) => sdk,
            Err(e) => {
                // SDK 0 makes every table entry unsupported
                warn!("Cannot read Build.VERSION.SDK_INT: {}", e);
                clear_exception(env);
                0
            }
        };
        natives::set_sdk_int(sdk);
        Self { api, env, sdk }
    }

    fn check_target(&self, target: &'static HookTarget) -> Result<(), HookError> {
        let mut env = unsafe { JNIEnv::from_raw(self.env.cast()) }
            .map_err(|e| HookError::Jni(e.to_string()))?;

        let class = match env.find_class(target.class) {
            Ok(class) => class,
            Err(_) => {
                clear_exception(self.env);
                return Err(HookError::ClassNotFound(target.class));
            }
        };

        let found = env
            .get_method_id(&class, target.method, target.signature)
            .is_ok()
            || {
                clear_exception(self.env);
                env.get_static_method_id(&class, target.method, target.signature)
                    .is_ok()
            };
        clear_exception(self.env);
        let _ = env.delete_local_ref(class);

        if found {
            Ok(())
        } else {
            Err(HookError::MethodNotFound {
                class: target.class,
                method: target.method,
                signature: target.signature,
            })
        }
    }
}

impl HookBackend for JniBackend<'_> {
    fn sdk_int(&self) -> u32 {
        self.sdk
    }

    fn install(&mut self, target: &'static HookTarget) -> Result<(), HookError> {
        self.check_target(target)?;

        let name = CString::new(target.method).map_err(|e| HookError::Jni(e.to_string()))?;
        let signature =
            CString::new(target.signature).map_err(|e| HookError::Jni(e.to_string()))?;
        let mut methods = [jni_sys::JNINativeMethod {
            name: name.as_ptr() as *mut _,
            signature: signature.as_ptr() as *mut _,
            fnPtr: natives::replacement_for(target.policy),
        }];

        self.api
            .hook_jni_native_methods(self.env, target.class, &mut methods);
        clear_exception(self.env);

        let original = methods[0].fnPtr;
        if original.is_null() {
            if !REJECTION_EXPLAINED.swap(true, Ordering::Relaxed) {
                warn!(
                    "{}.{} has no native entry point to replace. The JNI table hook only \
                     swaps native methods, bytecode getters need an ART method hook",
                    target.class, target.method
                );
            }
            return Err(HookError::Rejected {
                class: target.class,
                method: target.method,
            });
        }
        debug!("{}.{} original at {:p}", target.class, target.method, original);
        natives::store_original(target.policy, original);
        Ok(())
    }
}

unsafe fn read_sdk_int(env: *mut jni_sys::JNIEnv) -> jni::errors::Result<u32> {
    let mut env = JNIEnv::from_raw(env.cast())?;
    let sdk = env
        .get_static_field("android/os/Build$VERSION", "SDK_INT", "I")?
        .i()?;
    Ok(sdk.max(0) as u32)
}
