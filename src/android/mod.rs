mod backend;
mod location;
mod natives;

use jni::JNIEnv;
use log::{error, info};
use zygisk_rs::{register_zygisk_module, Api, AppSpecializeArgs, Module, ServerSpecializeArgs};

use crate::config::{ModuleConfig, DEFAULT_CONFIG_PATH};
use crate::gate::{Bootstrap, GateState, ProcessIdentity};
use backend::JniBackend;

const LOG_TAG: &str = "GPSRider";

struct GpsRiderModule {
    api: Api,
    env: *mut jni_sys::JNIEnv,
    bootstrap: Bootstrap,
}

impl Module for GpsRiderModule {
    fn new(api: Api, env: *mut jni_sys::JNIEnv) -> Self {
        // read before the logger exists, so its own fallbacks go unlogged
        let config = ModuleConfig::load(DEFAULT_CONFIG_PATH);
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(config.log_level())
                .with_tag(LOG_TAG),
        );
        info!("GPS Rider module instance created");

        Self {
            api,
            env,
            bootstrap: Bootstrap::new(config),
        }
    }

    fn pre_app_specialize(&mut self, args: &mut AppSpecializeArgs) {
        let inner = || -> anyhow::Result<String> {
            let mut env = unsafe { JNIEnv::from_raw(self.env.cast())? };
            let nice_name = unsafe {
                (args.nice_name as *mut jni_sys::jstring as *mut ()
                    as *const jni::objects::JString<'_>)
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("nice_name is null"))?
            };
            Ok(env.get_string(nice_name)?.into())
        };

        let identity = match inner() {
            Ok(name) => ProcessIdentity::from_process_name(&name),
            Err(e) => {
                error!("Failed to read process name: {:?}", e);
                location::clear_exception(self.env);
                None
            }
        };
        self.load(identity);
    }

    fn post_app_specialize(&mut self, _args: &AppSpecializeArgs) {
        if self.bootstrap.state() == GateState::AwaitingApplication {
            let interceptor = natives::interceptor(&self.bootstrap.config().prefs_path);
            let mut backend = unsafe { JniBackend::new(&mut self.api, self.env) };
            // no Looper or Application yet; the first intercepted call shows it
            let mut notifier = &natives::ACTIVATION_NOTICE;
            let state =
                self.bootstrap
                    .on_application_ready(interceptor.reader(), &mut backend, &mut notifier);
            info!(
                "{}: {:?}",
                self.bootstrap.package().unwrap_or("<unknown>"),
                state
            );
        }
        self.unload_if_unused();
    }

    fn pre_server_specialize(&mut self, _args: &mut ServerSpecializeArgs) {
        self.load(Some(ProcessIdentity::SystemServer));
    }

    fn post_server_specialize(&mut self, _args: &ServerSpecializeArgs) {
        self.unload_if_unused();
    }
}

impl GpsRiderModule {
    fn load(&mut self, identity: Option<ProcessIdentity>) {
        let interceptor = natives::interceptor(&self.bootstrap.config().prefs_path);
        let mut backend = unsafe { JniBackend::new(&mut self.api, self.env) };
        let state = self
            .bootstrap
            .on_process_loaded(identity, interceptor.reader(), &mut backend);
        info!(
            "Process {} gated: {:?}",
            self.bootstrap.package().unwrap_or("system_server"),
            state
        );
    }

    /// Lets Zygisk drop the library once no hook can point into it.
    fn unload_if_unused(&mut self) {
        if self.bootstrap.state() == GateState::Skipped && !self.bootstrap.keeps_hooks() {
            self.api
                .set_option(zygisk_rs::ModuleOption::DlcloseModuleLibrary);
        }
    }
}

register_zygisk_module!(GpsRiderModule);
