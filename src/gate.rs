//! Per-process decision on whether to install hooks at all.
//!
//! Each process goes through the gate exactly once. Later preference changes
//! only decide whether installed hooks act, never whether they exist.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use log::info;

use crate::config::ModuleConfig;
use crate::hook::{
    install_table, HookBackend, InstallReport, LOCATION_HOOKS, SELF_CHECK_HOOKS,
    SYSTEM_SERVER_HOOKS,
};
use crate::prefs::PreferenceReader;

pub const SYSTEM_SERVER: &str = "system_server";

/// Who the freshly loaded process is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessIdentity {
    SystemServer,
    /// An app process, named like `com.example.app` or `com.example.app:remote`.
    App(String),
}

impl ProcessIdentity {
    pub fn from_process_name(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.is_empty() {
            None
        } else if name == SYSTEM_SERVER {
            Some(ProcessIdentity::SystemServer)
        } else {
            Some(ProcessIdentity::App(name.to_string()))
        }
    }

    /// Package part of an app process name.
    pub fn package(&self) -> Option<&str> {
        match self {
            ProcessIdentity::SystemServer => None,
            ProcessIdentity::App(name) => name.split(':').next(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Unloaded,
    Skipped,
    AwaitingApplication,
    InstalledApp,
    InstalledSystem,
}

/// Feedback shown in a spoofed app once its hooks are in place.
pub trait Notifier {
    fn notify_activated(&mut self, package: &str);
}

/// Activation notice held back until the app is able to show it.
///
/// Hooks go in before the app's `Application` exists, so the notice is only
/// armed at install time and claimed later by whoever first can display it.
pub struct DeferredNotice {
    armed: AtomicBool,
    package: OnceLock<String>,
}

impl DeferredNotice {
    pub const fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            package: OnceLock::new(),
        }
    }

    pub fn arm(&self, package: &str) {
        let _ = self.package.set(package.to_string());
        self.armed.store(true, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Takes the armed notice. Only one caller ever gets it.
    pub fn claim(&self) -> Option<&str> {
        if !self.armed.swap(false, Ordering::AcqRel) {
            return None;
        }
        Some(self.package.get().map(String::as_str).unwrap_or_default())
    }
}

impl Default for DeferredNotice {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for &DeferredNotice {
    fn notify_activated(&mut self, package: &str) {
        self.arm(package);
    }
}

pub struct Bootstrap {
    state: GateState,
    package: Option<String>,
    config: ModuleConfig,
    report: InstallReport,
}

impl Bootstrap {
    pub fn new(config: ModuleConfig) -> Self {
        Self {
            state: GateState::Unloaded,
            package: None,
            config,
            report: InstallReport::default(),
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Whether any hook points into this library, so it must stay loaded.
    pub fn keeps_hooks(&self) -> bool {
        self.report.any_installed()
    }

    /// Gates a process right after it was loaded. `identity` is `None` when
    /// the process could not be identified; nothing is installed then.
    pub fn on_process_loaded<R, B>(
        &mut self,
        identity: Option<ProcessIdentity>,
        reader: &R,
        backend: &mut B,
    ) -> GateState
    where
        R: PreferenceReader + ?Sized,
        B: HookBackend + ?Sized,
    {
        if self.state != GateState::Unloaded {
            return self.state;
        }

        self.state = match identity {
            None => {
                info!("Process identity unavailable, not hooking");
                GateState::Skipped
            }
            Some(ProcessIdentity::SystemServer) => {
                if reader.reload().use_system_hook {
                    // Location getters stay real here, the platform reads them itself
                    info!("Hooking system_server, system hook enabled");
                    self.report.merge(install_table(backend, SYSTEM_SERVER_HOOKS));
                    if self.report.any_installed() {
                        GateState::InstalledSystem
                    } else {
                        GateState::Skipped
                    }
                } else {
                    info!("System hook disabled by user preference");
                    GateState::Skipped
                }
            }
            Some(identity @ ProcessIdentity::App(_)) => {
                let package = identity.package().unwrap_or_default().to_string();
                let state = self.gate_app(&package, backend);
                self.package = Some(package);
                state
            }
        };
        self.state
    }

    fn gate_app<B: HookBackend + ?Sized>(&mut self, package: &str, backend: &mut B) -> GateState {
        if package == self.config.companion_package {
            info!("Skipping companion app {}", package);
            self.report.merge(install_table(backend, SELF_CHECK_HOOKS));
            GateState::Skipped
        } else if is_zygote_helper(package) || self.config.is_excluded(package) {
            info!("Skipping {}", package);
            GateState::Skipped
        } else {
            GateState::AwaitingApplication
        }
    }

    /// Installs the location hooks once the app is ready to run.
    pub fn on_application_ready<R, B, N>(
        &mut self,
        reader: &R,
        backend: &mut B,
        notifier: &mut N,
    ) -> GateState
    where
        R: PreferenceReader + ?Sized,
        B: HookBackend + ?Sized,
        N: Notifier + ?Sized,
    {
        if self.state != GateState::AwaitingApplication {
            return self.state;
        }

        let package = self.package.clone().unwrap_or_default();
        let report = install_table(backend, LOCATION_HOOKS);
        let installed = report.any_installed();
        info!(
            "Location hooks for {}: {} installed, {} unsupported, {} failed",
            package,
            report.installed.len(),
            report.unsupported.len(),
            report.failed.len()
        );
        self.report.merge(report);

        self.state = if installed {
            if self.config.notify_activation && reader.reload().is_playing {
                notifier.notify_activated(&package);
            }
            GateState::InstalledApp
        } else {
            GateState::Skipped
        };
        self.state
    }
}

fn is_zygote_helper(name: &str) -> bool {
    name.ends_with("zygote") || name.starts_with("usap")
}
