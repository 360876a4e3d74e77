//! Per-call override decisions.
//!
//! Each call reloads preferences, checks the gates and either returns the
//! fabricated value or hands the real one back untouched. Nothing in here is
//! allowed to unwind into the host app: a panic resolves to the real value.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, error, info, trace};

use crate::hook::{Field, Value};
use crate::prefs::{PreferenceReader, PreferenceSnapshot};
use crate::synth::{synthesize, FakeLocation, SynthError};

/// Identity of a `Location` instance, e.g. its identity hash code.
pub type ObjectKey = u64;

const RECENT_CAPACITY: usize = 16;

static NEXT_INTERCEPTOR_ID: AtomicU64 = AtomicU64::new(0);

struct RecentFake {
    owner: u64,
    key: ObjectKey,
    snapshot: PreferenceSnapshot,
    fake: FakeLocation,
}

thread_local! {
    // Per thread, so concurrent callers never share synthesizer state.
    static RECENT: RefCell<VecDeque<RecentFake>> = const { RefCell::new(VecDeque::new()) };
}

/// Runs `f`, returning `fallback` if it panics.
pub fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error!("Interceptor panicked, passing the real value through");
            fallback
        }
    }
}

pub struct Interceptor<R> {
    id: u64,
    reader: R,
    warned_no_base: AtomicBool,
}

impl<R: PreferenceReader> Interceptor<R> {
    pub fn new(reader: R) -> Self {
        Self {
            id: NEXT_INTERCEPTOR_ID.fetch_add(1, Ordering::Relaxed),
            reader,
            warned_no_base: AtomicBool::new(false),
        }
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// Decides what a hooked getter returns. `receiver` identifies the
    /// `Location` the getter was called on, so every field read from one
    /// object comes from the same synthesized location.
    pub fn on_field(&self, field: Field, receiver: Option<ObjectKey>, real: Value) -> Value {
        self.on_field_with(field, || receiver, real)
    }

    /// Like [`Interceptor::on_field`], but only asks for the receiver's
    /// identity once the field is known to be spoofed.
    pub fn on_field_with(
        &self,
        field: Field,
        receiver: impl FnOnce() -> Option<ObjectKey>,
        real: Value,
    ) -> Value {
        guarded(real, || {
            let snapshot = self.reader.reload();
            if !field.is_spoofed(&snapshot) {
                return real;
            }

            match self.fake_for(receiver(), &snapshot) {
                Ok(fake) => {
                    let value = field.fake_value(&fake).unwrap_or(real);
                    trace!("{:?}: {:?} -> {:?}", field, real, value);
                    value
                }
                Err(e) => {
                    debug!("{:?} passed through: {}", field, e);
                    real
                }
            }
        })
    }

    /// Fabricated replacement for a last-known-location query, or `None` to
    /// return the real result.
    pub fn on_last_known_location(&self, provider: &str) -> Option<FakeLocation> {
        guarded(None, || {
            let snapshot = self.reader.reload();
            if !snapshot.is_playing {
                return None;
            }

            match self.synthesize(&snapshot) {
                Ok(fake) => {
                    debug!("Last known location for {}: {:?}", provider, fake.coordinate);
                    Some(fake)
                }
                Err(e) => {
                    debug!("Last known location for {} passed through: {}", provider, e);
                    None
                }
            }
        })
    }

    /// Binds `fake` to `receiver` so later getter calls on that object on
    /// this thread return the same values. Used for `Location` objects the
    /// hooks fabricate themselves.
    pub fn adopt(&self, receiver: ObjectKey, fake: FakeLocation) {
        let snapshot = self.reader.snapshot();
        self.remember(receiver, snapshot, fake);
    }

    fn synthesize(&self, snapshot: &PreferenceSnapshot) -> Result<FakeLocation, SynthError> {
        if snapshot.base.is_none() && !self.warned_no_base.swap(true, Ordering::Relaxed) {
            info!("Spoofing is on but no location was picked yet, using (0, 0)");
        }
        synthesize(snapshot.base_coordinate(), snapshot, &mut rand::rng())
    }

    fn fake_for(
        &self,
        receiver: Option<ObjectKey>,
        snapshot: &PreferenceSnapshot,
    ) -> Result<FakeLocation, SynthError> {
        let Some(key) = receiver else {
            return self.synthesize(snapshot);
        };

        let cached = RECENT.with(|recent| {
            recent
                .borrow()
                .iter()
                .find(|r| r.owner == self.id && r.key == key && r.snapshot.same_as(snapshot))
                .map(|r| r.fake)
        });
        if let Some(fake) = cached {
            return Ok(fake);
        }

        let fake = self.synthesize(snapshot)?;
        self.remember(key, *snapshot, fake);
        Ok(fake)
    }

    fn remember(&self, key: ObjectKey, snapshot: PreferenceSnapshot, fake: FakeLocation) {
        RECENT.with(|recent| {
            let mut recent = recent.borrow_mut();
            recent.retain(|r| !(r.owner == self.id && r.key == key));
            if recent.len() >= RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(RecentFake {
                owner: self.id,
                key,
                snapshot,
                fake,
            });
        });
    }
}
