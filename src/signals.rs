//! Signal source seams.
//!
//! Each browser/OS observer (page visibility, window focus, fullscreen state, viewport
//! size, keyboard intercept) is an injected [`SignalSource`]. The session controller
//! subscribes a [`SignalSink`] to every source when it arms and unsubscribes on disarm.
//! Sources deliver independently; no ordering holds between them.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};

use crate::classify::RawSignal;
use crate::controller::SignalDisposition;
use crate::lock_or_recover;

/// Callback handed to signal sources.
#[derive(Clone)]
pub struct SignalSink {
    deliver: Arc<dyn Fn(RawSignal) -> SignalDisposition + Send + Sync>,
}

impl SignalSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(RawSignal) -> SignalDisposition + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn emit(&self, signal: RawSignal) -> SignalDisposition {
        (self.deliver)(signal)
    }
}

impl std::fmt::Debug for SignalSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SignalSink")
    }
}

pub trait SignalSource: Send {
    fn name(&self) -> &str;
    /// Starts delivery to `sink`. Must not deliver synchronously from inside this call.
    fn subscribe(&mut self, sink: SignalSink) -> Result<()>;
    /// Stops delivery. After it returns the previous sink is never called again.
    fn unsubscribe(&mut self);
}

/// Registration guard over all sources: every source is subscribed exactly once per
/// arm cycle.
#[derive(Default)]
pub struct SignalHub {
    sources: Vec<Box<dyn SignalSource>>,
    registered: bool,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sources added while registered start receiving on the next arm cycle.
    pub fn add(&mut self, source: Box<dyn SignalSource>) {
        self.sources.push(source);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Subscribes every source. Returns `Ok(false)` when already registered. A failing
    /// source rolls back the ones already subscribed.
    pub fn register_all(&mut self, sink: &SignalSink) -> Result<bool> {
        if self.registered {
            log::debug!("signal sources already registered");
            return Ok(false);
        }
        for idx in 0..self.sources.len() {
            if let Err(e) = self.sources[idx].subscribe(sink.clone()) {
                let failed = self.sources[idx].name().to_string();
                for source in self.sources[..idx].iter_mut() {
                    source.unsubscribe();
                }
                return Err(anyhow!(
                    "failed to subscribe signal source {}: {}",
                    failed,
                    e
                ));
            }
        }
        self.registered = true;
        log::debug!("registered {} signal sources", self.sources.len());
        Ok(true)
    }

    /// Returns false when nothing was registered.
    pub fn deregister_all(&mut self) -> bool {
        if !self.registered {
            return false;
        }
        for source in self.sources.iter_mut() {
            source.unsubscribe();
        }
        self.registered = false;
        log::debug!("deregistered {} signal sources", self.sources.len());
        true
    }
}

impl Drop for SignalHub {
    fn drop(&mut self) {
        self.deregister_all();
    }
}

struct SyntheticSourceState {
    sink: Option<SignalSink>,
    subscriptions: u32,
    fail_subscribe: bool,
}

/// Source driven by explicit `fire` calls. Clones share the subscription, so a test keeps
/// one handle while the controller owns the other.
#[derive(Clone)]
pub struct SyntheticSignalSource {
    name: String,
    state: Arc<Mutex<SyntheticSourceState>>,
}

impl SyntheticSignalSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(SyntheticSourceState {
                sink: None,
                subscriptions: 0,
                fail_subscribe: false,
            })),
        }
    }

    /// Makes the next subscriptions fail (listener registration refused by the host).
    pub fn set_fail_subscribe(&self, fail: bool) {
        lock_or_recover(&self.state).fail_subscribe = fail;
    }

    /// Delivers `signal` to the current subscriber, if any. The sink runs outside the
    /// source lock so it may unsubscribe this source.
    pub fn fire(&self, signal: RawSignal) -> Option<SignalDisposition> {
        let sink = lock_or_recover(&self.state).sink.clone();
        match sink {
            Some(sink) => Some(sink.emit(signal)),
            None => {
                log::debug!("{}: dropped {} (no subscriber)", self.name, signal.name());
                None
            }
        }
    }

    pub fn is_subscribed(&self) -> bool {
        lock_or_recover(&self.state).sink.is_some()
    }

    /// Total successful subscriptions over the source's lifetime.
    pub fn subscription_count(&self) -> u32 {
        lock_or_recover(&self.state).subscriptions
    }
}

impl SignalSource for SyntheticSignalSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&mut self, sink: SignalSink) -> Result<()> {
        let mut state = lock_or_recover(&self.state);
        if state.fail_subscribe {
            return Err(anyhow!("listener registration refused"));
        }
        if state.sink.is_some() {
            return Err(anyhow!("{} already has a subscriber", self.name));
        }
        state.sink = Some(sink);
        state.subscriptions += 1;
        Ok(())
    }

    fn unsubscribe(&mut self) {
        lock_or_recover(&self.state).sink = None;
    }
}
