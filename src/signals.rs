//! Focus and connectivity signal sources.
//!
//! [`FocusManager`] and [`OnlineManager`] hold a current boolean ("is the
//! window focused", "is the network reachable") and broadcast transitions
//! to subscribers. The cache watches both to trigger background refetch of
//! eligible queries, and paused retries park on the online signal.
//!
//! Neither manager installs a platform listener by default: a headless
//! process is always "focused" and "online". Embedders bridge real
//! platform events with [`set_event_listener`](SignalManager::set_event_listener):
//!
//! ```
//! use requery::signals::FocusManager;
//!
//! let focus = FocusManager::new();
//! focus.set_event_listener(|setter| {
//!     // Wire `setter` into the platform's visibility events; the returned
//!     // closure tears the wiring down when a new listener is installed.
//!     setter(true);
//!     Box::new(|| {})
//! });
//! assert!(focus.is_focused());
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// A function handed to an event-listener installer; call it with the new
/// signal value whenever the platform reports a change.
pub type SignalSetter = Arc<dyn Fn(bool) + Send + Sync>;

/// Tears down a previously installed event listener.
pub type Teardown = Box<dyn FnOnce() + Send>;

struct SignalState {
    /// Latest value reported by the event listener.
    reported: bool,
    /// Manual override, taking precedence over `reported` while set.
    manual: Option<bool>,
}

impl SignalState {
    fn effective(&self) -> bool {
        self.manual.unwrap_or(self.reported)
    }
}

struct SignalInner {
    state: Mutex<SignalState>,
    tx: broadcast::Sender<bool>,
    teardown: Mutex<Option<Teardown>>,
}

/// A process-wide boolean signal with a replaceable event source.
///
/// Cloning shares the underlying signal. Only one event listener is active
/// at a time: installing a new one tears down the previous one first.
#[derive(Clone)]
pub struct SignalManager {
    inner: Arc<SignalInner>,
}

impl SignalManager {
    fn new(initial: bool) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState {
                    reported: initial,
                    manual: None,
                }),
                tx,
                teardown: Mutex::new(None),
            }),
        }
    }

    /// The current effective value of the signal.
    #[must_use]
    pub fn get(&self) -> bool {
        self.inner.state.lock().effective()
    }

    /// Subscribes to effective-value transitions.
    ///
    /// Only changes are broadcast; the current value is read with
    /// [`get`](Self::get).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    /// Sets or clears the manual override.
    ///
    /// `Some(value)` pins the signal regardless of what the event listener
    /// reports; `None` returns control to the listener.
    pub fn set(&self, value: Option<bool>) {
        self.transition(|state| state.manual = value);
    }

    /// Replaces how the signal is produced.
    ///
    /// The installer receives a setter to call on each platform event and
    /// returns a teardown closure. Installing a new listener runs the
    /// previous teardown first.
    pub fn set_event_listener<F>(&self, installer: F)
    where
        F: FnOnce(SignalSetter) -> Teardown,
    {
        // Take the previous teardown out before running it: it is user
        // code and may touch this manager again.
        let previous = self.inner.teardown.lock().take();
        if let Some(teardown) = previous {
            teardown();
        }
        let manager = self.clone();
        let setter: SignalSetter = Arc::new(move |value| {
            manager.transition(|state| state.reported = value);
        });
        let teardown = installer(setter);
        *self.inner.teardown.lock() = Some(teardown);
    }

    /// Waits until the signal reads `true` or `cancel` fires.
    ///
    /// Returns immediately if the signal is already `true`. Returns `false`
    /// if cancelled first.
    pub async fn wait_until(&self, cancel: &CancellationToken) -> bool {
        // Subscribe before re-checking so a transition between the check
        // and the recv is not lost.
        let mut rx = self.subscribe();
        if self.get() {
            return true;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                received = rx.recv() => match received {
                    Ok(true) => return true,
                    Ok(false) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.get() {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                },
            }
        }
    }

    /// Applies `change` and broadcasts if the effective value flipped.
    fn transition<F: FnOnce(&mut SignalState)>(&self, change: F) {
        let flipped = {
            let mut state = self.inner.state.lock();
            let before = state.effective();
            change(&mut state);
            let after = state.effective();
            (before != after).then_some(after)
        };
        if let Some(value) = flipped {
            let _ = self.inner.tx.send(value);
        }
    }
}

/// Window-focus signal; `true` while the application is focused.
#[derive(Clone)]
pub struct FocusManager {
    signal: SignalManager,
}

impl FocusManager {
    /// Creates a focus manager that reads focused until told otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: SignalManager::new(true),
        }
    }

    /// Returns `true` if the application is considered focused.
    #[must_use]
    pub fn is_focused(&self) -> bool {
        self.signal.get()
    }

    /// Overrides the focus state, or clears the override with `None`.
    pub fn set_focused(&self, focused: Option<bool>) {
        self.signal.set(focused);
    }

    /// Replaces the focus event source. See
    /// [`SignalManager::set_event_listener`].
    pub fn set_event_listener<F>(&self, installer: F)
    where
        F: FnOnce(SignalSetter) -> Teardown,
    {
        self.signal.set_event_listener(installer);
    }

    /// Subscribes to focus transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.signal.subscribe()
    }
}

impl Default for FocusManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Connectivity signal; `true` while the network is considered reachable.
#[derive(Clone)]
pub struct OnlineManager {
    signal: SignalManager,
}

impl OnlineManager {
    /// Creates an online manager that reads online until told otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: SignalManager::new(true),
        }
    }

    /// Returns `true` if the network is considered reachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.signal.get()
    }

    /// Overrides the connectivity state, or clears the override with `None`.
    pub fn set_online(&self, online: Option<bool>) {
        self.signal.set(online);
    }

    /// Replaces the connectivity event source. See
    /// [`SignalManager::set_event_listener`].
    pub fn set_event_listener<F>(&self, installer: F)
    where
        F: FnOnce(SignalSetter) -> Teardown,
    {
        self.signal.set_event_listener(installer);
    }

    /// Subscribes to connectivity transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Parks until connectivity returns or `cancel` fires; returns `false`
    /// if cancelled first.
    pub(crate) async fn wait_until_online(&self, cancel: &CancellationToken) -> bool {
        self.signal.wait_until(cancel).await
    }
}

impl Default for OnlineManager {
    fn default() -> Self {
        Self::new()
    }
}
