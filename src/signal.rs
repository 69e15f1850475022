//! Cancellation signals and the merger that combines several of them.
//!
//! An [`AbortSignal`] transitions once from active to aborted, carrying an
//! [`AbortReason`]. [`any`] merges several signals into one whose lifetime is
//! owned by the returned [`AnySignal`]: dropping it detaches every listener
//! it registered on the source signals, so long-lived sources (a process-wide
//! shutdown signal, for instance) never accumulate listeners from
//! short-lived requests.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Why a signal was aborted.
#[derive(Clone, Debug)]
pub enum AbortReason {
    /// Aborted without an explicit reason.
    Aborted,
    /// Aborted with a descriptive message.
    Message(String),
    /// Aborted with an error value, attached as the failure's cause.
    Error(Arc<dyn std::error::Error + Send + Sync>),
    /// Aborted because a deadline elapsed.
    Timeout,
}

impl AbortReason {
    /// Wraps an error value as an abort reason.
    pub fn error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Error(Arc::new(error))
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => f.write_str("aborted"),
            Self::Message(message) => f.write_str(message),
            Self::Error(error) => write!(f, "{error}"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

type Listener = Box<dyn FnOnce(&AbortReason) + Send>;

#[derive(Default)]
struct State {
    reason: Option<AbortReason>,
    listeners: Vec<(u64, Listener)>,
    next_id: u64,
}

struct Inner {
    state: Mutex<State>,
    aborted: watch::Sender<bool>,
}

impl Inner {
    fn new() -> Self {
        let (aborted, _) = watch::channel(false);
        Self {
            state: Mutex::new(State::default()),
            aborted,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cancellation token observed by transports.
///
/// Clones share state: aborting through any [`AbortController`] aborts every
/// clone of its signal.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<Inner>,
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("AbortSignal")
            .field("aborted", &state.reason.is_some())
            .field("reason", &state.reason)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Returns a signal that is already aborted with `reason`.
    pub fn aborted_with(reason: AbortReason) -> Self {
        let signal = Self::new();
        signal.trigger(reason);
        signal
    }

    /// Returns a signal that aborts with [`AbortReason::Timeout`] once
    /// `duration` has elapsed.
    ///
    /// The timer is cancelled when the returned [`TimeoutSignal`] is dropped.
    /// Must be called from within a Tokio runtime.
    pub fn timeout(duration: Duration) -> TimeoutSignal {
        let signal = Self::new();
        let target = Arc::downgrade(&signal.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(inner) = target.upgrade() {
                AbortSignal { inner }.trigger(AbortReason::Timeout);
            }
        });
        TimeoutSignal { signal, timer }
    }

    /// Whether the signal has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.inner.lock().reason.is_some()
    }

    /// The abort reason, if aborted.
    pub fn reason(&self) -> Option<AbortReason> {
        self.inner.lock().reason.clone()
    }

    /// Waits until the signal is aborted and returns the reason.
    pub async fn aborted(&self) -> AbortReason {
        let mut receiver = self.inner.aborted.subscribe();
        // The sender lives as long as `self.inner`, so the channel cannot close here.
        let _ = receiver.wait_for(|aborted| *aborted).await;
        self.reason().unwrap_or(AbortReason::Aborted)
    }

    /// Whether both handles refer to the same signal.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of listeners currently registered on this signal.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Registers `listener`, returning its id, or `None` when the signal is
    /// already aborted (the listener is dropped without being called).
    fn add_listener(&self, listener: Listener) -> Option<u64> {
        let mut state = self.inner.lock();
        if state.reason.is_some() {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, listener));
        Some(id)
    }

    fn remove_listener(&self, id: u64) {
        self.inner
            .lock()
            .listeners
            .retain(|(listener_id, _)| *listener_id != id);
    }

    fn trigger(&self, reason: AbortReason) {
        let listeners = {
            let mut state = self.inner.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.listeners)
        };
        self.inner.aborted.send_replace(true);
        // Listeners run outside the lock; they may touch other signals.
        for (_, listener) in listeners {
            listener(&reason);
        }
    }
}

/// Owns an [`AbortSignal`] and can abort it.
#[derive(Debug)]
pub struct AbortController {
    signal: AbortSignal,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    /// Creates a controller with a fresh, active signal.
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    /// Returns a handle to the controlled signal.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Aborts the signal without a reason.
    pub fn abort(&self) {
        self.signal.trigger(AbortReason::Aborted);
    }

    /// Aborts the signal with `reason`. Later calls have no effect.
    pub fn abort_with(&self, reason: AbortReason) {
        self.signal.trigger(reason);
    }
}

/// A signal that aborts after a fixed delay.
#[derive(Debug)]
pub struct TimeoutSignal {
    signal: AbortSignal,
    timer: JoinHandle<()>,
}

impl TimeoutSignal {
    /// The signal that aborts once the delay has elapsed.
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }
}

impl Drop for TimeoutSignal {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

struct Link {
    source: Weak<Inner>,
    id: u64,
}

type Links = Arc<Mutex<Vec<Link>>>;

fn detach(links: &Links) {
    let links = std::mem::take(&mut *links.lock().unwrap_or_else(PoisonError::into_inner));
    for link in links {
        if let Some(inner) = link.source.upgrade() {
            AbortSignal { inner }.remove_listener(link.id);
        }
    }
}

/// The logical OR of several signals, as returned by [`any`].
///
/// Dropping this value releases every listener it registered on its
/// sources. The merged signal stays readable through clones, but stops
/// following its sources once released.
pub struct AnySignal {
    signal: AbortSignal,
    links: Option<Links>,
}

impl fmt::Debug for AnySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnySignal")
            .field("signal", &self.signal)
            .field("derived", &self.links.is_some())
            .finish()
    }
}

impl AnySignal {
    fn passthrough(signal: AbortSignal) -> Self {
        Self {
            signal,
            links: None,
        }
    }

    /// The effective signal.
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Detaches from all sources. Equivalent to dropping.
    pub fn release(self) {}
}

impl Drop for AnySignal {
    fn drop(&mut self) {
        if let Some(links) = self.links.take() {
            detach(&links);
        }
    }
}

/// Merges `signals` into one that aborts as soon as any source aborts,
/// carrying that source's reason.
///
/// - no signals: `None`, nothing can abort the request;
/// - one signal: that same signal, unwrapped;
/// - any source already aborted: that source, without allocating;
/// - otherwise a derived signal, linked to each source by a listener that
///   holds only a weak reference to it.
pub fn any<I>(signals: I) -> Option<AnySignal>
where
    I: IntoIterator<Item = AbortSignal>,
{
    let mut signals: Vec<AbortSignal> = signals.into_iter().collect();
    if signals.len() <= 1 {
        return signals.pop().map(AnySignal::passthrough);
    }
    if let Some(aborted) = signals.iter().find(|signal| signal.is_aborted()) {
        return Some(AnySignal::passthrough(aborted.clone()));
    }

    let derived = AbortSignal::new();
    let links: Links = Arc::new(Mutex::new(Vec::with_capacity(signals.len())));

    for source in &signals {
        let target = Arc::downgrade(&derived.inner);
        let listener: Listener = Box::new(move |reason| {
            if let Some(inner) = target.upgrade() {
                AbortSignal { inner }.trigger(reason.clone());
            }
        });
        match source.add_listener(listener) {
            Some(id) => links
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Link {
                    source: Arc::downgrade(&source.inner),
                    id,
                }),
            None => {
                // Aborted between the scan above and registration.
                derived.trigger(source.reason().unwrap_or(AbortReason::Aborted));
                break;
            }
        }
    }

    let on_abort = Arc::clone(&links);
    if derived
        .add_listener(Box::new(move |_| detach(&on_abort)))
        .is_none()
    {
        detach(&links);
    }

    Some(AnySignal {
        signal: derived,
        links: Some(links),
    })
}
