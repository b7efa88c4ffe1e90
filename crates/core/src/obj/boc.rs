//! The busy-object core (BOC).
//!
//! A BOC is the rendezvous between the single fetch thread filling an
//! object and the deliverers streaming it out. It carries:
//! 1. **State:** The forward-only fetch state machine.
//! 2. **Progress:** `fetched_so_far` / `delivered_so_far` byte counts used
//!    for transit-buffer backpressure.
//! 3. **Notifications:** The queue of pending async-iteration callbacks.
//!
//! The BOC is shared (`Arc`): the objcore holds one reference while the
//! fetch is live, and every streaming deliverer takes its own.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::storage::chunk::Chunk;
use crate::storage::vai::VaiNotify;

/// Fetch progress states. Strictly ordered; state only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BocState {
    /// Created, nothing decided yet.
    Invalid = 0,
    /// The backend request has been sent.
    ReqDone = 1,
    /// Headers are in; the object is being prepared for streaming.
    PrepStream = 2,
    /// Body bytes are streaming in and may be delivered concurrently.
    Stream = 3,
    /// The body is complete; the LEN attribute is final.
    Finished = 4,
    /// The fetch failed; the body will never complete.
    Failed = 5,
}

/// Storage cursor holding SML trim leftovers across the BOC's lifetime.
#[derive(Debug, Default)]
pub enum BocPriv {
    /// Trim has not run.
    #[default]
    Unset,
    /// Trim ran and left nothing to free.
    Trimmed,
    /// Trim replaced this oversized chunk; freed when the BOC retires.
    Leftover(Arc<Chunk>),
}

/// Mutable BOC state, guarded by the BOC mutex.
pub struct BocInner {
    /// Current fetch state.
    pub state: BocState,
    /// Bytes committed by the fetcher, monotonically non-decreasing.
    pub fetched_so_far: u64,
    /// Highest byte offset any deliverer has reported consuming.
    pub delivered_so_far: u64,
    /// Max bytes the fetcher may run ahead of the slowest deliverer;
    /// 0 disables throttling.
    pub transit_buffer: u64,
    /// Opaque storage cursor (trim leftovers).
    pub stevedore_priv: BocPriv,
    /// Pending one-shot lease notifications.
    vai_q: Vec<Arc<dyn VaiNotify>>,
}

impl std::fmt::Debug for BocInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BocInner")
            .field("state", &self.state)
            .field("fetched_so_far", &self.fetched_so_far)
            .field("delivered_so_far", &self.delivered_so_far)
            .field("transit_buffer", &self.transit_buffer)
            .field("pending_notifies", &self.vai_q.len())
            .finish()
    }
}

/// The busy-object core.
pub struct Boc {
    inner: Mutex<BocInner>,
    cond: Condvar,
}

impl std::fmt::Debug for Boc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Boc").field("inner", &*self.lock()).finish()
    }
}

/// Backpressure wait slice. The client side may update
/// `delivered_so_far` without signaling, so the fetcher re-checks on a
/// timer rather than relying purely on wakeups.
const CONDWAIT_SLICE: Duration = Duration::from_millis(100);

impl Boc {
    /// Creates a BOC in `Invalid` state with the given transit buffer.
    pub fn new(transit_buffer: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BocInner {
                state: BocState::Invalid,
                fetched_so_far: 0,
                delivered_so_far: 0,
                transit_buffer,
                stevedore_priv: BocPriv::Unset,
                vai_q: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    /// Locks and returns the inner state.
    pub(crate) fn lock(&self) -> MutexGuard<'_, BocInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current state.
    pub fn state(&self) -> BocState {
        self.lock().state
    }

    /// Bytes committed so far.
    pub fn fetched_so_far(&self) -> u64 {
        self.lock().fetched_so_far
    }

    /// Configured transit buffer.
    pub fn transit_buffer(&self) -> u64 {
        self.lock().transit_buffer
    }

    /// Reconfigures the transit buffer (before streaming starts).
    pub fn set_transit_buffer(&self, limit: u64) {
        self.lock().transit_buffer = limit;
    }

    /// Advances the state machine. `next` must be strictly greater than
    /// the current state; the caller has already validated the
    /// stream/finished preconditions.
    pub(crate) fn advance(&self, next: BocState) {
        let mut st = self.lock();
        assert!(next > st.state, "boc state may only move forward");
        st.state = next;
        Self::drain_notifications(&mut st);
        self.cond.notify_all();
    }

    /// Commits `len` body bytes after the storage extend has run, waking
    /// waiters and pending lease notifications.
    pub(crate) fn commit(&self, len: u64) {
        let mut st = self.lock();
        assert!(st.state < BocState::Finished);
        st.fetched_so_far += len;
        Self::drain_notifications(&mut st);
        self.cond.notify_all();
    }

    /// Backpressure loop run by the fetcher before committing `len` more
    /// bytes. Blocks while the transit buffer is exceeded, unless
    /// `cancelled()` becomes true.
    ///
    /// Spurious progress is tolerated by design: a deliverer may bump
    /// `delivered_so_far` without signaling, so the wait is timed.
    pub(crate) fn throttle(&self, cancelled: &dyn Fn() -> bool) {
        let mut st = self.lock();
        if st.transit_buffer == 0 {
            return;
        }
        while !cancelled()
            && st.fetched_so_far > st.delivered_so_far + st.transit_buffer
        {
            let (g, _timeout) = self
                .cond
                .wait_timeout(st, CONDWAIT_SLICE)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            st = g;
        }
    }

    /// Blocks until the state reaches at least `want`.
    ///
    /// If `cancelled()` holds on entry, the condvar is signalled once
    /// first so a fetcher stalled in the transit-buffer throttle gets
    /// released.
    pub fn wait_state(&self, want: BocState, cancelled: &dyn Fn() -> bool) {
        let mut st = self.lock();
        if cancelled() {
            self.cond.notify_one();
        }
        while st.state < want {
            st = self
                .cond
                .wait(st)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Deliverer-side wait for bytes beyond offset `l`.
    ///
    /// Publishes `delivered_so_far = l` (when throttling is on) and
    /// signals the fetcher, then waits until `fetched_so_far > l` or the
    /// state reaches `Finished`/`Failed`. Returns the observed byte count
    /// and the state at the moment of wakeup.
    pub fn wait_extend(&self, l: u64) -> (u64, BocState) {
        let mut st = self.lock();
        loop {
            let rv = st.fetched_so_far;
            assert!(l <= rv || st.state == BocState::Failed);
            if st.transit_buffer > 0 {
                st.delivered_so_far = l;
                self.cond.notify_one();
            }
            let state = st.state;
            if rv > l || state >= BocState::Finished {
                return (rv, state);
            }
            st = self
                .cond
                .wait(st)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Non-blocking variant for async iteration.
    ///
    /// Like [`Boc::wait_extend`] but instead of blocking, registers
    /// `notify` to be fired on the next commit or state change when no
    /// progress is available. Returns the observed byte count and state.
    pub fn vai_get_extend(
        &self,
        l: u64,
        notify: &Arc<dyn VaiNotify>,
    ) -> (u64, BocState) {
        let mut st = self.lock();
        let rv = st.fetched_so_far;
        assert!(l <= rv || st.state == BocState::Failed);
        if st.transit_buffer > 0 {
            st.delivered_so_far = l;
            self.cond.notify_one();
        }
        let state = st.state;
        if rv <= l && state < BocState::Finished {
            let queued = st.vai_q.iter().any(|q| Arc::ptr_eq(q, notify));
            if !queued {
                st.vai_q.push(Arc::clone(notify));
            }
        }
        (rv, state)
    }

    /// Removes a pending notification registered by
    /// [`Boc::vai_get_extend`], if any.
    pub fn vai_cancel(&self, notify: &Arc<dyn VaiNotify>) {
        let mut st = self.lock();
        st.vai_q.retain(|q| !Arc::ptr_eq(q, notify));
    }

    /// Fires and clears all pending notifications. Runs with the BOC
    /// mutex held; callbacks must not block.
    fn drain_notifications(st: &mut BocInner) {
        for q in st.vai_q.drain(..) {
            q.notify();
        }
    }

    /// Takes the stevedore cursor, leaving `Unset`.
    pub(crate) fn take_priv(&self) -> BocPriv {
        std::mem::take(&mut self.lock().stevedore_priv)
    }

    /// Replaces the stevedore cursor, returning the previous value.
    pub(crate) fn swap_priv(&self, p: BocPriv) -> BocPriv {
        std::mem::replace(&mut self.lock().stevedore_priv, p)
    }

    /// If the cursor parks exactly `st`, marks it consumed and returns
    /// true. Used when a deliverer returns the lease on a chunk that
    /// trim had parked for later release.
    pub(crate) fn clear_leftover_if(&self, st: &Arc<Chunk>) -> bool {
        let mut g = self.lock();
        if let BocPriv::Leftover(parked) = &g.stevedore_priv {
            if Arc::ptr_eq(parked, st) {
                g.stevedore_priv = BocPriv::Trimmed;
                return true;
            }
        }
        false
    }
}
