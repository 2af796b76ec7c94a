use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::{Handle, Transport};

/// Upper bound on each handle's close during teardown.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// One live connection: connection, session and receiver.
pub struct BrokerSession<T: Transport> {
    pub connection: T::Connection,
    pub session: T::Session,
    pub receiver: T::Receiver,
}

impl<T: Transport> BrokerSession<T> {
    /// Closes receiver, session, then connection. Failures and timeouts are
    /// logged; teardown always runs to the end.
    pub async fn close(&self) {
        close_handle("receiver", &self.receiver).await;
        close_handle("session", &self.session).await;
        close_handle("connection", &self.connection).await;
    }
}

pub(crate) async fn close_handle<H: Handle>(name: &'static str, handle: &H) {
    match tokio::time::timeout(CLOSE_TIMEOUT, handle.close()).await {
        Ok(Ok(())) => debug!(handle = name, "closed"),
        Ok(Err(e)) => warn!(handle = name, error = %e, "close failed"),
        Err(_) => warn!(handle = name, "close timed out"),
    }
}

pub type SharedSession<T> = Arc<BrokerSession<T>>;

struct SlotState<T: Transport> {
    session: Option<SharedSession<T>>,
    detector: Option<JoinHandle<()>>,
    closed: bool,
}

/// What `close` has to tear down, taken atomically.
pub struct Teardown<T: Transport> {
    pub session: Option<SharedSession<T>>,
    pub detector: Option<JoinHandle<()>>,
}

/// Sole owner of the live session.
///
/// Every mutation happens under one lock; callers only ever receive `Arc`
/// snapshots, so network calls never run while the lock is held.
pub struct SessionSlot<T: Transport> {
    state: Mutex<SlotState<T>>,
}

impl<T: Transport> Default for SessionSlot<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState {
                session: None,
                detector: None,
                closed: false,
            }),
        }
    }
}

impl<T: Transport> SessionSlot<T> {
    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Option<SharedSession<T>> {
        self.lock().session.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Swaps in a new session and returns the one it replaced.
    ///
    /// Once closed, the slot refuses new sessions and hands the fresh one
    /// back so the caller can tear it down.
    pub fn install(
        &self,
        session: SharedSession<T>,
    ) -> Result<Option<SharedSession<T>>, SharedSession<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(session);
        }
        Ok(state.session.replace(session))
    }

    /// Starts the detector unless one was already started or the slot is
    /// closed. Returns whether `spawn` ran.
    pub fn start_detector_once(&self, spawn: impl FnOnce() -> JoinHandle<()>) -> bool {
        let mut state = self.lock();
        if state.closed || state.detector.is_some() {
            return false;
        }
        state.detector = Some(spawn());
        true
    }

    /// Marks the slot closed. Only the first caller gets the resources.
    pub fn begin_close(&self) -> Option<Teardown<T>> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.closed = true;

        Some(Teardown {
            session: state.session.take(),
            detector: state.detector.take(),
        })
    }
}
