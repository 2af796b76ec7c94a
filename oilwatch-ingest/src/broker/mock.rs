use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{
    Acknowledge, BrokerError, Delivery, Handle, InboundMessage, LinkSettings, Receiver, Transport,
};
use crate::credentials::Credentials;

/// Something the mock broker observed, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockEvent {
    Dialed,
    SessionOpened,
    ReceiverOpened,
    ReceiverClosed,
    SessionClosed,
    ConnectionClosed,
}

/// In-process broker used to drive the ingestion client without a network.
///
/// Messages pushed with [`MockTransport::push`] are handed out by whichever
/// receiver is currently attached. Failures can be scripted for the next
/// dial, session or receiver attempt.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    dials: AtomicUsize,
    receive_calls: AtomicUsize,
    accepted: AtomicUsize,
    dial_failures: Mutex<VecDeque<BrokerError>>,
    session_failures: Mutex<VecDeque<BrokerError>>,
    receiver_failures: Mutex<VecDeque<BrokerError>>,
    inbox: Mutex<VecDeque<Result<InboundMessage, BrokerError>>>,
    events: Mutex<Vec<MockEvent>>,
    credentials: Mutex<Vec<Credentials>>,
    links: Mutex<Vec<LinkSettings>>,
    hung_closes: Mutex<HashSet<MockEvent>>,
    inbox_ready: Notify,
    ack_seen: Notify,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockState {
    fn record(&self, event: MockEvent) {
        lock(&self.events).push(event);
    }

    /// Records `event`, or never returns if that close was told to hang.
    async fn finish_close(&self, event: MockEvent) {
        let hung = lock(&self.hung_closes).contains(&event);
        if hung {
            std::future::pending::<()>().await;
        }
        self.record(event);
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for delivery.
    pub fn push(&self, message: InboundMessage) {
        lock(&self.state.inbox).push_back(Ok(message));
        self.state.inbox_ready.notify_one();
    }

    /// Queue a receive failure, as if the link dropped.
    pub fn push_error(&self, error: BrokerError) {
        lock(&self.state.inbox).push_back(Err(error));
        self.state.inbox_ready.notify_one();
    }

    pub fn fail_next_dial(&self, error: BrokerError) {
        lock(&self.state.dial_failures).push_back(error);
    }

    pub fn fail_next_session(&self, error: BrokerError) {
        lock(&self.state.session_failures).push_back(error);
    }

    pub fn fail_next_receiver(&self, error: BrokerError) {
        lock(&self.state.receiver_failures).push_back(error);
    }

    /// Make every later close of this kind hang. Only close events apply.
    pub fn hang_close(&self, event: MockEvent) {
        lock(&self.state.hung_closes).insert(event);
    }

    pub fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub fn receive_calls(&self) -> usize {
        self.state.receive_calls.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<MockEvent> {
        lock(&self.state.events).clone()
    }

    /// Credentials presented on every dial, oldest first.
    pub fn credentials(&self) -> Vec<Credentials> {
        lock(&self.state.credentials).clone()
    }

    pub fn links(&self) -> Vec<LinkSettings> {
        lock(&self.state.links).clone()
    }

    /// Wait until at least `count` deliveries have been accepted.
    pub async fn wait_for_accepted(&self, count: usize) {
        loop {
            let notified = self.state.ack_seen.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.accepted() >= count {
                return;
            }
            notified.await;
        }
    }
}

pub struct MockConnection {
    state: Arc<MockState>,
}

pub struct MockSession {
    state: Arc<MockState>,
}

pub struct MockReceiver {
    state: Arc<MockState>,
    closed: AtomicBool,
}

struct MockAck {
    state: Arc<MockState>,
}

#[async_trait]
impl Transport for MockTransport {
    type Connection = MockConnection;
    type Session = MockSession;
    type Receiver = MockReceiver;

    async fn dial(
        &self,
        credentials: &Credentials,
        link: &LinkSettings,
    ) -> Result<Self::Connection, BrokerError> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.credentials).push(credentials.clone());
        lock(&self.state.links).push(link.clone());

        if let Some(error) = lock(&self.state.dial_failures).pop_front() {
            return Err(error);
        }

        self.state.record(MockEvent::Dialed);
        Ok(MockConnection {
            state: Arc::clone(&self.state),
        })
    }

    async fn open_session(
        &self,
        _connection: &Self::Connection,
    ) -> Result<Self::Session, BrokerError> {
        if let Some(error) = lock(&self.state.session_failures).pop_front() {
            return Err(error);
        }

        self.state.record(MockEvent::SessionOpened);
        Ok(MockSession {
            state: Arc::clone(&self.state),
        })
    }

    async fn open_receiver(
        &self,
        _session: &Self::Session,
        _link: &LinkSettings,
    ) -> Result<Self::Receiver, BrokerError> {
        if let Some(error) = lock(&self.state.receiver_failures).pop_front() {
            return Err(error);
        }

        self.state.record(MockEvent::ReceiverOpened);
        Ok(MockReceiver {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Handle for MockConnection {
    async fn close(&self) -> Result<(), BrokerError> {
        self.state.finish_close(MockEvent::ConnectionClosed).await;
        Ok(())
    }
}

#[async_trait]
impl Handle for MockSession {
    async fn close(&self) -> Result<(), BrokerError> {
        self.state.finish_close(MockEvent::SessionClosed).await;
        Ok(())
    }
}

#[async_trait]
impl Handle for MockReceiver {
    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.inbox_ready.notify_waiters();
        self.state.finish_close(MockEvent::ReceiverClosed).await;
        Ok(())
    }
}

#[async_trait]
impl Receiver for MockReceiver {
    async fn receive(&self) -> Result<Delivery, BrokerError> {
        self.state.receive_calls.fetch_add(1, Ordering::SeqCst);

        loop {
            let notified = self.state.inbox_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Receive("receiver detached".into()));
            }

            let next = lock(&self.state.inbox).pop_front();
            if let Some(next) = next {
                let message = next?;
                let ack = MockAck {
                    state: Arc::clone(&self.state),
                };
                return Ok(Delivery::new(message, Box::new(ack)));
            }

            notified.await;
        }
    }
}

#[async_trait]
impl Acknowledge for MockAck {
    async fn accept(&self) -> Result<(), BrokerError> {
        self.state.accepted.fetch_add(1, Ordering::SeqCst);
        self.state.ack_seen.notify_waiters();
        Ok(())
    }
}
