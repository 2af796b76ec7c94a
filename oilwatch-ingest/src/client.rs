use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::broker::{BrokerError, LinkSettings, Transport};
use crate::credentials::CredentialSigner;
use crate::dispatch::Dispatcher;
use crate::offline::{DEFAULT_CHECK_INTERVAL, DEFAULT_OFFLINE_TIMEOUT, OfflineDetector};
use crate::session::{BrokerSession, SessionSlot, close_handle};
use crate::storage::DeviceStorage;

/// How the receive loop retries after losing the link.
///
/// The default is a single immediate attempt; a failed attempt ends the loop
/// and leaves recovery to whatever supervises the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given zero-based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub signer: CredentialSigner,
    pub link: LinkSettings,
    pub reconnect: ReconnectPolicy,
    pub offline_timeout: Duration,
    pub check_interval: Duration,
}

impl ClientSettings {
    pub fn new(signer: CredentialSigner) -> Self {
        Self {
            signer,
            link: LinkSettings::default(),
            reconnect: ReconnectPolicy::default(),
            offline_timeout: DEFAULT_OFFLINE_TIMEOUT,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// Ingestion client: owns the broker session, the dispatcher and the
/// offline detector.
pub struct IngestClient<T: Transport, S: DeviceStorage> {
    pub(crate) transport: T,
    pub(crate) signer: CredentialSigner,
    pub(crate) link: LinkSettings,
    pub(crate) reconnect: ReconnectPolicy,
    pub(crate) dispatcher: Arc<Dispatcher<S>>,
    pub(crate) detector: OfflineDetector<S>,
    pub(crate) slot: SessionSlot<T>,
    pub(crate) stop: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

impl<T: Transport, S: DeviceStorage> IngestClient<T, S> {
    pub fn new(transport: T, storage: S, settings: ClientSettings) -> Self {
        Self {
            transport,
            signer: settings.signer,
            link: settings.link,
            reconnect: settings.reconnect,
            dispatcher: Arc::new(Dispatcher::new(storage.clone())),
            detector: OfflineDetector::new(
                storage,
                settings.offline_timeout,
                settings.check_interval,
            ),
            slot: SessionSlot::default(),
            stop: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    pub(crate) fn is_stopping(&self, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.stop.is_cancelled() || self.slot.is_closed()
    }

    /// Opens connection, session and receiver with freshly signed
    /// credentials and installs them as the live session.
    ///
    /// A failed step closes whatever this attempt already opened. The
    /// offline detector is started by the first successful connect.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        if self.slot.is_closed() {
            return Err(BrokerError::Closed);
        }

        let credentials = self.signer.sign_now()?;
        let connection = self.transport.dial(&credentials, &self.link).await?;

        let session = match self.transport.open_session(&connection).await {
            Ok(session) => session,
            Err(e) => {
                close_handle("connection", &connection).await;
                return Err(e);
            }
        };

        let receiver = match self.transport.open_receiver(&session, &self.link).await {
            Ok(receiver) => receiver,
            Err(e) => {
                close_handle("session", &session).await;
                close_handle("connection", &connection).await;
                return Err(e);
            }
        };

        let fresh = Arc::new(BrokerSession {
            connection,
            session,
            receiver,
        });

        match self.slot.install(fresh) {
            Ok(Some(previous)) => {
                debug!("replacing previous broker session");
                previous.close().await;
            }
            Ok(None) => {}
            Err(fresh) => {
                fresh.close().await;
                return Err(BrokerError::Closed);
            }
        }

        info!(queue = %self.link.queue, prefetch = self.link.prefetch, "subscribed to broker");

        let detector = self.detector.clone();
        let cancel = cancel.clone();
        let stop = self.stop.clone();
        if self
            .slot
            .start_detector_once(move || tokio::spawn(detector.run(cancel, stop)))
        {
            debug!("offline detector scheduled");
        }

        Ok(())
    }

    /// Tears down the broker session once. Later calls return immediately.
    ///
    /// Each handle gets [`crate::session::CLOSE_TIMEOUT`] to close so a hung
    /// broker cannot stall shutdown.
    pub async fn close(&self) {
        let Some(teardown) = self.slot.begin_close() else {
            debug!("client already closed");
            return;
        };

        info!("closing broker connection");
        self.stop.cancel();

        if let Some(detector) = teardown.detector {
            detector.abort();
        }
        if let Some(session) = teardown.session {
            session.close().await;
        }

        info!("broker connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_one_immediate_attempt() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff(0), Duration::ZERO);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }
}
