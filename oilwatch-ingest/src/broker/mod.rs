//! Broker transport abstraction.
//!
//! A live subscription is built from three handles, opened in order:
//! connection, session, receiver. Each can be closed on its own so a
//! failed attempt can unwind exactly what it opened.

pub mod mock;
pub mod mqtt;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::credentials::{CredentialError, Credentials};

/// Queue the broker routes the consumer group's traffic to.
pub const DEFAULT_QUEUE: &str = "default";
/// Maximum number of unacknowledged messages in flight.
pub const DEFAULT_PREFETCH: u16 = 20;

pub const TOPIC_PROPERTY: &str = "topic";
pub const GENERATE_TIME_PROPERTY: &str = "generateTime";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("credential signing failed: {0}")]
    Credentials(#[from] CredentialError),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("operation timed out")]
    Timeout,
    #[error("client is closed")]
    Closed,
}

/// Where and how much to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub queue: String,
    pub prefetch: u16,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    String(String),
    Long(i64),
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub payload: Bytes,
    pub properties: HashMap<String, PropertyValue>,
}

impl InboundMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn topic(&self) -> Option<&str> {
        match self.properties.get(TOPIC_PROPERTY)? {
            PropertyValue::String(topic) => Some(topic),
            PropertyValue::Long(_) => None,
        }
    }

    /// Device-side generation time in epoch milliseconds, when declared.
    pub fn generate_time_ms(&self) -> Option<i64> {
        match self.properties.get(GENERATE_TIME_PROPERTY)? {
            PropertyValue::Long(ms) => Some(*ms),
            PropertyValue::String(s) => s.trim().parse().ok(),
        }
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn accept(&self) -> Result<(), BrokerError>;
}

/// A received message plus the means to acknowledge it.
pub struct Delivery {
    pub message: InboundMessage,
    ack: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: InboundMessage, ack: Box<dyn Acknowledge>) -> Self {
        Self { message, ack }
    }

    /// Removes the message from the broker's redelivery set.
    pub async fn accept(&self) -> Result<(), BrokerError> {
        self.ack.accept().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Handle: Send + Sync + 'static {
    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Receiver: Handle {
    /// Waits for the next message. Must be cancel safe.
    async fn receive(&self) -> Result<Delivery, BrokerError>;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Handle;
    type Session: Handle;
    type Receiver: Receiver;

    async fn dial(
        &self,
        credentials: &Credentials,
        link: &LinkSettings,
    ) -> Result<Self::Connection, BrokerError>;

    async fn open_session(
        &self,
        connection: &Self::Connection,
    ) -> Result<Self::Session, BrokerError>;

    async fn open_receiver(
        &self,
        session: &Self::Session,
        link: &LinkSettings,
    ) -> Result<Self::Receiver, BrokerError>;
}
