pub mod broker;
pub mod client;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod offline;
pub mod publish;
pub mod query;
pub mod receive;
pub mod session;
pub mod storage;

pub use client::{ClientSettings, IngestClient, ReconnectPolicy};
pub use receive::LoopState;
