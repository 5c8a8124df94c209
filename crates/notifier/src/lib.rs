//! Delivery workers.
//!
//! Workers consume the delivery queue and hand each task to the channel
//! adapters (email via the Resend HTTP API, Telegram via the Bot API), then
//! write the outcome back to the notification store.

pub mod adapter;
pub mod email;
pub mod telegram;
pub mod worker;

pub use adapter::{AdapterRegistry, ChannelAdapter, DeliveryError};
pub use worker::{DeliveryWorker, HandleOutcome, WorkerPool};
