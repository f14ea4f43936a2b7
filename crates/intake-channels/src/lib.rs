//! Channel adapters for Intake.
//!
//! Normalises Telegram webhook updates and web widget requests into
//! canonical inbound messages and delivers `message.send` events back to
//! the participant through the matching transport.
//!
//! Scoring and transcription events leave through [`WebhookForwarder`].

pub mod adapter;
pub mod delivery;
pub mod error;
pub mod telegram;
pub mod web;
pub mod webhook;

pub use adapter::ChannelAdapter;
pub use delivery::{Delivery, DeliveryWorker};
pub use error::ChannelError;
pub use telegram::{parse_update, TelegramAdapter, Update};
pub use web::{WebAdapter, WebInbound, WebReply};
pub use webhook::WebhookForwarder;
