//! Notification delivery for detected changes.
//!
//! This crate provides:
//! - `Notifier` trait for pluggable delivery channels
//! - Discord webhook and Discord bot notifier implementations
//! - Minijinja template rendering for message bodies
//! - `DeliveryTask`, which wraps one send as a rate-limited queue task

pub mod delivery;
pub mod discord;
pub mod message;
pub mod templating;
pub mod traits;
pub mod webhook;

pub use delivery::DeliveryTask;
pub use discord::DiscordBotNotifier;
pub use message::{MessageBuilder, MessageTemplates};
pub use templating::TemplateRenderer;
pub use traits::{Embed, EmbedField, EmbedFooter, Notification, Notifier, NotifyError};
pub use webhook::DiscordWebhookNotifier;
