//! Consumers of decoded notifications.
//!
//! - `presentation`: how a notification is shown (link, text page, attachment page).
//! - `tabs`: sink that opens notifications as tabs grouped by topic.

/// Notification classification and page rendering.
pub mod presentation;
/// Tab host abstraction and the topic-grouping tab sink.
pub mod tabs;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::stream::proto::NotificationMessage;

/// Reason a sink refused or failed to handle a notification.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The tab host rejected an operation.
    #[error("tab host error: {0}")]
    Host(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Receives every decoded notification, in stream order.
///
/// Returning `Ok` acknowledges the message and lets the reader advance the
/// resume cursor. A message can be delivered again after a crash between
/// acknowledgement and cursor write, so implementations should tolerate
/// duplicates.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn handle(&self, message: &NotificationMessage) -> Result<(), SinkError>;
}

/// Sink that records each notification as a `tracing` event.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

#[async_trait]
impl MessageSink for LogSink {
    async fn handle(&self, message: &NotificationMessage) -> Result<(), SinkError> {
        info!(
            event = "notification",
            kind = ?message.event,
            topic = %message.topic,
            title = message.display_title(),
            time = message.time,
            body = message.message.as_deref().unwrap_or_default(),
        );
        Ok(())
    }
}
