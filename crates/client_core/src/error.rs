use thiserror::Error;

/// Why an inbound push frame could not be turned into an event.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not a push envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("'{action}' frame carries an unreadable story: {source}")]
    Payload {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync runtime is no longer running")]
    RuntimeClosed,
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}
