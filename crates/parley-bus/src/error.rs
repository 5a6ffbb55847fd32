#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,

    #[error("event bus unavailable: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("consumer {0} already has an active member")]
    ConsumerBusy(String),

    #[error("consumer {durable} is bound to group {existing:?}, not {requested:?}")]
    GroupMismatch {
        durable: String,
        existing: Option<String>,
        requested: Option<String>,
    },

    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode payload on {subject}: {source}")]
    Decode {
        subject: String,
        #[source]
        source: serde_json::Error,
    },
}
