use serde::Serialize;
use tracing::warn;

use parley_bus::BusClient;
use parley_types::subjects::Subject;

/// What happened to a best-effort publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the bus under this stream entry id.
    Published(String),
    /// The bus refused the event. Already logged.
    Dropped,
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published(_))
    }
}

/// Publishing that never fails the caller.
///
/// Used after the durable write has happened: the write stands whether or
/// not the real-time side effects get out, and a failure is only logged.
pub struct BestEffort<'a> {
    bus: &'a BusClient,
}

impl<'a> BestEffort<'a> {
    pub fn new(bus: &'a BusClient) -> Self {
        Self { bus }
    }

    pub async fn publish<T: Serialize>(&self, subject: Subject, value: &T) -> PublishOutcome {
        match self.bus.publish_json(subject, value).await {
            Ok(id) => PublishOutcome::Published(id),
            Err(e) => {
                warn!(subject = subject.as_str(), "Best-effort publish dropped: {}", e);
                PublishOutcome::Dropped
            }
        }
    }
}
