use std::fmt;

use async_trait::async_trait;
use mainframe_model::StatusChange;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::Result;

/// Receives status changes after they were committed.
///
/// Delivery is best-effort: a failing publisher is logged and never undoes
/// the ledger update that produced the event.
#[async_trait]
pub trait StatusEventPublisher: Send + Sync + fmt::Debug {
    async fn publish(&self, event: StatusChange) -> Result<()>;
}

/// Fans status changes out to in-process subscribers (alerting, metrics).
pub struct InProcStatusEventBus {
    sender: broadcast::Sender<StatusChange>,
    capacity: usize,
}

impl fmt::Debug for InProcStatusEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcStatusEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcStatusEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.sender.subscribe()
    }
}

impl Default for InProcStatusEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl StatusEventPublisher for InProcStatusEventBus {
    async fn publish(&self, event: StatusChange) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusEventPublisher;

#[async_trait]
impl StatusEventPublisher for NoopStatusEventPublisher {
    async fn publish(&self, _event: StatusChange) -> Result<()> {
        Ok(())
    }
}

pub(crate) async fn publish_best_effort(
    publisher: &dyn StatusEventPublisher,
    event: StatusChange,
) {
    let package = event.package.clone();
    let new_status = event.new_status;
    if let Err(err) = publisher.publish(event).await {
        warn!(
            package = %package,
            status = %new_status,
            "status event delivery failed: {err}"
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use mainframe_model::{PackageKey, PackageStatus};

    use super::*;

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = InProcStatusEventBus::new(8);
        let mut rx = bus.subscribe();
        let event = StatusChange {
            package: PackageKey::new("requests", "2.32.0").unwrap(),
            old_status: PackageStatus::Leased,
            new_status: PackageStatus::Clean,
            findings: None,
            at: Utc::now(),
        };
        bus.publish(event.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_succeeds() {
        let bus = InProcStatusEventBus::default();
        let event = StatusChange {
            package: PackageKey::new("six", "1.16.0").unwrap(),
            old_status: PackageStatus::Leased,
            new_status: PackageStatus::Unscanned,
            findings: None,
            at: Utc::now(),
        };
        assert!(bus.publish(event).await.is_ok());
    }
}
