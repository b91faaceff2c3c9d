use crate::lanes::report::RunReport;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::broadcast;

// ---------- Topic trait (broadcast semantics) ----------
#[async_trait::async_trait]
pub trait Topic<T>: Sync + Send + 'static {
    /// Publish a message to all subscribers.
    async fn publish(&self, msg: T) -> Result<()>;

    /// Each subscriber gets an independent cursor.
    fn subscribe(&self) -> broadcast::Receiver<Arc<T>>;
}

// 1->N fanout, lossy under lag. Payloads travel as Arc<T>.
pub struct BroadcastTopic<T: Clone + Send + Sync + 'static> {
    tx: broadcast::Sender<Arc<T>>,
}

impl<T: Clone + Send + Sync + 'static> BroadcastTopic<T> {
    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _rx) = broadcast::channel(cap);
        Self { tx }
    }
}

#[async_trait]
impl<T: Debug + Clone + Send + Sync + 'static> Topic<T> for BroadcastTopic<T> {
    async fn publish(&self, msg: T) -> Result<()> {
        // only fails when nobody is listening
        let _ = self.tx.send(Arc::new(msg));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<T>> {
        self.tx.subscribe()
    }
}

#[derive(Clone)]
pub struct Bus {
    pub run_reports: Arc<dyn Topic<RunReport>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            run_reports: Arc::new(BroadcastTopic::<RunReport>::with_capacity(256)),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lanes::report::{BundleSummary, Lane, LaneSummary, ReportBuilder};
    use chrono::Utc;

    #[tokio::test]
    async fn every_subscriber_sees_published_reports() {
        let bus = Bus::new();
        let mut a = bus.run_reports.subscribe();
        let mut b = bus.run_reports.subscribe();

        let report = ReportBuilder::new(Lane::Bundle, Utc::now(), true)
            .finish(LaneSummary::Bundle(BundleSummary::default()));
        bus.run_reports.publish(report.clone()).await.unwrap();

        assert_eq!(a.recv().await.unwrap().run_id, report.run_id);
        assert_eq!(b.recv().await.unwrap().run_id, report.run_id);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_not_an_error() {
        let bus = Bus::new();
        let report = ReportBuilder::new(Lane::Lane0, Utc::now(), false)
            .finish(LaneSummary::Lane0(Default::default()));
        assert!(bus.run_reports.publish(report).await.is_ok());
    }
}
