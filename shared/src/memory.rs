//! In-process bus with the same group/offset semantics as the Kafka adapter.
//! Used by tests and for running a service without a broker.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::bus::{Delivery, Publisher, Record, Subscription};

#[derive(Default)]
struct BusState {
    logs: HashMap<String, Vec<Record>>,
    committed: HashMap<(String, String), usize>,
    failing_publishes: usize,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BusState>,
    appended: Notify,
}

/// Every topic is a single-partition append-only log. Consumer groups keep
/// independent committed offsets; a new subscription resumes from them.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, group_id: &str, topics: &[&str]) -> MemorySubscription {
        let state = self.inner.state.lock();
        let cursors = topics
            .iter()
            .map(|topic| {
                let committed = state
                    .committed
                    .get(&(group_id.to_string(), topic.to_string()))
                    .copied()
                    .unwrap_or(0);
                (topic.to_string(), committed)
            })
            .collect();

        MemorySubscription {
            bus: self.clone(),
            group_id: group_id.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            cursors,
        }
    }

    /// Every record ever published to `topic`, in order.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.inner
            .state
            .lock()
            .logs
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Offset the group will resume from on `topic`.
    pub fn committed(&self, group_id: &str, topic: &str) -> usize {
        self.inner
            .state
            .lock()
            .committed
            .get(&(group_id.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Makes the next `count` publishes fail as if the broker were unreachable.
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.state.lock().failing_publishes = count;
    }
}

#[async_trait]
impl Publisher for MemoryBus {
    async fn publish(&self, record: Record) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                bail!("broker unavailable: cannot publish to {}", record.topic);
            }
            state.logs.entry(record.topic.clone()).or_default().push(record);
        }
        self.inner.appended.notify_waiters();
        Ok(())
    }
}

pub struct MemorySubscription {
    bus: MemoryBus,
    group_id: String,
    topics: Vec<String>,
    cursors: HashMap<String, usize>,
}

impl MemorySubscription {
    fn poll(&mut self) -> Option<Delivery> {
        let state = self.bus.inner.state.lock();
        for topic in &self.topics {
            let cursor = self.cursors.get(topic).copied().unwrap_or(0);
            let Some(record) = state.logs.get(topic).and_then(|log| log.get(cursor)) else {
                continue;
            };
            self.cursors.insert(topic.clone(), cursor + 1);
            return Some(Delivery {
                record: record.clone(),
                partition: 0,
                offset: cursor as i64,
            });
        }
        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        let inner = Arc::clone(&self.bus.inner);
        loop {
            let appended = inner.appended.notified();
            if let Some(delivery) = self.poll() {
                return Some(Ok(delivery));
            }
            appended.await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let next = delivery.offset as usize + 1;
        let mut state = self.bus.inner.state.lock();
        let committed = state
            .committed
            .entry((self.group_id.clone(), delivery.record.topic.clone()))
            .or_insert(0);
        *committed = (*committed).max(next);
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<()> {
        self.cursors
            .insert(delivery.record.topic.clone(), delivery.offset as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_groups_have_independent_offsets() {
        let bus = MemoryBus::new();
        bus.publish(Record::new("orders", "a")).await.unwrap();
        bus.publish(Record::new("orders", "b")).await.unwrap();

        let mut first = bus.subscribe("g1", &["orders"]);
        let mut second = bus.subscribe("g2", &["orders"]);

        let d1 = first.next().await.unwrap().unwrap();
        let d2 = second.next().await.unwrap().unwrap();
        assert_eq!(d1.record.payload, "a");
        assert_eq!(d2.record.payload, "a");

        first.ack(&d1).await.unwrap();
        assert_eq!(bus.committed("g1", "orders"), 1);
        assert_eq!(bus.committed("g2", "orders"), 0);
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered_to_new_member() {
        let bus = MemoryBus::new();
        bus.publish(Record::new("orders", "a")).await.unwrap();

        let mut sub = bus.subscribe("g", &["orders"]);
        let delivery = sub.next().await.unwrap().unwrap();
        assert_eq!(delivery.offset, 0);
        drop(sub);

        let mut again = bus.subscribe("g", &["orders"]);
        let redelivered = again.next().await.unwrap().unwrap();
        assert_eq!(redelivered, delivery);
    }

    #[tokio::test]
    async fn test_nack_rewinds_to_delivery() {
        let bus = MemoryBus::new();
        bus.publish(Record::new("orders", "a")).await.unwrap();
        bus.publish(Record::new("orders", "b")).await.unwrap();

        let mut sub = bus.subscribe("g", &["orders"]);
        let a = sub.next().await.unwrap().unwrap();
        sub.nack(&a).await.unwrap();

        let again = sub.next().await.unwrap().unwrap();
        assert_eq!(again.record.payload, "a");
        sub.ack(&again).await.unwrap();

        let b = sub.next().await.unwrap().unwrap();
        assert_eq!(b.record.payload, "b");
    }

    #[tokio::test]
    async fn test_next_waits_for_publish() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("g", &["orders"]);

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish(Record::new("orders", "late"))
                .await
                .unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.record.payload, "late");
    }

    #[tokio::test]
    async fn test_failing_publishes_are_not_recorded() {
        let bus = MemoryBus::new();
        bus.fail_next_publishes(1);

        assert!(bus.publish(Record::new("orders", "lost")).await.is_err());
        bus.publish(Record::new("orders", "kept")).await.unwrap();

        let records = bus.records("orders");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, "kept");
    }
}
