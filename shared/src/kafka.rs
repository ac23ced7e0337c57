use anyhow::Result;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{info, warn};

use crate::bus::{Delivery, Headers, Publisher, Record, Subscription};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// An explicitly constructed Kafka client. One producer is shared by every
/// component of a service; each consumer loop gets its own subscription.
#[derive(Clone)]
pub struct KafkaBus {
    brokers: String,
    client_id: String,
    producer: FutureProducer,
}

impl KafkaBus {
    pub fn connect(brokers: &str, client_id: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", client_id)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()?;

        info!(brokers, client_id, "Kafka producer connected");

        Ok(Self {
            brokers: brokers.to_string(),
            client_id: client_id.to_string(),
            producer,
        })
    }

    /// Joins `group_id` on `topics`. Offsets are committed only through
    /// [`Subscription::ack`], never automatically.
    pub fn subscribe(&self, group_id: &str, topics: &[&str]) -> Result<KafkaSubscription> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", group_id)
            .set("client.id", &self.client_id)
            .set("bootstrap.servers", &self.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        consumer.subscribe(topics)?;
        info!(group_id, ?topics, "Kafka consumer subscribed");

        Ok(KafkaSubscription {
            consumer,
            group_id: group_id.to_string(),
        })
    }

    /// Flushes outstanding produce requests. Call on every shutdown path.
    pub fn close(&self) {
        if let Err(e) = self.producer.flush(FLUSH_TIMEOUT) {
            warn!("Error flushing Kafka producer: {}", e);
        }
        info!("Kafka producer closed");
    }
}

#[async_trait]
impl Publisher for KafkaBus {
    async fn publish(&self, record: Record) -> Result<()> {
        let mut headers = OwnedHeaders::new();
        for (name, value) in &record.headers {
            headers = headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut future_record: FutureRecord<'_, str, str> = FutureRecord::to(&record.topic)
            .payload(record.payload.as_str())
            .headers(headers);
        if let Some(key) = &record.key {
            future_record = future_record.key(key.as_str());
        }

        self.producer
            .send(future_record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish to {}: {}", record.topic, e))?;

        Ok(())
    }
}

pub struct KafkaSubscription {
    consumer: StreamConsumer,
    group_id: String,
}

fn to_delivery(message: &BorrowedMessage<'_>) -> Delivery {
    let headers: Headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|header| {
                    let value = header.value?;
                    Some((
                        header.key.to_string(),
                        String::from_utf8_lossy(value).into_owned(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    Delivery {
        record: Record {
            topic: message.topic().to_string(),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            payload: message
                .payload()
                .map(|payload| String::from_utf8_lossy(payload).into_owned())
                .unwrap_or_default(),
            headers,
        },
        partition: message.partition(),
        offset: message.offset(),
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        match self.consumer.recv().await {
            Ok(message) => Some(Ok(to_delivery(&message))),
            Err(e) => Some(Err(e.into())),
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &delivery.record.topic,
            delivery.partition,
            Offset::Offset(delivery.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<()> {
        self.consumer.seek(
            &delivery.record.topic,
            delivery.partition,
            Offset::Offset(delivery.offset),
            SEEK_TIMEOUT,
        )?;
        Ok(())
    }
}

impl Drop for KafkaSubscription {
    fn drop(&mut self) {
        self.consumer.unsubscribe();
        info!(group_id = %self.group_id, "Kafka consumer unsubscribed");
    }
}
