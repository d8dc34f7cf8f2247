//! Messaging helpers shared across services: topic administration,
//! producers, manually-committed consumers, tolerant envelope unwrapping,
//! and the delayed-delivery primitive used for archive scheduling.

use std::time::Duration;

use chrono::Utc;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dto::Scheduled;
use crate::error::AppError;

/// Ensure that the given topics exist.
///
/// Attempts to create each topic with a single partition and replication
/// factor 1. If the topic already exists the error is ignored.
pub async fn ensure_topics(broker: &str, topics: &[&str]) -> Result<(), KafkaError> {
    let admin: AdminClient<_> = ClientConfig::new()
        .set("bootstrap.servers", broker)
        .create()?;
    let new_topics: Vec<NewTopic> = topics
        .iter()
        .map(|t| NewTopic::new(t, 1, TopicReplication::Fixed(1)))
        .collect();
    let results = admin
        .create_topics(new_topics.iter(), &AdminOptions::new())
        .await?;
    for result in results {
        if let Err((name, err)) = result {
            if err != RDKafkaErrorCode::TopicAlreadyExists {
                warn!(topic = %name, %err, "failed to create topic");
            } else {
                info!(topic = %name, "topic already exists");
            }
        }
    }
    Ok(())
}

pub fn producer(broker: &str) -> Result<FutureProducer, KafkaError> {
    ClientConfig::new()
        .set("bootstrap.servers", broker)
        .create()
}

/// Consumer with manual offset commits: an offset is only committed after a
/// handler's post-condition is observable in the store, so uncommitted work
/// is redelivered after a restart or rebalance.
///
/// `max.poll.interval.ms` bounds how long a single message may be processed
/// (including the archive hold-back sleep) before the group evicts us.
pub fn consumer(broker: &str, group: &str, topics: &[&str]) -> Result<StreamConsumer, KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", group)
        .set("bootstrap.servers", broker)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "45000")
        .set("max.poll.interval.ms", "1800000")
        .set("heartbeat.interval.ms", "5000")
        .set("socket.keepalive.enable", "true")
        .create()?;
    consumer.subscribe(topics)?;
    Ok(consumer)
}

pub async fn publish<T: Serialize>(
    producer: &FutureProducer,
    topic: &str,
    key: &str,
    message: &T,
) -> Result<(), AppError> {
    let payload = serde_json::to_string(message)
        .map_err(|e| AppError::Schema(format!("encode message for {topic}: {e}")))?;
    producer
        .send(
            FutureRecord::to(topic).payload(&payload).key(key),
            Duration::from_secs(5),
        )
        .await
        .map_err(|(e, _)| AppError::Transport(format!("publish to {topic}: {e}")))?;
    Ok(())
}

/// Scheduled delivery: wrap the payload so consumers hold it back until the
/// delay has elapsed. Per-partition FIFO plus a constant delay keeps the
/// due order intact.
pub async fn publish_after<T: Serialize>(
    producer: &FutureProducer,
    topic: &str,
    key: &str,
    message: &T,
    delay_secs: u64,
) -> Result<(), AppError> {
    let inner = serde_json::to_string(message)
        .map_err(|e| AppError::Schema(format!("encode scheduled message for {topic}: {e}")))?;
    let wrapped = Scheduled {
        deliver_at: Utc::now().timestamp() + delay_secs as i64,
        message: inner,
    };
    publish(producer, topic, key, &wrapped).await
}

/// Unwrap a bus payload into the expected message type.
///
/// Accepts both the topic-notification envelope, whose outer body carries the
/// inner JSON string in `Message`, and the raw inner JSON. Anything else is a
/// poison message.
pub fn unwrap_message<T: DeserializeOwned>(payload: &str) -> Result<T, AppError> {
    #[derive(Deserialize)]
    struct Envelope {
        #[serde(rename = "Message")]
        message: String,
    }

    if let Ok(envelope) = serde_json::from_str::<Envelope>(payload) {
        return serde_json::from_str(&envelope.message)
            .map_err(|e| AppError::Schema(format!("inner payload: {e}")));
    }
    serde_json::from_str(payload).map_err(|e| AppError::Schema(format!("payload: {e}")))
}

/// Redrive a message whose delivery attempts are exhausted: park the raw
/// payload on the dead-letter topic so the work is surfaced to the operator
/// rather than lost. Callers commit the source offset only after this
/// succeeds.
pub async fn dead_letter(
    producer: &FutureProducer,
    topic: &str,
    key: &str,
    payload: &str,
) -> Result<(), AppError> {
    producer
        .send(
            FutureRecord::to(topic).payload(payload).key(key),
            Duration::from_secs(5),
        )
        .await
        .map_err(|(e, _)| AppError::Transport(format!("dead-letter to {topic}: {e}")))?;
    Ok(())
}

/// Complete the HTTP-callback handshake: GET the confirmation URL the bus
/// provided so notifications start flowing.
pub async fn confirm_subscription(url: &str) -> Result<(), AppError> {
    let resp = reqwest::get(url)
        .await
        .map_err(|e| AppError::Transport(format!("confirm subscription: {e}")))?;
    if !resp.status().is_success() {
        return Err(AppError::Transport(format!(
            "confirm subscription: status {}",
            resp.status()
        )));
    }
    Ok(())
}

/// Seconds left before a scheduled message is due; zero when already due.
pub fn secs_until_due(deliver_at: i64) -> u64 {
    (deliver_at - Utc::now().timestamp()).max(0) as u64
}

/// Hold back a scheduled message until it is due.
pub async fn sleep_until_due(deliver_at: i64) {
    let wait = secs_until_due(deliver_at);
    if wait > 0 {
        info!(wait_secs = wait, "holding message until due");
        tokio::time::sleep(Duration::from_secs(wait)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::JobCompleted;

    #[test]
    fn unwraps_raw_payload() {
        let raw = r#"{"job_id":"j1","user_id":"u1","complete_time":1700000000}"#;
        let msg: JobCompleted = unwrap_message(raw).unwrap();
        assert_eq!(msg.job_id, "j1");
    }

    #[test]
    fn unwraps_notification_envelope() {
        let inner = r#"{"job_id":"j1","user_id":"u1","complete_time":1700000000}"#;
        let outer = serde_json::json!({
            "Type": "Notification",
            "Message": inner,
        })
        .to_string();
        let msg: JobCompleted = unwrap_message(&outer).unwrap();
        assert_eq!(msg.complete_time, 1_700_000_000);
    }

    #[test]
    fn poison_payload_is_schema_error() {
        let err = unwrap_message::<JobCompleted>("{not json").unwrap_err();
        assert!(matches!(err, AppError::Schema(_)));

        // A valid envelope around a mismatched inner payload is poison too.
        let outer = serde_json::json!({"Message": "{\"nope\": 1}"}).to_string();
        let err = unwrap_message::<JobCompleted>(&outer).unwrap_err();
        assert!(matches!(err, AppError::Schema(_)));
    }

    #[test]
    fn scheduled_envelope_carries_inner_message() {
        use crate::dto::{ArchiveScheduled, Scheduled};

        let inner = ArchiveScheduled {
            bucket: "gas-results".into(),
            key: "gas/u1/j1/sample.annot.vcf".into(),
            user_id: "u1".into(),
            job_id: "j1".into(),
        };
        let wrapped = Scheduled {
            deliver_at: 1_700_000_600,
            message: serde_json::to_string(&inner).unwrap(),
        };
        let payload = serde_json::to_string(&wrapped).unwrap();

        let scheduled: Scheduled = unwrap_message(&payload).unwrap();
        assert_eq!(scheduled.deliver_at, 1_700_000_600);
        let parsed: ArchiveScheduled = unwrap_message(&scheduled.message).unwrap();
        assert_eq!(parsed.key, "gas/u1/j1/sample.annot.vcf");
    }

    #[test]
    fn due_messages_do_not_wait() {
        assert_eq!(secs_until_due(Utc::now().timestamp() - 10), 0);
        assert!(secs_until_due(Utc::now().timestamp() + 120) > 100);
    }
}
