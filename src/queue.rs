/*!
In-process topic queue.

One topic per scraping provider. Producers publish serialized shard
jobs; each dispatcher drains its topic through a single consumer task.
Messages are explicitly acknowledged: a nack schedules a delayed
redelivery until the delivery cap is reached.
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::model::ShardJob;

/// What the handler decided about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done with the message; never redeliver.
    Ack,
    /// Transient failure; redeliver after a delay.
    Nack,
}

/// One delivery of a message. `attempt` starts at 1.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: String,
    pub attempt: u32,
}

impl Delivery {
    pub fn shard_job(&self) -> Result<ShardJob> {
        serde_json::from_str(&self.payload).map_err(Error::from)
    }
}

#[derive(Default)]
struct Topics {
    senders: HashMap<String, mpsc::UnboundedSender<Delivery>>,
}

/// Cloneable handle to the queue. Publishing to a topic with no
/// subscriber fails; fan-out treats that as a lost shard and logs it.
#[derive(Clone)]
pub struct Queue {
    topics: Arc<Mutex<Topics>>,
    redelivery_delay: Duration,
    max_deliveries: u32,
}

pub struct Subscription {
    pub topic: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

impl Queue {
    pub fn new(redelivery_delay: Duration, max_deliveries: u32) -> Self {
        Self {
            topics: Arc::new(Mutex::new(Topics::default())),
            redelivery_delay,
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Register the consumer for `topic`. A repeated subscribe replaces
    /// the previous consumer's channel.
    pub async fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .await
            .senders
            .insert(topic.to_string(), tx);
        Subscription {
            topic: topic.to_string(),
            receiver: rx,
        }
    }

    /// Publish a shard job to a provider topic.
    pub async fn publish(&self, topic: &str, job: &ShardJob) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        self.deliver(topic, Delivery { payload, attempt: 1 }).await
    }

    async fn deliver(&self, topic: &str, delivery: Delivery) -> Result<()> {
        let topics = self.topics.lock().await;
        let sender = topics
            .senders
            .get(topic)
            .ok_or_else(|| Error::Internal(format!("no subscriber for topic {topic}")))?;
        sender
            .send(delivery)
            .map_err(|_| Error::Internal(format!("topic {topic} consumer is gone")))
    }

    /// Schedule a redelivery of a nacked message. Drops the message once
    /// the delivery cap is reached.
    pub fn redeliver(&self, topic: &str, delivery: Delivery) {
        if delivery.attempt >= self.max_deliveries {
            error!(
                topic,
                attempt = delivery.attempt,
                "delivery cap reached, dropping message"
            );
            return;
        }

        let queue = self.clone();
        let topic = topic.to_string();
        let next = Delivery {
            payload: delivery.payload,
            attempt: delivery.attempt + 1,
        };
        let delay = self.redelivery_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.deliver(&topic, next).await {
                error!(topic, error = %e, "redelivery failed");
            }
        });
    }
}

/// Drain `subscription` until cancelled, passing each delivery to
/// `handler` and applying its disposition.
pub async fn run_consumer<F, Fut>(
    queue: Queue,
    mut subscription: Subscription,
    shutdown: CancellationToken,
    mut handler: F,
) where
    F: FnMut(Delivery) -> Fut,
    Fut: std::future::Future<Output = Disposition>,
{
    let topic = subscription.topic.clone();
    info!(topic, "consumer started");

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(topic, "consumer shutting down");
                return;
            }
            delivery = subscription.recv() => match delivery {
                Some(d) => d,
                None => {
                    warn!(topic, "topic channel closed");
                    return;
                }
            },
        };

        let attempt = delivery.attempt;
        let retained = delivery.clone();
        match handler(delivery).await {
            Disposition::Ack => {}
            Disposition::Nack => {
                warn!(topic, attempt, "message nacked, scheduling redelivery");
                queue.redeliver(&topic, retained);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PromptJob, ProviderKind};
    use uuid::Uuid;

    fn job(service: ProviderKind) -> ShardJob {
        ShardJob {
            service,
            nightly: false,
            external_task_id: None,
            user_id: "user-1".to_string(),
            project_id: "project-1".to_string(),
            email: None,
            job_batch_id: Some(Uuid::new_v4()),
            batch_number: 0,
            total_batches: 1,
            openai_key: "sk-test".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            web_search: false,
            geo: None,
            prompts: vec![PromptJob {
                prompt_id: Uuid::new_v4(),
                tracking_id: Some(Uuid::new_v4()),
                text: "what is acme".to_string(),
                brand_mentions: vec![],
                domain_mentions: vec![],
                geo: None,
            }],
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let queue = Queue::new(Duration::from_millis(1), 3);
        let mut sub = queue.subscribe("brightdata").await;

        queue
            .publish("brightdata", &job(ProviderKind::Brightdata))
            .await
            .unwrap();

        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.attempt, 1);
        let decoded = delivery.shard_job().unwrap();
        assert_eq!(decoded.service, ProviderKind::Brightdata);
    }

    #[tokio::test]
    async fn publish_without_subscriber_fails() {
        let queue = Queue::new(Duration::from_millis(1), 3);
        let result = queue
            .publish("dataforseo", &job(ProviderKind::Dataforseo))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn nacked_messages_are_redelivered_with_incremented_attempt() {
        let queue = Queue::new(Duration::from_millis(1), 3);
        let mut sub = queue.subscribe("dataforseo").await;

        queue
            .publish("dataforseo", &job(ProviderKind::Dataforseo))
            .await
            .unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.attempt, 1);
        queue.redeliver("dataforseo", first);

        let second = sub.recv().await.unwrap();
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn redelivery_stops_at_cap() {
        let queue = Queue::new(Duration::from_millis(1), 2);
        let mut sub = queue.subscribe("dataforseo").await;

        queue
            .publish("dataforseo", &job(ProviderKind::Dataforseo))
            .await
            .unwrap();

        let first = sub.recv().await.unwrap();
        queue.redeliver("dataforseo", first);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.attempt, 2);

        // At the cap: no further delivery should arrive.
        queue.redeliver("dataforseo", second);
        let next = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(next.is_err(), "message past the delivery cap must be dropped");
    }

    #[tokio::test]
    async fn consumer_applies_dispositions() {
        let queue = Queue::new(Duration::from_millis(1), 5);
        let sub = queue.subscribe("brightdata").await;
        let shutdown = CancellationToken::new();

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(run_consumer(
            queue.clone(),
            sub,
            shutdown.clone(),
            move |delivery: Delivery| {
                let done_tx = done_tx.clone();
                async move {
                    done_tx.send(delivery.attempt).unwrap();
                    if delivery.attempt < 2 {
                        Disposition::Nack
                    } else {
                        Disposition::Ack
                    }
                }
            },
        ));

        queue
            .publish("brightdata", &job(ProviderKind::Brightdata))
            .await
            .unwrap();

        assert_eq!(done_rx.recv().await, Some(1));
        assert_eq!(done_rx.recv().await, Some(2));

        shutdown.cancel();
        consumer.await.unwrap();
    }
}
