//! RabbitMQ adapter: durable topology, persistent publishes, manual acks.

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::watch;
use tracing::{info, warn};

use super::{
    classify_delivery, CancelJob, DeliveryVerdict, EmitJob, JobPublisher, QueueError,
    CANCEL_ROUTING_KEY, EMIT_ROUTING_KEY,
};
use crate::error::EmissionError;

/// Name of the durable direct exchange.
const EXCHANGE: &str = "nfce";

/// RabbitMQ-backed queue.
pub struct RabbitQueue {
    channel: Channel,
}

impl RabbitQueue {
    /// Connects and declares the durable topology: one direct exchange, two
    /// queues bound by routing key.
    ///
    /// # Errors
    ///
    /// [`QueueError::Unavailable`] on connection or declaration failure.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(broker)?;
        let channel = connection.create_channel().await.map_err(broker)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(broker)?;

        channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker)?;

        for queue in [EMIT_ROUTING_KEY, CANCEL_ROUTING_KEY] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(broker)?;
            channel
                .queue_bind(
                    queue,
                    EXCHANGE,
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(broker)?;
        }

        Ok(Self { channel })
    }

    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), QueueError> {
        let confirm = self
            .channel
            .basic_publish(
                EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                // Delivery mode 2: persisted by the broker.
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(broker)?;
        confirm.await.map_err(broker)?;
        Ok(())
    }

    /// Consumes the emission queue until shutdown, invoking `handler` per
    /// well-formed job.
    ///
    /// Acknowledgement policy: handled jobs are acked (the pipeline has
    /// persisted whatever outcome it reached); infrastructure failures are
    /// nacked with requeue so the broker redelivers; poison messages are
    /// nacked without requeue.
    ///
    /// # Errors
    ///
    /// [`QueueError::Unavailable`] when the consumer cannot be established
    /// or the stream breaks.
    pub async fn run_emit_consumer<F, Fut>(
        &self,
        prefetch: u16,
        mut shutdown: watch::Receiver<bool>,
        handler: F,
    ) -> Result<(), QueueError>
    where
        F: Fn(EmitJob) -> Fut,
        Fut: std::future::Future<Output = Result<(), EmissionError>>,
    {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(broker)?;
        let mut consumer = self
            .channel
            .basic_consume(
                EMIT_ROUTING_KEY,
                "emissor-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker)?;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("emit consumer draining for shutdown");
                        return Ok(());
                    }
                },
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else {
                        return Err(QueueError::Unavailable("consumer stream closed".to_string()));
                    };
                    let delivery = delivery.map_err(broker)?;

                    match classify_delivery(&delivery.data) {
                        DeliveryVerdict::Poison(reason) => {
                            warn!(reason = %reason, "dropping poison message");
                            if let Err(err) = delivery
                                .nack(BasicNackOptions { requeue: false, ..BasicNackOptions::default() })
                                .await
                            {
                                warn!(error = %err, "nack failed");
                            }
                        },
                        DeliveryVerdict::Process(job) => {
                            let outcome = handler(job).await;
                            let ack_result = match outcome {
                                Err(EmissionError::Infra(ref reason)) => {
                                    warn!(reason = %reason, "infrastructure failure, requeueing delivery");
                                    delivery
                                        .nack(BasicNackOptions { requeue: true, ..BasicNackOptions::default() })
                                        .await
                                },
                                _ => delivery.ack(BasicAckOptions::default()).await,
                            };
                            if let Err(err) = ack_result {
                                warn!(error = %err, "acknowledgement failed");
                            }
                        },
                    }
                },
            }
        }
    }
}

fn broker(err: lapin::Error) -> QueueError {
    QueueError::Unavailable(err.to_string())
}

#[async_trait::async_trait]
impl JobPublisher for RabbitQueue {
    async fn publish_emit(&self, job: &EmitJob) -> Result<(), QueueError> {
        let body = serde_json::to_vec(job).map_err(|err| QueueError::Serialize(err.to_string()))?;
        self.publish(EMIT_ROUTING_KEY, body).await
    }

    async fn publish_cancel(&self, job: &CancelJob) -> Result<(), QueueError> {
        let body = serde_json::to_vec(job).map_err(|err| QueueError::Serialize(err.to_string()))?;
        self.publish(CANCEL_ROUTING_KEY, body).await
    }

    async fn healthy(&self) -> bool {
        self.channel.status().connected()
    }
}
