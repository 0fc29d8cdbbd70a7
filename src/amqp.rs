use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::info;

use crate::config::AmqpSettings;
use crate::consumer::InboundMessage;
use crate::error::KiraError;

fn broker_error(err: lapin::Error) -> KiraError {
    KiraError::Broker(err.to_string())
}

pub fn exchange_kind(exchange_type: &str) -> ExchangeKind {
    match exchange_type {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    settings: AmqpSettings,
}

impl AmqpSession {
    pub async fn connect(settings: &AmqpSettings) -> Result<Self, KiraError> {
        let uri = settings.uri();
        info!(uri, "connecting to broker");
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(broker_error)?;
        let channel = connection.create_channel().await.map_err(broker_error)?;

        channel
            .exchange_declare(
                &settings.exchange,
                exchange_kind(&settings.exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        channel
            .queue_declare(
                &settings.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        channel
            .queue_bind(
                &settings.queue,
                &settings.exchange,
                &settings.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        channel
            .basic_qos(settings.prefetch, BasicQosOptions::default())
            .await
            .map_err(broker_error)?;

        info!(
            exchange = %settings.exchange,
            queue = %settings.queue,
            routing_key = %settings.routing_key,
            prefetch = settings.prefetch,
            "broker topology declared"
        );
        Ok(Self {
            connection,
            channel,
            settings: settings.clone(),
        })
    }

    pub async fn deliveries(
        &self,
        consumer_tag: &str,
    ) -> Result<impl Stream<Item = Result<AmqpDelivery, KiraError>> + use<>, KiraError> {
        let consumer = self
            .channel
            .basic_consume(
                &self.settings.queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        Ok(consumer.map(|delivery| delivery.map(AmqpDelivery).map_err(broker_error)))
    }

    pub async fn close(self) -> Result<(), KiraError> {
        self.channel
            .close(200, "shutting down")
            .await
            .map_err(broker_error)?;
        self.connection
            .close(200, "shutting down")
            .await
            .map_err(broker_error)
    }
}

pub struct AmqpDelivery(Delivery);

#[async_trait]
impl InboundMessage for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.0.data
    }

    async fn ack(&self) -> Result<(), KiraError> {
        self.0
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(broker_error)
    }

    async fn reject(&self, requeue: bool) -> Result<(), KiraError> {
        self.0
            .acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(broker_error)
    }
}
