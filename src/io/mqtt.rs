//! MQTT client connection task
//!
//! One task per merged client. Subscriptions are (re)issued after every
//! CONNACK, published payloads are routed to the subscription's databases
//! and lost connections are retried with exponential backoff until the
//! generation is cancelled.

use crate::domain::types::{ClientConfiguration, DatabaseConfiguration, DatabaseMessage, MqttQos};
use crate::infra::backoff::ExponentialBackoff;
use crate::io::tls::{self, TlsError};
use chrono::Local;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck, SubscribeFilter, SubscribeReasonCode};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 100;
const MAX_PACKET_SIZE: usize = 1024 * 1024;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Receiver of routed messages; must never block
pub trait MessageSink: Send + Sync {
    fn write_message(&self, message: DatabaseMessage);
}

pub fn to_qos(qos: MqttQos) -> QoS {
    match qos {
        MqttQos::AtMostOnce => QoS::AtMostOnce,
        MqttQos::AtLeastOnce => QoS::AtLeastOnce,
        MqttQos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// MQTT topic filter match with `+` and `#` wildcards.
///
/// Wildcards in the first level never match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();
    for (i, level) in filter_levels.iter().enumerate() {
        match *level {
            "#" => return true,
            "+" => {
                if i >= topic_levels.len() {
                    return false;
                }
            }
            _ => {
                if i >= topic_levels.len() || *level != topic_levels[i] {
                    return false;
                }
            }
        }
    }
    filter_levels.len() == topic_levels.len()
}

/// Topic to destination databases for one client
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRouter {
    routes: Vec<(String, Vec<Arc<DatabaseConfiguration>>)>,
}

impl SubscriptionRouter {
    pub fn new(client: &ClientConfiguration) -> Self {
        let routes = client.subscriptions.iter().map(|s| (s.topic.clone(), s.databases.clone())).collect();
        Self { routes }
    }

    /// Exact topic match first, then the first matching filter in order
    pub fn resolve(&self, topic: &str) -> Option<&[Arc<DatabaseConfiguration>]> {
        self.routes
            .iter()
            .find(|(filter, _)| filter == topic)
            .or_else(|| self.routes.iter().find(|(filter, _)| topic_matches(filter, topic)))
            .map(|(_, databases)| databases.as_slice())
    }
}

/// Connection parameters of one merged client
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub client: ClientConfiguration,
}

impl ClientConnection {
    pub fn options(&self) -> Result<MqttOptions, TlsError> {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if !self.client.user.is_empty() {
            options.set_credentials(self.client.user.clone(), self.client.password.clone());
        }
        if let Some(transport) = tls::transport(&self.client.tls, &self.client_id)? {
            options.set_transport(transport);
        }
        Ok(options)
    }

    fn filters(&self) -> Vec<SubscribeFilter> {
        self.client
            .subscriptions
            .iter()
            .map(|s| SubscribeFilter::new(s.topic.clone(), to_qos(s.qos)))
            .collect()
    }

    /// Run until `cancel` fires, then disconnect gracefully
    pub async fn run(self, sink: Arc<dyn MessageSink>, cancel: CancellationToken) {
        let options = match self.options() {
            Ok(options) => options,
            Err(e) => {
                error!(client_id = %self.client_id, host = %self.host, port = self.port, error = %e, "mqtt_tls_setup_failed");
                return;
            }
        };

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let router = SubscriptionRouter::new(&self.client);
        let filters = self.filters();
        let mut backoff = ExponentialBackoff::reconnect();
        let mut connected = false;

        info!(client_id = %self.client_id, host = %self.host, port = self.port, "mqtt_connecting");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected = true;
                    backoff.reset();
                    info!(client_id = %self.client_id, host = %self.host, port = self.port, "mqtt_connected");
                    for filter in &filters {
                        info!(client_id = %self.client_id, topic = %filter.path, qos = ?filter.qos, "mqtt_subscribing");
                    }
                    if let Err(e) = client.try_subscribe_many(filters.clone()) {
                        error!(client_id = %self.client_id, error = %e, "mqtt_subscribe_failed");
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => self.check_granted(&filters, &ack),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let timestamp = Local::now();
                    let Some(databases) = router.resolve(&publish.topic) else {
                        warn!(client_id = %self.client_id, topic = %publish.topic, "mqtt_message_without_subscription");
                        continue;
                    };
                    let message: Arc<str> = Arc::from(String::from_utf8_lossy(&publish.payload).as_ref());
                    trace!(client_id = %self.client_id, topic = %publish.topic, bytes = publish.payload.len(), "mqtt_message_received");
                    for database in databases {
                        sink.write_message(DatabaseMessage::new(database.clone(), timestamp, message.clone()));
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    connected = false;
                    if backoff.first_time() {
                        error!(client_id = %self.client_id, host = %self.host, port = self.port, error = %e, "mqtt_connection_lost");
                    } else {
                        warn!(client_id = %self.client_id, host = %self.host, port = self.port, error = %e, "mqtt_reconnect_failed");
                    }
                    debug!(client_id = %self.client_id, delay_ms = backoff.current_delay().as_millis() as u64, "mqtt_reconnect_scheduled");
                    match backoff.wait(&cancel).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            error!(client_id = %self.client_id, error = %e, "mqtt_reconnect_abandoned");
                            break;
                        }
                    }
                }
            }
        }

        if connected {
            disconnect(&self.client_id, &client, &mut eventloop).await;
        }
        info!(client_id = %self.client_id, host = %self.host, port = self.port, "mqtt_client_stopped");
    }

    fn check_granted(&self, requested: &[SubscribeFilter], ack: &SubAck) {
        for (filter, code) in requested.iter().zip(&ack.return_codes) {
            match code {
                SubscribeReasonCode::Success(granted) if *granted == filter.qos => {
                    debug!(client_id = %self.client_id, topic = %filter.path, qos = ?granted, "mqtt_subscribed");
                }
                SubscribeReasonCode::Success(granted) => {
                    error!(
                        client_id = %self.client_id,
                        topic = %filter.path,
                        requested = ?filter.qos,
                        granted = ?granted,
                        "mqtt_subscription_qos_mismatch"
                    );
                }
                SubscribeReasonCode::Failure => {
                    error!(client_id = %self.client_id, topic = %filter.path, requested = ?filter.qos, "mqtt_subscription_rejected");
                }
            }
        }
    }
}

/// Send DISCONNECT and poll until it is written; false if it did not complete
async fn disconnect(client_id: &str, client: &AsyncClient, eventloop: &mut EventLoop) -> bool {
    if let Err(e) = client.try_disconnect() {
        warn!(client_id = %client_id, error = %e, "mqtt_disconnect_request_failed");
        return false;
    }
    let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        warn!(client_id = %client_id, timeout_ms = DISCONNECT_TIMEOUT.as_millis() as u64, "mqtt_disconnect_timed_out");
        return false;
    }
    true
}
