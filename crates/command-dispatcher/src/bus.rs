//! MQTT Command Bus

use crate::command::parse_request;
use crate::dispatcher::Dispatcher;
use crate::status::{CommandError, StatusEvent};
use crate::BusError;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use storage::TelemetryStore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Broker connection and topic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// A random suffix is appended per connection
    pub client_id_prefix: String,
    pub command_topic: String,
    pub status_topic: String,
    pub keep_alive_secs: u64,
    /// Outgoing request queue depth
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id_prefix: "telemetry-server".to_string(),
            command_topic: "obd/command".to_string(),
            status_topic: "obd/status".to_string(),
            keep_alive_secs: 30,
            capacity: 64,
        }
    }
}

impl BusConfig {
    pub fn mqtt_options(&self) -> MqttOptions {
        let client_id = format!("{}-{}", self.client_id_prefix, Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)));
        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        options
    }
}

/// Receives commands from the broker and publishes one status event per command
pub struct CommandBus<S> {
    config: BusConfig,
    client: AsyncClient,
    eventloop: EventLoop,
    dispatcher: Arc<Dispatcher<S>>,
}

impl<S: TelemetryStore> CommandBus<S> {
    pub fn new(config: BusConfig, dispatcher: Arc<Dispatcher<S>>) -> Self {
        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), config.capacity.max(1));
        Self {
            config,
            client,
            eventloop,
            dispatcher,
        }
    }

    /// Client handle for publishing outside the command loop
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Poll the broker until `shutdown` resolves.
    ///
    /// The receive loop never runs a handler itself; every command gets its
    /// own task so a long training run does not block the next message.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        info!(
            "Command bus connecting to {}:{} (commands on {}, status on {})",
            self.config.host, self.config.port, self.config.command_topic, self.config.status_topic
        );
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Command bus shutting down");
                    break;
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Err(e) = self.subscribe() {
                            error!("{}", e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => self.on_publish(publish),
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        debug!("Subscription acknowledged: {:?}", ack.return_codes);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request failed: {}", e);
        }
    }

    // Re-subscribe on every ConnAck; clean sessions drop subscriptions.
    fn subscribe(&self) -> Result<(), BusError> {
        info!("Connected to MQTT broker, subscribing to {}", self.config.command_topic);
        self.client
            .try_subscribe(self.config.command_topic.as_str(), QoS::AtLeastOnce)
            .map_err(|e| BusError::Subscribe(e.to_string()))
    }

    fn on_publish(&self, publish: Publish) {
        if publish.topic != self.config.command_topic {
            debug!("Ignoring message on {}", publish.topic);
            return;
        }
        debug!("Command received ({} bytes)", publish.payload.len());

        let dispatcher = Arc::clone(&self.dispatcher);
        let client = self.client.clone();
        let status_topic = self.config.status_topic.clone();

        tokio::spawn(async move {
            let payload = publish.payload;
            let handler_payload = payload.clone();
            let handler = tokio::spawn(async move { dispatcher.handle(&handler_payload).await });
            let event = match handler.await {
                Ok(event) => event,
                Err(e) => {
                    error!("Command handler aborted: {}", e);
                    aborted_event(&payload, &CommandError::internal(format!("handler failed: {}", e)))
                }
            };
            if let Err(e) = publish_status(&client, &status_topic, &event).await {
                warn!("{}", e);
            }
        });
    }
}

/// Error event for a command whose handler never returned, still tagged with
/// the command's kind, request id and vehicle
fn aborted_event(payload: &[u8], error: &CommandError) -> StatusEvent {
    match parse_request(payload) {
        Ok(request) => {
            let vehicle_id = request.command.vehicle_id().map(str::to_string);
            StatusEvent::failed(Some(request.command.kind().as_str()), error)
                .with_request_id(request.request_id)
                .with_vehicle_id(vehicle_id)
        }
        Err(rejected) => StatusEvent::failed(rejected.kind.as_deref(), error)
            .with_request_id(rejected.request_id)
            .with_vehicle_id(rejected.vehicle_id),
    }
}

async fn publish_status(client: &AsyncClient, topic: &str, event: &StatusEvent) -> Result<(), BusError> {
    client
        .publish(topic, QoS::AtLeastOnce, false, event.to_json())
        .await
        .map_err(|e| BusError::Publish(e.to_string()))
}
