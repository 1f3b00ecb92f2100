//! The message bus side: publish/subscribe access to an MQTT broker.
//!
//! The broker connection is driven by a background task. Every completed (re)connection starts a
//! new session, identified by a counter, so that the users of the bus can tell when they need to
//! re-establish their subscriptions and retained state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("MQTT server URL {1:?} is not usable")]
    ParseUrl(#[source] rumqttc::v5::OptionError, String),
    #[error("could not publish to {1}")]
    Publish(#[source] rumqttc::v5::ClientError, String),
    #[error("could not subscribe to {1}")]
    Subscribe(#[source] rumqttc::v5::ClientError, String),
    #[error("not connected to the MQTT server")]
    NotConnected,
}

/// Handles the payload of a message delivered to a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

pub trait MessageBus: Send + Sync {
    /// Publish with QoS 0. Does not wait for the message to be sent out.
    fn publish(&self, topic: &str, retained: bool, payload: String) -> Result<(), Error>;
    /// Subscribe to an exact topic, replacing the handler of an earlier subscription to it.
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), Error>;
    /// Identifier of the current broker session, `None` while disconnected.
    ///
    /// Increases every time a connection to the broker is (re-)established.
    fn session_id(&self) -> Option<u64>;
    fn close(&self);
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "mqtt::Args")]
pub struct Args {
    /// The full URL of the MQTT server, e.g. mqtt://127.0.0.1:1883 or mqtts://broker:8883.
    #[arg(long, default_value = "mqtt://127.0.0.1:1883")]
    pub server: String,

    /// Client id for the connection. Defaults to the hostname followed by the current second.
    #[arg(long)]
    pub client_id: Option<String>,

    #[arg(long)]
    pub username: Option<String>,

    /// Password to match the username.
    #[arg(long, requires = "username")]
    pub password: Option<String>,

    /// Topic root under which the state is published and commands are received.
    #[arg(long, default_value = "koolnova2mqtt")]
    pub prefix: String,

    /// Home Assistant discovery prefix.
    #[arg(long, default_value = "homeassistant")]
    pub hass_prefix: String,

    #[arg(long, default_value = "30s")]
    pub keep_alive: humantime::Duration,

    /// How long to wait before reconnecting after the connection to the server is lost.
    #[arg(long, default_value = "5s")]
    pub reconnect_delay: humantime::Duration,
}

impl Args {
    fn client_id(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| {
            let hostname = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "bridge".to_string());
            let second = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() % 60)
                .unwrap_or_default();
            format!("{hostname}{second}")
        })
    }

    fn options(&self) -> Result<MqttOptions, Error> {
        let separator = if self.server.contains('?') { '&' } else { '?' };
        let url = format!("{}{separator}client_id={}", self.server, self.client_id());
        let mut options =
            MqttOptions::parse_url(url).map_err(|e| Error::ParseUrl(e, self.server.clone()))?;
        options.set_keep_alive(*self.keep_alive);
        options.set_clean_start(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        Ok(options)
    }
}

#[derive(Default)]
struct SessionState {
    connected: AtomicBool,
    id: AtomicU64,
}

impl SessionState {
    /// Start a new session, returning its id.
    fn connected(&self) -> u64 {
        let id = self.id.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(true, Ordering::SeqCst);
        id
    }

    /// End the current session. Returns whether there was one.
    fn lost(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn current(&self) -> Option<u64> {
        self.is_connected().then(|| self.id.load(Ordering::SeqCst))
    }
}

type Handlers = Arc<RwLock<HashMap<String, MessageHandler>>>;

pub struct MqttBus {
    client: AsyncClient,
    handlers: Handlers,
    session: Arc<SessionState>,
    #[allow(unused)] // exists for its drop handler
    event_task: AbortOnDropHandle<()>,
    #[allow(unused)] // exists for its drop handler
    dispatch_task: AbortOnDropHandle<()>,
}

impl MqttBus {
    /// Start connecting to the server. The connection is established in the background; watch
    /// [`MessageBus::session_id`] to find out when it is up.
    pub fn connect(args: &Args) -> Result<Self, Error> {
        let options = args.options()?;
        info!(server = args.server, "connecting to MQTT server");
        let (client, event_loop) = AsyncClient::new(options, 1024);
        let handlers = Handlers::default();
        let session = Arc::new(SessionState::default());
        let (dispatch, deliveries) = mpsc::unbounded_channel();
        let event_task = AbortOnDropHandle::new(tokio::spawn(drive_event_loop(
            event_loop,
            Arc::clone(&handlers),
            Arc::clone(&session),
            dispatch,
            *args.reconnect_delay,
        )));
        let dispatch_task = AbortOnDropHandle::new(tokio::spawn(dispatch_messages(deliveries)));
        Ok(Self { client, handlers, session, event_task, dispatch_task })
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    handlers: Handlers,
    session: Arc<SessionState>,
    dispatch: mpsc::UnboundedSender<(MessageHandler, String)>,
    reconnect_delay: Duration,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let id = session.connected();
                info!(session = id, "connected to MQTT server");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Ok(topic) = std::str::from_utf8(&publish.topic) else {
                    debug!(topic = ?publish.topic, "message on a non-UTF-8 topic");
                    continue;
                };
                let handler = {
                    let handlers = handlers.read().unwrap_or_else(PoisonError::into_inner);
                    handlers.get(topic).cloned()
                };
                let Some(handler) = handler else {
                    debug!(topic, "message on a topic without a handler");
                    continue;
                };
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                trace!(topic, payload, "received message");
                if dispatch.send((handler, payload)).is_err() {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect(_))) => {
                session.lost();
                warn!("MQTT server closed the session");
            }
            Ok(_) => {}
            Err(e) => {
                if session.lost() {
                    warn!(
                        message = "MQTT connection lost",
                        error = (&e as &dyn std::error::Error)
                    );
                } else {
                    debug!(
                        message = "could not connect to MQTT server",
                        error = (&e as &dyn std::error::Error)
                    );
                }
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

/// Runs the subscription handlers one at a time, in the order the messages arrived, away from
/// the event loop so that slow handlers do not stall the connection.
async fn dispatch_messages(mut deliveries: mpsc::UnboundedReceiver<(MessageHandler, String)>) {
    while let Some((handler, payload)) = deliveries.recv().await {
        handler(payload).await;
    }
}

impl MessageBus for MqttBus {
    fn publish(&self, topic: &str, retained: bool, payload: String) -> Result<(), Error> {
        if !self.session.is_connected() {
            return Err(Error::NotConnected);
        }
        trace!(topic, retained, payload, "publishing");
        self.client
            .try_publish(topic.to_string(), QoS::AtMostOnce, retained, payload)
            .map_err(|e| Error::Publish(e, topic.to_string()))
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), Error> {
        if !self.session.is_connected() {
            return Err(Error::NotConnected);
        }
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string(), handler);
        self.client
            .try_subscribe(topic.to_string(), QoS::AtMostOnce)
            .map_err(|e| Error::Subscribe(e, topic.to_string()))
    }

    fn session_id(&self) -> Option<u64> {
        self.session.current()
    }

    fn close(&self) {
        self.session.lost();
        if let Err(e) = self.client.try_disconnect() {
            debug!(message = "could not disconnect cleanly", error = (&e as &dyn std::error::Error));
        }
        info!("MQTT connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;

    #[derive(clap::Parser)]
    struct Cli {
        #[clap(flatten)]
        mqtt: Args,
    }

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["test"]);
        assert_eq!(cli.mqtt.server, "mqtt://127.0.0.1:1883");
        assert_eq!(cli.mqtt.prefix, "koolnova2mqtt");
        assert_eq!(cli.mqtt.hass_prefix, "homeassistant");
        assert!(!cli.mqtt.client_id().is_empty());
    }

    #[test]
    fn password_requires_username() {
        assert!(Cli::try_parse_from(["test", "--password", "x"]).is_err());
        let cli = Cli::parse_from(["test", "--username", "u", "--password", "p", "--client-id", "c"]);
        assert_eq!(cli.mqtt.client_id(), "c");
        assert!(cli.mqtt.options().is_ok());
    }

    #[test]
    fn unusable_server_url() {
        let cli = Cli::parse_from(["test", "--server", "not a url"]);
        assert!(matches!(cli.mqtt.options(), Err(Error::ParseUrl(_, server)) if server == "not a url"));
    }

    #[test]
    fn every_connection_is_a_new_session() {
        let session = SessionState::default();
        assert_eq!(session.current(), None);
        assert!(!session.lost());

        assert_eq!(session.connected(), 1);
        assert_eq!(session.current(), Some(1));
        assert!(session.lost());
        assert_eq!(session.current(), None);
        assert!(!session.lost());

        assert_eq!(session.connected(), 2);
        assert_eq!(session.current(), Some(2));
        assert!(session.is_connected());
    }
}
