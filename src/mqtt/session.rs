//! Broker session with statum typestates
//!
//! ```text
//! connect() ──► Session<Connecting> ──established()──► Session<Connected>
//!                      │
//!                      └──────────────────────────────► Session<Failed>
//! ```
//!
//! The typestate covers what the caller may do (only a connected session can publish). The
//! live connection state, which can still drop after the handshake, is observed through a
//! watch channel fed by the network loop.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, MqttOptions, TlsConfiguration, Transport};
use statum::{machine, state};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::config::{BrokerEndpoint, Credentials, SessionOptions};
use super::message::Message;
use super::network_loop::{DeliveryTracker, NetworkLoop};
use crate::error::BridgeError;
use crate::publisher::Transport as PublishTransport;
use crate::shutdown::Teardown;

/// Connection state as seen on the wire
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Connecting, // handshake initiated, waiting for CONNACK
    Connected,  // CONNACK accepted, publishing allowed
    Failed,     // handshake refused or transport error, terminal
}

#[machine]
pub struct Session<S: SessionState> {
    endpoint: BrokerEndpoint,
    client: AsyncClient,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    deliveries: Mutex<DeliveryTracker>,
    network: NetworkLoop,
    ack_timeout: Duration,
    failure: Option<String>,
}

/// Result of waiting for the handshake
pub enum Handshake {
    Established(Session<Connected>),
    Failed(Session<Failed>, BridgeError),
    Interrupted(Session<Connecting>),
}

impl<S: SessionState> Session<S> {
    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stops the network loop and marks the session closed
    ///
    /// Idempotent, and safe on a session that never connected.
    pub async fn disconnect(&mut self) {
        self.stop_network_loop().await;
        self.close();
    }
}

impl Session<Connecting> {
    /// Starts the handshake and returns immediately
    ///
    /// Must be called inside a tokio runtime; the network loop is spawned right away.
    pub fn connect(
        endpoint: BrokerEndpoint,
        credentials: &Credentials,
        options: &SessionOptions,
    ) -> Result<Self, BridgeError> {
        let secret = credentials.secret.as_ref().ok_or_else(|| {
            BridgeError::ConnectionFailed(format!("no secret configured for {}", credentials))
        })?;

        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), endpoint.host.clone(), endpoint.port);
        mqtt_options
            .set_credentials(credentials.username.clone(), secret.expose())
            .set_keep_alive(options.keep_alive)
            .set_clean_session(options.clean_session);

        if endpoint.tls {
            let tls = match &options.ca_file {
                Some(path) => {
                    let ca = std::fs::read(path).map_err(|e| {
                        BridgeError::ConnectionFailed(format!(
                            "failed to read CA bundle {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                    TlsConfiguration::Simple {
                        ca,
                        alpn: None,
                        client_auth: None,
                    }
                }
                None => TlsConfiguration::default(),
            };
            mqtt_options.set_transport(Transport::tls_with_config(tls));
        }

        info!("Connecting to {} as {}", endpoint, credentials);
        let (client, eventloop) = AsyncClient::new(mqtt_options, options.request_capacity);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let state_tx = Arc::new(state_tx);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let network = NetworkLoop::spawn(eventloop, client.clone(), state_tx.clone(), delivery_tx);

        Ok(Self::new(
            endpoint,
            client,
            state_tx,
            state_rx,
            Mutex::new(DeliveryTracker::new(delivery_rx)),
            network,
            options.ack_timeout,
            None, // failure
        ))
    }

    /// Waits until the broker accepts or refuses the session
    ///
    /// Gives up after `timeout`, or early when `cancel` fires.
    pub async fn established(mut self, timeout: Duration, cancel: &CancellationToken) -> Handshake {
        let mut state_rx = self.state_rx.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            waited = tokio::time::timeout(
                timeout,
                state_rx.wait_for(|s| *s != ConnectionState::Connecting),
            ) => Some(waited.map(|r| r.map(|s| *s))),
        };

        let failure = match outcome {
            None => {
                info!("Interrupted while waiting for {}", self.endpoint);
                return Handshake::Interrupted(self);
            }
            Some(Ok(Ok(ConnectionState::Connected))) => {
                info!("Connected to {}", self.endpoint);
                return Handshake::Established(self.transition());
            }
            Some(Ok(Ok(state))) => format!("session ended in state {:?}", state),
            Some(Ok(Err(_))) => "network loop dropped its state channel".to_string(),
            Some(Err(_)) => format!("no CONNACK within {:?}", timeout),
        };

        error!("Could not connect to {}: {}", self.endpoint, failure);
        self.state_tx.send_replace(ConnectionState::Failed);
        self.failure = Some(failure.clone());
        Handshake::Failed(self.transition(), BridgeError::ConnectionFailed(failure))
    }
}

impl Session<Connected> {
    /// Publishes one message and waits for the broker to take responsibility for it
    async fn publish_acknowledged(&self, message: Message) -> Result<(), BridgeError> {
        let topic = message.topic.clone();
        let qos = message.qos;
        let mut deliveries = self.deliveries.lock().await;
        deliveries.begin();

        self.client
            .publish(message.topic, qos.into(), false, message.payload)
            .await
            .map_err(|e| BridgeError::rejected(&topic, e.to_string()))?;

        let waited = tokio::time::timeout(self.ack_timeout, deliveries.acknowledged(qos)).await;
        match waited {
            Ok(true) => Ok(()),
            Ok(false) => Err(BridgeError::rejected(
                &topic,
                "network loop stopped before acknowledgement",
            )),
            Err(_) => {
                deliveries.give_up();
                Err(BridgeError::rejected(
                    &topic,
                    format!("no acknowledgement within {:?}", self.ack_timeout),
                ))
            }
        }
    }
}

impl Session<Failed> {
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

impl PublishTransport for Session<Connected> {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn publish(&self, message: Message) -> Result<(), BridgeError> {
        self.publish_acknowledged(message).await
    }
}

impl<S: SessionState> Teardown for Session<S> {
    async fn stop_network_loop(&mut self) {
        if self.network.is_running() {
            debug!("Stopping network loop for {}", self.endpoint);
        }
        self.network.stop().await;
    }

    fn close(&mut self) {
        let changed = self.state_tx.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                *state = ConnectionState::Disconnected;
                true
            }
            ConnectionState::Disconnected | ConnectionState::Failed => false,
        });
        if changed {
            info!("Session with {} closed", self.endpoint);
        } else {
            debug!("Session with {} already closed", self.endpoint);
        }
    }
}
