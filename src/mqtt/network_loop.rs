//! Background network processing for one broker session
//!
//! Owns the `rumqttc` event loop and polls it on its own tokio task, so keep-alives and
//! acknowledgements keep flowing while the publisher sleeps between rows. The task reports
//! connection state through a watch channel and forwards publish bookkeeping (packet ids
//! sent, acknowledged, completed) through an unbounded channel.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::QualityOfService;
use super::session::ConnectionState;

/// Upper bound for flushing the DISCONNECT frame on the way out
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Publish bookkeeping seen by the network loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// PUBLISH left the client with this packet id (0 for QoS 0)
    Sent(u16),
    /// PUBACK received
    Acknowledged(u16),
    /// PUBCOMP received
    Completed(u16),
}

/// Matches delivery notices to the publish currently in flight
///
/// A publish that gives up before its `Sent` notice arrives leaves that notice owed. The
/// tracker counts those so a later publish never adopts an older packet id as its own.
#[derive(Debug)]
pub struct DeliveryTracker {
    notices: mpsc::UnboundedReceiver<Delivery>,
    abandoned: usize,
    pending: Option<u16>,
}

impl DeliveryTracker {
    pub fn new(notices: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            notices,
            abandoned: 0,
            pending: None,
        }
    }

    /// Prepares for the next publish, dropping notices that arrived in between
    pub fn begin(&mut self) {
        self.pending = None;
        while let Ok(stale) = self.notices.try_recv() {
            if matches!(stale, Delivery::Sent(_)) {
                self.abandoned = self.abandoned.saturating_sub(1);
            }
            debug!("Discarding stale delivery notice {:?}", stale);
        }
    }

    /// Waits until the broker took responsibility for the current publish
    ///
    /// QoS 0 completes once the frame left the client, QoS 1 on PUBACK, QoS 2 on PUBCOMP.
    /// Returns false if the network loop went away first.
    pub async fn acknowledged(&mut self, qos: QualityOfService) -> bool {
        while let Some(delivery) = self.notices.recv().await {
            match (delivery, self.pending) {
                (Delivery::Sent(id), None) if self.abandoned > 0 => {
                    self.abandoned -= 1;
                    debug!("Skipping packet {} of an abandoned publish", id);
                }
                (Delivery::Sent(_), None) if qos == QualityOfService::AtMostOnce => return true,
                (Delivery::Sent(id), None) => self.pending = Some(id),
                (Delivery::Acknowledged(id), Some(sent))
                    if id == sent && qos == QualityOfService::AtLeastOnce =>
                {
                    return true;
                }
                (Delivery::Completed(id), Some(sent))
                    if id == sent && qos == QualityOfService::ExactlyOnce =>
                {
                    return true;
                }
                (other, _) => debug!("Ignoring delivery notice {:?}", other),
            }
        }
        false
    }

    /// Records that the current publish stopped waiting
    pub fn give_up(&mut self) {
        if self.pending.is_none() {
            self.abandoned += 1;
        }
    }
}

/// Handle to the spawned network task
///
/// Dropping the handle cancels the task, so an unwinding run still stops the loop.
#[derive(Debug)]
pub struct NetworkLoop {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NetworkLoop {
    pub fn spawn(
        eventloop: EventLoop,
        client: AsyncClient,
        state: Arc<watch::Sender<ConnectionState>>,
        deliveries: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(drive(eventloop, client, state, deliveries, cancel.clone()));
        debug!("Network loop task spawned");
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signals the task to stop and waits for it to wind down
    ///
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            match tokio::time::timeout(DISCONNECT_GRACE * 2, task).await {
                Ok(Ok(())) => debug!("Network loop stopped"),
                Ok(Err(e)) if e.is_cancelled() => debug!("Network loop was aborted"),
                Ok(Err(e)) => error!("Network loop task failed: {}", e),
                Err(_) => {
                    warn!("Network loop did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
    }
}

impl Drop for NetworkLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    state: Arc<watch::Sender<ConnectionState>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    cancel: CancellationToken,
) {
    info!("Network loop started");
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if *state.borrow() == ConnectionState::Connected {
                    flush_disconnect(&client, &mut eventloop).await;
                }
                break;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Broker accepted the session");
                    state.send_replace(ConnectionState::Connected);
                } else {
                    error!("Broker refused the session: {:?}", ack.code);
                    state.send_replace(ConnectionState::Failed);
                    break;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = deliveries.send(Delivery::Acknowledged(ack.pkid));
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                let _ = deliveries.send(Delivery::Completed(comp.pkid));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the session");
                state.send_replace(ConnectionState::Disconnected);
                break;
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = deliveries.send(Delivery::Sent(pkid));
            }
            Ok(other) => debug!("Network event: {:?}", other),
            Err(e) => {
                // No reconnect: a failure before CONNACK fails the attempt, a failure
                // afterwards ends the session.
                let next = if *state.borrow() == ConnectionState::Connected {
                    ConnectionState::Disconnected
                } else {
                    ConnectionState::Failed
                };
                error!("Connection error: {} (session now {:?})", e, next);
                state.send_replace(next);
                break;
            }
        }
    }
    info!("Network loop finished");
}

async fn flush_disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        warn!("Could not queue DISCONNECT: {}", e);
        return;
    }

    let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Event loop closed while disconnecting: {}", e);
                    break;
                }
            }
        }
    })
    .await;

    match flushed {
        Ok(()) => info!("DISCONNECT sent to broker"),
        Err(_) => warn!("Timed out sending DISCONNECT"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (mpsc::UnboundedSender<Delivery>, DeliveryTracker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, DeliveryTracker::new(rx))
    }

    async fn settles(tracker: &mut DeliveryTracker, qos: QualityOfService) -> bool {
        tokio::time::timeout(Duration::from_millis(50), tracker.acknowledged(qos))
            .await
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn puback_completes_the_matching_publish() {
        let (tx, mut tracker) = tracker();
        tracker.begin();
        tx.send(Delivery::Sent(7)).unwrap();
        tx.send(Delivery::Acknowledged(6)).unwrap();
        tx.send(Delivery::Acknowledged(7)).unwrap();

        assert!(settles(&mut tracker, QualityOfService::AtLeastOnce).await);
    }

    #[tokio::test]
    async fn abandoned_publish_never_lends_its_puback() {
        let (tx, mut tracker) = tracker();

        // row 0 gives up before its PUBLISH left the client
        tracker.begin();
        assert!(!settles(&mut tracker, QualityOfService::AtLeastOnce).await);
        tracker.give_up();

        // row 1 starts before row 0's notices show up
        tracker.begin();
        tx.send(Delivery::Sent(1)).unwrap();
        tx.send(Delivery::Acknowledged(1)).unwrap();
        tx.send(Delivery::Sent(2)).unwrap();
        assert!(!settles(&mut tracker, QualityOfService::AtLeastOnce).await);

        tx.send(Delivery::Acknowledged(2)).unwrap();
        assert!(settles(&mut tracker, QualityOfService::AtLeastOnce).await);
    }

    #[tokio::test]
    async fn stale_sent_notice_settles_an_abandoned_publish() {
        let (tx, mut tracker) = tracker();
        tracker.begin();
        tracker.give_up();

        // row 0's notices arrive between rows and are drained
        tx.send(Delivery::Sent(1)).unwrap();
        tx.send(Delivery::Acknowledged(1)).unwrap();
        tracker.begin();

        tx.send(Delivery::Sent(2)).unwrap();
        tx.send(Delivery::Acknowledged(2)).unwrap();
        assert!(settles(&mut tracker, QualityOfService::AtLeastOnce).await);
    }

    #[tokio::test]
    async fn qos0_settles_on_sent_and_qos2_waits_for_pubcomp() {
        let (tx, mut tracker) = tracker();
        tracker.begin();
        tx.send(Delivery::Sent(0)).unwrap();
        assert!(settles(&mut tracker, QualityOfService::AtMostOnce).await);

        tracker.begin();
        tx.send(Delivery::Sent(3)).unwrap();
        tx.send(Delivery::Acknowledged(3)).unwrap();
        assert!(!settles(&mut tracker, QualityOfService::ExactlyOnce).await);
        tx.send(Delivery::Completed(3)).unwrap();
        assert!(settles(&mut tracker, QualityOfService::ExactlyOnce).await);
    }

    #[tokio::test]
    async fn closed_loop_is_not_an_acknowledgement() {
        let (tx, mut tracker) = tracker();
        tracker.begin();
        drop(tx);
        assert!(!tracker.acknowledged(QualityOfService::AtLeastOnce).await);
    }
}
