//! Publisher loop
//!
//! Walks the rows in source order: encode, publish, report progress, then pause for the
//! configured interval. The pause and the wait for an acknowledgement both race the
//! cancellation token, so an interrupt is seen between rows and while sleeping.
//!
//! ```text
//! Row ──► codec::encode ──► Message ──► Transport::publish ──► PublishProgress
//!                                                                   │
//!                                   interval (interruptible) ◄──────┘
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::dataset::Row;
use crate::error::BridgeError;
use crate::mqtt::message::{Message, QualityOfService};

/// Characters of payload shown in progress output
pub const PREVIEW_CHARS: usize = 80;

/// Anything the publisher can hand messages to
///
/// Implemented by a connected broker session; tests use an in-memory recorder.
pub trait Transport {
    fn is_connected(&self) -> bool;

    /// Resolves once the message was accepted with the requested guarantee
    fn publish(&self, message: Message) -> impl Future<Output = Result<(), BridgeError>>;
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Interrupted,
    DatasetMissing,
    ConnectionFailed,
}

impl Outcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Outcome::Completed | Outcome::Interrupted => 0,
            Outcome::DatasetMissing => 2,
            Outcome::ConnectionFailed => 3,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            Outcome::Completed => "completed",
            Outcome::Interrupted => "interrupted",
            Outcome::DatasetMissing => "dataset missing",
            Outcome::ConnectionFailed => "connection failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: Outcome,
    pub published: usize,
    pub rejected: usize,
}

impl RunReport {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            published: 0,
            rejected: 0,
        }
    }
}

/// Progress notice emitted after each row
#[derive(Debug, Clone, PartialEq)]
pub struct PublishProgress {
    pub index: usize,
    pub preview: String,
    pub accepted: bool,
    pub timestamp: DateTime<Local>,
}

impl fmt::Display for PublishProgress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let verb = if self.accepted { "Published" } else { "Rejected" };
        write!(
            f,
            "{} - {} row {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            verb,
            self.index,
            self.preview
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishSettings {
    pub topic: String,
    pub interval: Duration,
    pub qos: QualityOfService,
}

pub struct PublisherLoop {
    settings: PublishSettings,
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedSender<PublishProgress>>,
}

impl PublisherLoop {
    pub fn new(settings: PublishSettings, cancel: CancellationToken) -> Self {
        Self {
            settings,
            cancel,
            progress: None,
        }
    }

    /// Also send a [`PublishProgress`] per row to `sender`
    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<PublishProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn settings(&self) -> &PublishSettings {
        &self.settings
    }

    /// Publishes `rows` in order through `transport`
    ///
    /// A rejected row is counted and skipped; losing the connection ends the run.
    pub async fn run<T: Transport>(&self, rows: &[Row], transport: &T) -> RunReport {
        let mut report = RunReport::new(Outcome::Completed);
        info!(
            "Streaming {} rows to '{}' every {:?} ({:?})",
            rows.len(),
            self.settings.topic,
            self.settings.interval,
            self.settings.qos
        );

        for (position, row) in rows.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Interrupted before row {}", row.index());
                report.outcome = Outcome::Interrupted;
                return report;
            }

            if !transport.is_connected() {
                error!("Session is not connected, stopping before row {}", row.index());
                report.outcome = Outcome::ConnectionFailed;
                return report;
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Interrupted while publishing row {}", row.index());
                    report.outcome = Outcome::Interrupted;
                    return report;
                }
                result = self.publish_row(row, transport) => result,
            };

            match result {
                Ok(preview) => {
                    report.published += 1;
                    info!("Published Row {}: {}", row.index(), preview);
                    self.report_progress(row.index(), preview, true);
                }
                Err(e) => {
                    report.rejected += 1;
                    warn!("Row {} not delivered: {}", row.index(), e);
                    self.report_progress(row.index(), e.to_string(), false);
                }
            }

            if position + 1 < rows.len() && !self.pause().await {
                info!("Interrupted after row {}", row.index());
                report.outcome = Outcome::Interrupted;
                return report;
            }
        }

        // interrupt that landed while the last row was in flight
        if self.cancel.is_cancelled() {
            report.outcome = Outcome::Interrupted;
        }

        info!(
            "Stream finished: {} published, {} rejected",
            report.published, report.rejected
        );
        report
    }

    async fn publish_row<T: Transport>(&self, row: &Row, transport: &T) -> Result<String, BridgeError> {
        let payload = codec::encode(row)?;
        let message = Message::new(self.settings.topic.clone(), payload, self.settings.qos);
        let preview = message.preview(PREVIEW_CHARS);
        debug!("Submitting row {} ({:?})", row.index(), message);
        transport.publish(message).await?;
        Ok(preview)
    }

    /// Sleeps for one interval; returns false if cancelled first
    async fn pause(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settings.interval) => true,
        }
    }

    fn report_progress(&self, index: usize, preview: String, accepted: bool) {
        if let Some(sender) = &self.progress {
            let progress = PublishProgress {
                index,
                preview,
                accepted,
                timestamp: Local::now(),
            };
            if sender.send(progress).is_err() {
                debug!("Progress receiver dropped");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dataset::{Record, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Records every submitted message; can reject rows or cancel mid-run
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub submitted: Mutex<Vec<Message>>,
        pub reject_at: Option<usize>,
        pub cancel_at: Option<(usize, CancellationToken)>,
        pub disconnected: AtomicBool,
        pub disconnect_after: Option<usize>,
    }

    impl RecordingTransport {
        pub(crate) fn payloads(&self) -> Vec<String> {
            self.submitted
                .lock()
                .unwrap()
                .iter()
                .map(|m| String::from_utf8(m.payload.clone()).unwrap())
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn is_connected(&self) -> bool {
            !self.disconnected.load(Ordering::SeqCst)
        }

        async fn publish(&self, message: Message) -> Result<(), BridgeError> {
            let count = {
                let mut submitted = self.submitted.lock().unwrap();
                submitted.push(message.clone());
                submitted.len()
            };
            let position = count - 1;
            if let Some((at, token)) = &self.cancel_at {
                if *at == position {
                    token.cancel();
                }
            }
            if self.disconnect_after == Some(position) {
                self.disconnected.store(true, Ordering::SeqCst);
            }
            if self.reject_at == Some(position) {
                return Err(BridgeError::rejected(message.topic, "refused by test"));
            }
            Ok(())
        }
    }

    pub(crate) fn sensor_rows() -> Vec<Row> {
        [(21.5, 40), (21.7, 41), (21.6, 40)]
            .into_iter()
            .enumerate()
            .map(|(i, (temp, hum))| {
                let mut record = Record::new();
                record.push("temp", Value::Float(temp));
                record.push("hum", Value::Int(hum));
                Row::new(i, record)
            })
            .collect()
    }

    fn numbered_rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| Row::new(i, [("i", Value::Int(i as i64))].into_iter().collect()))
            .collect()
    }

    fn settings(interval: Duration) -> PublishSettings {
        PublishSettings {
            topic: "facility/office/sensors".into(),
            interval,
            qos: QualityOfService::AtLeastOnce,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_sensor_rows_in_order() {
        let transport = RecordingTransport::default();
        let publisher = PublisherLoop::new(settings(Duration::from_secs(1)), CancellationToken::new());

        let report = publisher.run(&sensor_rows(), &transport).await;

        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.published, 3);
        assert_eq!(
            transport.payloads(),
            vec![
                r#"{"temp":21.5,"hum":40}"#,
                r#"{"temp":21.7,"hum":41}"#,
                r#"{"temp":21.6,"hum":40}"#,
            ]
        );
        let submitted = transport.submitted.lock().unwrap();
        assert!(submitted.iter().all(|m| m.topic == "facility/office/sensors"));
        assert!(submitted.iter().all(|m| m.qos == QualityOfService::AtLeastOnce));
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_source_order_for_many_rows() {
        let transport = RecordingTransport::default();
        let publisher = PublisherLoop::new(settings(Duration::from_millis(10)), CancellationToken::new());

        publisher.run(&numbered_rows(50), &transport).await;

        let expected: Vec<String> = (0..50).map(|i| format!(r#"{{"i":{}}}"#, i)).collect();
        assert_eq!(transport.payloads(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn paces_at_least_interval_between_rows() {
        let transport = RecordingTransport::default();
        let interval = Duration::from_secs(1);
        let publisher = PublisherLoop::new(settings(interval), CancellationToken::new());

        let started = tokio::time::Instant::now();
        let report = publisher.run(&numbered_rows(4), &transport).await;

        assert_eq!(report.outcome, Outcome::Completed);
        assert!(started.elapsed() >= interval * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_at_each_row_stops_submissions() {
        for k in 0..4 {
            let cancel = CancellationToken::new();
            let transport = RecordingTransport {
                cancel_at: Some((k, cancel.clone())),
                ..Default::default()
            };
            let publisher = PublisherLoop::new(settings(Duration::from_secs(1)), cancel);

            let report = publisher.run(&numbered_rows(4), &transport).await;

            assert_eq!(report.outcome, Outcome::Interrupted, "cancel at {}", k);
            assert_eq!(transport.submitted.lock().unwrap().len(), k + 1);
        }
    }

    #[tokio::test]
    async fn cancelled_before_start_publishes_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let transport = RecordingTransport::default();
        let publisher = PublisherLoop::new(settings(Duration::from_secs(1)), cancel);

        let report = publisher.run(&numbered_rows(3), &transport).await;

        assert_eq!(report.outcome, Outcome::Interrupted);
        assert!(transport.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_row_does_not_stop_the_run() {
        let transport = RecordingTransport {
            reject_at: Some(1),
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let publisher = PublisherLoop::new(settings(Duration::from_millis(100)), CancellationToken::new())
            .with_progress(tx);

        let report = publisher.run(&sensor_rows(), &transport).await;

        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.published, 2);
        assert_eq!(report.rejected, 1);

        let accepted: Vec<(usize, bool)> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|p| (p.index, p.accepted))
            .collect();
        assert_eq!(accepted, vec![(0, true), (1, false), (2, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_ends_the_run() {
        let transport = RecordingTransport {
            disconnect_after: Some(0),
            ..Default::default()
        };
        let publisher = PublisherLoop::new(settings(Duration::from_millis(100)), CancellationToken::new());

        let report = publisher.run(&numbered_rows(3), &transport).await;

        assert_eq!(report.outcome, Outcome::ConnectionFailed);
        assert_eq!(transport.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unencodable_row_is_reported_and_skipped() {
        let mut rows = numbered_rows(2);
        rows.insert(1, Row::new(1, [("i", Value::Float(f64::INFINITY))].into_iter().collect()));
        let transport = RecordingTransport::default();
        let publisher = PublisherLoop::new(settings(Duration::from_millis(10)), CancellationToken::new());

        let report = publisher.run(&rows, &transport).await;

        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.rejected, 1);
        assert_eq!(transport.submitted.lock().unwrap().len(), 2);
    }

    #[test]
    fn progress_line_shows_index_and_preview() {
        let progress = PublishProgress {
            index: 7,
            preview: r#"{"temp":21.5}"#.into(),
            accepted: true,
            timestamp: Local::now(),
        };
        assert!(progress.to_string().ends_with(r#"Published row 7: {"temp":21.5}"#));
    }

    #[test]
    fn exit_codes_follow_outcome() {
        assert_eq!(Outcome::Completed.exit_code(), 0);
        assert_eq!(Outcome::Interrupted.exit_code(), 0);
        assert_eq!(Outcome::DatasetMissing.exit_code(), 2);
        assert_eq!(Outcome::ConnectionFailed.exit_code(), 3);
    }
}
