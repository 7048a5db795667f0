//! Bridge runner
//!
//! Drives one replay from start to finish:
//!
//! 1. Load the dataset (a missing file ends the run before any connection attempt)
//! 2. Connect and wait for the broker to accept the session
//! 3. Stream the rows through the publisher loop
//! 4. Shut down exactly once, whichever way the run ended

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::codec;
use crate::config::{BridgeConfig, RunOptions};
use crate::dataset::{self, Row};
use crate::error::BridgeError;
use crate::mqtt::session::{Connecting, Handshake, Session};
use crate::publisher::{Outcome, PublishProgress, PublisherLoop, RunReport, PREVIEW_CHARS};
use crate::shutdown::{ShutdownHandler, ShutdownTrigger};

pub struct Bridge {
    config: BridgeConfig,
    options: RunOptions,
    shutdown: ShutdownHandler,
    progress: Option<mpsc::UnboundedSender<PublishProgress>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, options: RunOptions, shutdown: ShutdownHandler) -> Self {
        Self {
            config,
            options,
            shutdown,
            progress: None,
        }
    }

    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<PublishProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn shutdown_handler(&self) -> &ShutdownHandler {
        &self.shutdown
    }

    pub async fn run(&self) -> Result<RunReport, BridgeError> {
        let started = Instant::now();
        let result = self.stream().await;
        match &result {
            Ok(report) => info!(
                "Run {} after {:.1?}: {} published, {} rejected",
                report.outcome,
                started.elapsed(),
                report.published,
                report.rejected
            ),
            Err(e) => error!("Run aborted after {:.1?}: {}", started.elapsed(), e),
        }
        result
    }

    async fn stream(&self) -> Result<RunReport, BridgeError> {
        let dataset = match dataset::load(&self.config.dataset) {
            Ok(dataset) => dataset,
            Err(e @ BridgeError::DatasetNotFound { .. }) => {
                error!("{}. Did you run the generator?", e);
                self.shutdown
                    .execute_without_session(ShutdownTrigger::DatasetMissing);
                return Ok(RunReport::new(Outcome::DatasetMissing));
            }
            Err(e) => {
                self.shutdown.execute_without_session(ShutdownTrigger::Error);
                return Err(e);
            }
        };

        let rows = dataset.window(self.options.start_row, self.options.limit);
        info!(
            "Loaded {} rows of telemetry, streaming {} starting at row {}",
            dataset.len(),
            rows.len(),
            self.options.start_row
        );

        if self.options.dry_run {
            let report = self.dry_run(rows);
            self.shutdown.execute_without_session(report.outcome.into());
            return Ok(report);
        }

        let endpoint = self.config.broker.endpoint();
        let session = match Session::<Connecting>::connect(
            endpoint,
            &self.config.credentials,
            &self.config.broker.session_options(),
        ) {
            Ok(session) => session,
            Err(e) => {
                error!("{}", e);
                self.shutdown
                    .execute_without_session(ShutdownTrigger::ConnectionFailed);
                return Ok(RunReport::new(Outcome::ConnectionFailed));
            }
        };

        let cancel = self.shutdown.token();
        match session
            .established(self.config.broker.connect_timeout(), &cancel)
            .await
        {
            Handshake::Established(mut session) => {
                let mut publisher = PublisherLoop::new(self.config.publish_settings(), cancel);
                if let Some(progress) = &self.progress {
                    publisher = publisher.with_progress(progress.clone());
                }
                let report = publisher.run(rows, &session).await;
                self.shutdown
                    .execute(&mut session, report.outcome.into())
                    .await;
                Ok(report)
            }
            Handshake::Failed(mut session, e) => {
                error!("{}", e);
                self.shutdown
                    .execute(&mut session, ShutdownTrigger::ConnectionFailed)
                    .await;
                Ok(RunReport::new(Outcome::ConnectionFailed))
            }
            Handshake::Interrupted(mut session) => {
                self.shutdown
                    .execute(&mut session, ShutdownTrigger::Interrupted)
                    .await;
                Ok(RunReport::new(Outcome::Interrupted))
            }
        }
    }

    fn dry_run(&self, rows: &[Row]) -> RunReport {
        let mut report = RunReport::new(Outcome::Completed);
        for row in rows {
            match codec::encode(row) {
                Ok(payload) => {
                    report.published += 1;
                    info!(
                        "Dry run row {}: {}",
                        row.index(),
                        codec::preview(&payload, PREVIEW_CHARS)
                    );
                }
                Err(e) => {
                    report.rejected += 1;
                    warn!("Dry run row {} cannot be encoded: {}", row.index(), e);
                }
            }
        }
        report
    }
}
