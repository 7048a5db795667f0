//! Shutdown handling
//!
//! Every way a run can end (rows exhausted, Ctrl+C or SIGTERM, broker failure, missing dataset) goes
//! through [`ShutdownHandler::execute`], which stops the network loop and then closes the
//! session. The handler latches after the first call, so a second trigger is a no-op.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::publisher::Outcome;

/// Resources torn down on shutdown, in this order
pub trait Teardown {
    fn stop_network_loop(&mut self) -> impl Future<Output = ()>;
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Completed,
    Interrupted,
    ConnectionFailed,
    DatasetMissing,
    Error,
}

impl From<Outcome> for ShutdownTrigger {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed => ShutdownTrigger::Completed,
            Outcome::Interrupted => ShutdownTrigger::Interrupted,
            Outcome::ConnectionFailed => ShutdownTrigger::ConnectionFailed,
            Outcome::DatasetMissing => ShutdownTrigger::DatasetMissing,
        }
    }
}

#[derive(Debug)]
pub struct ShutdownHandler {
    cancel: CancellationToken,
    fired: AtomicBool,
    executions: AtomicUsize,
}

impl ShutdownHandler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            fired: AtomicBool::new(false),
            executions: AtomicUsize::new(0),
        }
    }

    /// Token cancelled by an external interrupt
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// How many times the teardown sequence actually ran
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Cancels the run token on Ctrl+C, or on SIGTERM where the platform has it
    ///
    /// The returned task should be aborted once the run is over.
    pub fn listen_for_interrupt(&self) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let terminate = terminate_signal();
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt_signal() => debug!("Received Ctrl+C"),
                _ = terminate => debug!("Received SIGTERM"),
            }
            info!("Stopping stream...");
            cancel.cancel();
        })
    }

    fn latch(&self, trigger: ShutdownTrigger) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already ran, ignoring trigger {:?}", trigger);
            return false;
        }
        self.executions.fetch_add(1, Ordering::SeqCst);
        info!("Shutting down ({:?})", trigger);
        true
    }

    /// Stops the network loop, then closes the session; runs at most once
    pub async fn execute<T: Teardown>(&self, target: &mut T, trigger: ShutdownTrigger) -> bool {
        if !self.latch(trigger) {
            return false;
        }
        self.cancel.cancel();
        target.stop_network_loop().await;
        target.close();
        true
    }

    /// Shutdown for a run that never opened a session
    pub fn execute_without_session(&self, trigger: ShutdownTrigger) -> bool {
        if !self.latch(trigger) {
            return false;
        }
        self.cancel.cancel();
        debug!("No session to close");
        true
    }
}

async fn interrupt_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Registers the SIGTERM handler right away, so a signal sent after this returns is caught
#[cfg(unix)]
fn terminate_signal() -> impl Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};

    let registered = signal(SignalKind::terminate());
    async move {
        match registered {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
fn terminate_signal() -> impl Future<Output = ()> {
    std::future::pending()
}
