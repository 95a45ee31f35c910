//! Background synchronizer
//!
//! Long-running maintenance jobs (cache rebuild, key copies between devices,
//! remote export/import) run on a single worker task fed by a FIFO queue.
//! Each job runs to completion before the next one starts.

pub mod client;
pub mod command;
mod worker;

pub use client::DeviceClient;
pub use command::{ExportBundle, ExportedKey, KekekInfo, SyncCommand, SyncReport, SyncResult};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::KeyCache;
use crate::device::DeviceSession;
use crate::tamper::TamperObserver;
use crate::types::{HsmError, Result};

struct Job {
    command: SyncCommand,
    reports: Option<mpsc::UnboundedSender<SyncReport>>,
}

/// Handle to the synchronizer worker
pub struct Synchronizer {
    tx: mpsc::UnboundedSender<Job>,
    tamper: Arc<AtomicBool>,
}

impl Synchronizer {
    /// Start the worker. `handle` is the client handle the worker uses on
    /// every device; take it from the preprocessor so it never collides
    /// with a connection.
    pub fn spawn(devices: Vec<Arc<DeviceSession>>, cache: Arc<KeyCache>, handle: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let tamper = Arc::new(AtomicBool::new(false));

        let worker = worker::SyncWorker::new(devices, cache, handle, Arc::clone(&tamper));
        tokio::spawn(worker.run(rx));

        Self { tx, tamper }
    }

    /// Queue `command`; its report goes to `reports` when given
    pub fn submit(
        &self,
        command: SyncCommand,
        reports: Option<mpsc::UnboundedSender<SyncReport>>,
    ) -> Result<()> {
        self.tx.send(Job { command, reports }).map_err(|e| {
            let job = e.0;
            warn!(command = job.command.name(), "Synchronizer worker is gone");
            HsmError::Sync("synchronizer worker stopped".into())
        })
    }

    /// Queue `command` and wait for its result
    pub async fn run(&self, command: SyncCommand) -> SyncResult {
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Err(e) = self.submit(command, Some(tx)) {
            return SyncResult::Failed(e.to_string());
        }
        match rx.recv().await {
            Some(report) => report.result,
            None => SyncResult::Failed("synchronizer dropped the command".into()),
        }
    }
}

impl TamperObserver for Synchronizer {
    fn on_tamper_changed(&self, tampered: bool) {
        self.tamper.store(tampered, Ordering::Release);
    }
}

fn report(command: SyncCommand, result: SyncResult) -> SyncReport {
    SyncReport {
        command,
        result,
        finished_at: Utc::now(),
    }
}
