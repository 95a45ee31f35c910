//! Tamper event source
//!
//! The monitor polls a [`TamperSource`] and tells every registered
//! [`TamperObserver`] when the tamper line changes. Observers are only called
//! on a transition, never on a repeated reading.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::types::{HsmError, Result};

/// Receives tamper transitions
pub trait TamperObserver: Send + Sync {
    fn on_tamper_changed(&self, tampered: bool);
}

/// Something that can report whether the enclosure is tampered
#[async_trait]
pub trait TamperSource: Send + Sync {
    async fn read_tamper(&self) -> Result<bool>;
}

/// GPIO value files; a `0` on any line means tamper
pub struct FileTamperSource {
    paths: Vec<PathBuf>,
}

impl FileTamperSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl TamperSource for FileTamperSource {
    async fn read_tamper(&self) -> Result<bool> {
        for path in &self.paths {
            let value = tokio::fs::read_to_string(path).await?;
            match value.trim() {
                "0" => return Ok(true),
                "1" => {}
                other => {
                    return Err(HsmError::Config(format!(
                        "unexpected value {:?} in {}",
                        other,
                        path.display()
                    )))
                }
            }
        }
        Ok(false)
    }
}

#[derive(Default)]
pub struct TamperMonitor {
    observers: RwLock<Vec<Arc<dyn TamperObserver>>>,
    tampered: AtomicBool,
}

impl TamperMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: Arc<dyn TamperObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    pub fn is_tampered(&self) -> bool {
        self.tampered.load(Ordering::Acquire)
    }

    /// Record a reading or an administrative assert/clear
    pub fn set_tamper(&self, tampered: bool) {
        if self.tampered.swap(tampered, Ordering::AcqRel) == tampered {
            return;
        }

        if tampered {
            error!("TAMPER DETECTED");
        } else {
            warn!("Tamper condition cleared");
        }

        let observers = match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for observer in observers {
            observer.on_tamper_changed(tampered);
        }
    }

    /// Poll `source` every `interval` until the task is aborted
    pub fn spawn_polling(self: Arc<Self>, source: Box<dyn TamperSource>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match source.read_tamper().await {
                    Ok(tampered) => self.set_tamper(tampered),
                    Err(e) => debug!("Tamper source unreadable: {}", e),
                }
            }
        })
    }
}
