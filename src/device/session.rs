//! Serialized request/reply exchange with one device
//!
//! Each device gets a worker task that owns its transport. Exchanges are
//! queued on an mpsc channel and processed strictly in order, so requests
//! from different client sessions are never interleaved on the wire.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::state::{DeviceState, DeviceStatus};
use super::transport::{DeviceTransport, TransportConnector};
use crate::protocol::packets::{PacketHeader, MIN_PACKET_LEN};
use crate::types::{HsmError, Result};

/// Queued exchanges per device before senders wait
const QUEUE_DEPTH: usize = 256;

type ExchangeJob = (Vec<u8>, oneshot::Sender<Result<Vec<u8>>>);

/// Handle to one device's exchange queue
pub struct DeviceSession {
    index: usize,
    name: String,
    status: Arc<DeviceStatus>,
    tx: mpsc::Sender<ExchangeJob>,
}

impl DeviceSession {
    /// Start the worker task for device `index`.
    ///
    /// The transport is opened lazily by the worker; a device that cannot
    /// be reached at startup is marked NotReady.
    pub fn spawn(
        index: usize,
        connector: Arc<dyn TransportConnector>,
        exchange_timeout: Duration,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<ExchangeJob>(QUEUE_DEPTH);
        let status = Arc::new(DeviceStatus::default());
        let name = connector.describe();

        let worker = DeviceWorker {
            index,
            connector,
            status: Arc::clone(&status),
            exchange_timeout,
            transport: None,
        };
        tokio::spawn(worker.run(rx));

        Arc::new(Self {
            index,
            name,
            status,
            tx,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> DeviceState {
        self.status.state()
    }

    pub fn set_state(&self, state: DeviceState) {
        self.status.set_state(state);
    }

    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    pub fn state_description(&self) -> &'static str {
        self.state().description()
    }

    /// Send `request` and wait for the matching reply.
    ///
    /// The worker bounds every attempt with the exchange timeout, so this
    /// always completes.
    pub async fn exchange(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.status.add_busy(1);
        let result = async {
            self.tx.send((request, reply_tx)).await.map_err(|_| HsmError::DeviceUnavailable {
                index: self.index,
                reason: "exchange worker stopped".into(),
            })?;
            reply_rx.await.map_err(|_| HsmError::DeviceUnavailable {
                index: self.index,
                reason: "exchange dropped".into(),
            })?
        }
        .await;
        self.status.add_busy(-1);

        result
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

struct DeviceWorker {
    index: usize,
    connector: Arc<dyn TransportConnector>,
    status: Arc<DeviceStatus>,
    exchange_timeout: Duration,
    transport: Option<Box<dyn DeviceTransport>>,
}

impl DeviceWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<ExchangeJob>) {
        if let Err(e) = self.reopen().await {
            warn!(device = self.index, "Device not reachable at startup: {}", e);
            self.status.set_state(DeviceState::NotReady);
        }

        while let Some((request, reply_tx)) = rx.recv().await {
            let result = self.exchange_with_retry(&request).await;
            // the caller may have gone away; the device-side effect stands
            let _ = reply_tx.send(result);
        }

        debug!(device = self.index, "Exchange queue closed, worker exiting");
    }

    async fn reopen(&mut self) -> Result<()> {
        self.transport = None;
        let transport = self.connector.connect().await?;
        self.transport = Some(transport);
        info!(device = self.index, name = %self.connector.describe(), "Device transport open");
        Ok(())
    }

    async fn exchange_with_retry(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let expected = PacketHeader::parse(request)?;

        match self.attempt(request, expected).await {
            Ok(reply) => return Ok(reply),
            Err(e) if !e.is_transport() => return Err(e),
            Err(e) => warn!(device = self.index, "Exchange failed, reopening transport: {}", e),
        }

        let retried = match self.reopen().await {
            Ok(()) => self.attempt(request, expected).await,
            Err(e) => Err(e),
        };

        retried.map_err(|e| {
            error!(device = self.index, "Exchange failed after reopen, marking device not ready: {}", e);
            self.transport = None;
            self.status.set_state(DeviceState::NotReady);
            HsmError::Transport(format!("device {}: {}", self.index, e))
        })
    }

    async fn attempt(&mut self, request: &[u8], expected: PacketHeader) -> Result<Vec<u8>> {
        let index = self.index;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| HsmError::Transport("transport not open".into()))?;

        let exchange = async {
            transport.send_frame(request).await?;
            loop {
                let reply = transport.recv_frame().await?;
                if reply.len() < MIN_PACKET_LEN {
                    continue;
                }
                let header = PacketHeader::parse(&reply)?;
                if header == expected {
                    return Ok(reply);
                }
                debug!(
                    device = index,
                    code = header.code,
                    handle = %format!("0x{:x}", header.handle),
                    head = %hex::encode(&reply[..reply.len().min(16)]),
                    "Discarding stale reply"
                );
            }
        };

        match timeout(self.exchange_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(HsmError::Transport(format!(
                "no reply within {:?}",
                self.exchange_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packets::error_reply;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays canned frames; fails every send while `fail_sends` is positive
    struct Scripted {
        replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
        fail_sends: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeviceTransport for Scripted {
        async fn send_frame(&mut self, _payload: &[u8]) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) > 0 {
                self.fail_sends.fetch_sub(1, Ordering::SeqCst);
                return Err(HsmError::Transport("line dropped".into()));
            }
            Ok(())
        }

        async fn recv_frame(&mut self) -> Result<Vec<u8>> {
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(frame) => Ok(frame),
                None => std::future::pending().await,
            }
        }
    }

    struct ScriptedConnector {
        replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
        fail_sends: Arc<AtomicUsize>,
        connects: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(replies: Vec<Vec<u8>>, fail_sends: usize) -> Arc<Self> {
            Arc::new(Self {
                replies: Arc::new(Mutex::new(replies.into())),
                fail_sends: Arc::new(AtomicUsize::new(fail_sends)),
                connects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TransportConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn DeviceTransport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Scripted {
                replies: Arc::clone(&self.replies),
                fail_sends: Arc::clone(&self.fail_sends),
            }))
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    #[tokio::test]
    async fn test_stale_replies_are_skipped() {
        let good = error_reply(1, 7, 0);
        let connector = ScriptedConnector::new(vec![vec![1, 2], error_reply(1, 6, 0), good.clone()], 0);
        let device = DeviceSession::spawn(0, connector, Duration::from_secs(1));

        let reply = device.exchange(error_reply(1, 7, 0)[..8].to_vec()).await.unwrap();
        assert_eq!(reply, good);
        assert_eq!(device.status().busy_count(), 0);
    }

    #[tokio::test]
    async fn test_single_reopen_then_success() {
        let connector = ScriptedConnector::new(vec![error_reply(0, 1, 0)], 1);
        let device = DeviceSession::spawn(0, connector.clone(), Duration::from_secs(1));
        device.status().unlock();

        assert!(device.exchange(error_reply(0, 1, 0)[..8].to_vec()).await.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(device.state(), DeviceState::Ready);
    }

    #[tokio::test]
    async fn test_second_failure_marks_not_ready() {
        let connector = ScriptedConnector::new(vec![], 2);
        let device = DeviceSession::spawn(0, connector.clone(), Duration::from_secs(1));
        device.status().unlock();

        let result = device.exchange(error_reply(0, 1, 0)[..8].to_vec()).await;
        assert!(matches!(result, Err(HsmError::Transport(_))));
        assert_eq!(device.state(), DeviceState::NotReady);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transport_failure() {
        let connector = ScriptedConnector::new(vec![], 0);
        let device = DeviceSession::spawn(0, connector, Duration::from_millis(20));
        device.status().unlock();

        let result = device.exchange(error_reply(0, 1, 0)[..8].to_vec()).await;
        assert!(matches!(result, Err(HsmError::Transport(_))));
        assert_eq!(device.state(), DeviceState::NotReady);
    }
}
