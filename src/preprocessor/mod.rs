//! RPC preprocessor
//!
//! Decides, per request, which device(s) a call goes to, forwards it, and
//! folds the replies back into the single answer the client expects.
//!
//! ## Flow
//!
//! 1. [`RpcPreprocessor::route`] turns a request into an [`Action`]: an
//!    immediate reply, or a set of target devices plus a [`Continuation`].
//! 2. The driver in [`RpcPreprocessor::process`] exchanges with the targets
//!    concurrently.
//! 3. [`RpcPreprocessor::reconcile`] consumes the replies and yields the
//!    next action. Key matching loops through steps 2 and 3 once per device.
//!
//! Session state lives in a `DashMap` keyed by connection handle and is only
//! borrowed inside the synchronous route/reconcile steps, never across a
//! device exchange.

mod action;
mod balancer;
mod reconcile;
mod routing;
mod session;

pub use action::{Action, Continuation, MatchProgress};
pub use balancer::RoundRobin;
pub use session::{KeyBinding, Session};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::cache::KeyCache;
use crate::device::{DeviceSession, DeviceState};
use crate::protocol::packets::{error_reply, logout_request, PacketHeader};
use crate::protocol::{HalError, RpcFunc};
use crate::settings::Settings;
use crate::tamper::TamperObserver;
use crate::types::{HsmError, Result};

/// Routing engine shared by every connection
pub struct RpcPreprocessor {
    devices: Vec<Arc<DeviceSession>>,
    cache: Arc<KeyCache>,
    settings: Arc<Settings>,
    sessions: DashMap<u32, Session>,
    balancer: RoundRobin,
    next_handle: AtomicU32,
    hsm_locked: AtomicBool,
    tamper: AtomicBool,
}

impl RpcPreprocessor {
    pub fn new(
        devices: Vec<Arc<DeviceSession>>,
        cache: Arc<KeyCache>,
        settings: Arc<Settings>,
        uses_before_rotate: u32,
    ) -> Self {
        Self {
            devices,
            cache,
            settings,
            sessions: DashMap::new(),
            balancer: RoundRobin::new(uses_before_rotate),
            next_handle: AtomicU32::new(1),
            hsm_locked: AtomicBool::new(true),
            tamper: AtomicBool::new(false),
        }
    }

    pub fn devices(&self) -> &[Arc<DeviceSession>] {
        &self.devices
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Fresh per-connection handle; wraps around and never returns 0
    pub fn next_client_handle(&self) -> u32 {
        loop {
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if handle != 0 {
                return handle;
            }
        }
    }

    /// Open a session and return its connection handle
    pub fn create_session(&self, from_untrusted: bool) -> u32 {
        let handle = self.next_client_handle();
        let session = Session::new(
            handle,
            from_untrusted,
            self.settings.exportable_private_keys(),
        );
        self.sessions.insert(handle, session);
        debug!(handle = %format!("0x{:x}", handle), from_untrusted, "Session created");
        handle
    }

    /// Copy of a session's routing state
    pub fn session(&self, handle: u32) -> Option<Session> {
        self.sessions.get(&handle).map(|s| s.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop the session and log its handle out of every device
    pub async fn end_session(&self, handle: u32) {
        self.sessions.remove(&handle);

        let logouts = self
            .devices
            .iter()
            .map(|device| device.exchange(logout_request(handle)));
        for (index, result) in join_all(logouts).await.into_iter().enumerate() {
            if let Err(e) = result {
                debug!(device = index, handle = %format!("0x{:x}", handle), "Logout on disconnect failed: {}", e);
            }
        }
        debug!(handle = %format!("0x{:x}", handle), "Session ended");
    }

    // =========================================================================
    // HSM lock and tamper
    // =========================================================================

    pub fn unlock_hsm(&self) {
        self.hsm_locked.store(false, Ordering::Release);
        for device in &self.devices {
            device.status().unlock();
        }
        info!("HSM unlocked");
    }

    pub fn lock_hsm(&self) {
        self.hsm_locked.store(true, Ordering::Release);
        for device in &self.devices {
            device.set_state(DeviceState::Locked);
        }
        info!("HSM locked");
    }

    pub fn is_hsm_locked(&self) -> bool {
        self.hsm_locked.load(Ordering::Acquire)
    }

    pub fn is_tampered(&self) -> bool {
        self.tamper.load(Ordering::Acquire)
    }

    /// Network clients are refused while this holds
    pub fn is_rpc_locked(&self) -> bool {
        self.is_hsm_locked() || !self.cache.is_initialized() || !self.settings.masterkey_set()
    }

    /// Status sent to a network client that is turned away
    pub fn lockout_status(&self) -> HalError {
        if self.settings.masterkey_set() {
            HalError::Forbidden
        } else {
            HalError::MasterkeyNotSet
        }
    }

    // =========================================================================
    // Request driver
    // =========================================================================

    /// Handle one request from session `handle` and produce the reply.
    ///
    /// The request already carries the connection handle. Every failure
    /// becomes a well-formed error reply.
    pub async fn process(&self, handle: u32, request: Vec<u8>) -> Vec<u8> {
        let header = match PacketHeader::parse(&request) {
            Ok(header) => header,
            Err(_) => return error_reply(0, handle, HalError::BadArguments.code()),
        };
        let fail = |e: HsmError| error_reply(header.code, header.handle, e.hal_status().code());

        let mut action = match self.route(handle, header, &request) {
            Ok(action) => action,
            Err(e) => {
                debug!(code = header.code, "Request rejected during routing: {}", e);
                return fail(e);
            }
        };

        loop {
            match action {
                Action::Reply(reply) => return reply,
                Action::Forward {
                    request,
                    targets,
                    then,
                } => {
                    let replies = match self.exchange_with(header, &request, &targets).await {
                        Ok(replies) => replies,
                        Err(e) => return fail(e),
                    };
                    action = match self.reconcile(handle, header, then, replies) {
                        Ok(next) => next,
                        Err(e) => {
                            warn!(code = header.code, "Reconciling device replies failed: {}", e);
                            return fail(e);
                        }
                    };
                }
            }
        }
    }

    /// Exchange `request` with each target concurrently, in target order
    async fn exchange_with(
        &self,
        header: PacketHeader,
        request: &[u8],
        targets: &[usize],
    ) -> Result<Vec<(usize, Vec<u8>)>> {
        if targets.is_empty() {
            return Err(HsmError::Hal(HalError::Forbidden));
        }

        for &index in targets {
            let device = self.device(index)?;
            if let Some(status) = device.state().rejection() {
                debug!(device = index, state = ?device.state(), "Device not accepting requests");
                return Err(HsmError::Hal(status));
            }
        }

        let generating = matches!(
            RpcFunc::from_code(header.code),
            Some(RpcFunc::PkeyGenerateRsa | RpcFunc::PkeyGenerateEc | RpcFunc::PkeyGenerateHashsig)
        );

        let exchanges = targets.iter().map(|&index| async move {
            let device = &self.devices[index];
            let keygen = generating && device.status().begin_keygen();
            let result = device.exchange(request.to_vec()).await;
            if keygen {
                device.status().end_keygen();
            }
            result.map(|reply| (index, reply))
        });

        join_all(exchanges).await.into_iter().collect()
    }

    fn device(&self, index: usize) -> Result<&Arc<DeviceSession>> {
        self.devices.get(index).ok_or_else(|| HsmError::DeviceUnavailable {
            index,
            reason: format!("only {} devices attached", self.devices.len()),
        })
    }
}

impl TamperObserver for RpcPreprocessor {
    fn on_tamper_changed(&self, tampered: bool) {
        self.tamper.store(tampered, Ordering::Release);
        self.hsm_locked.store(true, Ordering::Release);
        if tampered {
            for device in &self.devices {
                device.status().force_tamper();
            }
            warn!("Tamper asserted, all devices locked out");
        } else {
            for device in &self.devices {
                device.status().clear_tamper(DeviceState::TamperReset);
            }
            info!("Tamper cleared, HSM must be unlocked again");
        }
    }
}
