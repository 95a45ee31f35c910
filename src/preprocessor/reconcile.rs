//! Folding device replies back into one client reply

use tracing::{debug, warn};
use uuid::Uuid;

use super::action::{Action, Continuation, MatchProgress};
use super::session::{KeyBinding, Session};
use super::RpcPreprocessor;
use crate::protocol::packets::{
    error_reply, keygen_result, parse_keygen_result, PacketHeader, ReplyHeader,
};
use crate::protocol::xdr::read_u32_at;
use crate::protocol::{HalError, KeyMatchReply, KeyType, RpcFunc};
use crate::types::{HsmError, Result};

/// Offset of the first reply payload field, after code, handle and status
const PAYLOAD_OFFSET: usize = 12;

impl RpcPreprocessor {
    pub(super) fn reconcile(
        &self,
        handle: u32,
        header: PacketHeader,
        then: Continuation,
        mut replies: Vec<(usize, Vec<u8>)>,
    ) -> Result<Action> {
        for (device, reply) in &replies {
            let reply_header = ReplyHeader::parse(reply)?;
            if reply_header.code != header.code {
                warn!(
                    device,
                    expected = header.code,
                    got = reply_header.code,
                    "Reply carries the wrong function code"
                );
                return Ok(Action::Reply(error_reply(
                    header.code,
                    header.handle,
                    HalError::RpcTransport.code(),
                )));
            }
        }

        if let Continuation::AllDevices = then {
            return Ok(Action::Reply(Self::first_failure_or_first(replies)?));
        }

        let (_, reply) = replies
            .pop()
            .ok_or_else(|| HsmError::Internal("forward produced no reply".into()))?;
        let status = ReplyHeader::parse(&reply)?;

        match then {
            Continuation::PassThrough | Continuation::AllDevices => Ok(Action::Reply(reply)),

            Continuation::StartHash { device } => {
                if status.is_ok() {
                    let hash_handle = read_u32_at(&reply, PAYLOAD_OFFSET)?;
                    self.with_session(handle, |session| {
                        session.hash_bindings.insert(hash_handle, device);
                    });
                }
                Ok(Action::Reply(reply))
            }

            Continuation::EndHash { hash_handle } => {
                self.with_session(handle, |session| {
                    session.hash_bindings.remove(&hash_handle);
                });
                Ok(Action::Reply(reply))
            }

            Continuation::OpenKey { device, device_key } => {
                if status.is_ok() {
                    let key_handle = read_u32_at(&reply, PAYLOAD_OFFSET)?;
                    self.with_session(handle, |session| {
                        session
                            .key_bindings
                            .insert(key_handle, KeyBinding { device, device_key });
                    });
                }
                Ok(Action::Reply(reply))
            }

            Continuation::CreateKey {
                device,
                key_type,
                flags,
            } => self.finish_create_key(handle, header, device, key_type, flags, reply),

            Continuation::CloseKey {
                key_handle,
                device,
                device_key,
                delete,
            } => {
                if status.is_ok() {
                    if delete && !self.cache.unlink_key(device, &device_key) {
                        debug!(device, %device_key, "Deleted key was not cached");
                    }
                    self.with_session(handle, |session| {
                        session.key_bindings.remove(&key_handle);
                    });
                }
                Ok(Action::Reply(reply))
            }

            Continuation::Match(progress) => self.continue_match(header, progress, reply),
        }
    }

    fn with_session(&self, handle: u32, update: impl FnOnce(&mut Session)) {
        match self.sessions.get_mut(&handle) {
            Some(mut session) => update(session.value_mut()),
            None => debug!(handle = %format!("0x{:x}", handle), "Session gone before reply arrived"),
        }
    }

    /// Every device must agree; the first failing status wins
    fn first_failure_or_first(replies: Vec<(usize, Vec<u8>)>) -> Result<Vec<u8>> {
        let mut first = None;
        for (device, reply) in replies {
            let status = ReplyHeader::parse(&reply)?;
            if !status.is_ok() {
                debug!(device, status = status.status, "Device rejected replicated call");
                return Ok(reply);
            }
            first.get_or_insert(reply);
        }
        first.ok_or_else(|| HsmError::Internal("replicated call produced no reply".into()))
    }

    fn finish_create_key(
        &self,
        handle: u32,
        header: PacketHeader,
        device: usize,
        key_type: KeyType,
        flags: u32,
        reply: Vec<u8>,
    ) -> Result<Action> {
        let creates_key = RpcFunc::from_code(header.code).is_some_and(RpcFunc::creates_key);
        if !creates_key {
            return Ok(Action::Reply(error_reply(
                header.code,
                header.handle,
                HalError::RpcTransport.code(),
            )));
        }

        let (reply_header, key_handle, device_key) = match ReplyHeader::parse(&reply)? {
            status if !status.is_ok() => return Ok(Action::Reply(reply)),
            _ => parse_keygen_result(&reply)?,
        };

        let (cache_keys, device_uuids) = self
            .session(handle)
            .map(|s| (s.cache_generated_keys, s.incoming_device_uuids))
            .unwrap_or((true, false));

        // the cache must know the key before the client can see it
        let outgoing = if cache_keys {
            let master = self.cache.link_key(device, device_key, key_type, flags, None)?;
            debug!(device, %device_key, %master, key_type = ?key_type, "Cached new key");
            if device_uuids {
                device_key
            } else {
                master
            }
        } else {
            device_key
        };

        self.with_session(handle, |session| {
            session
                .key_bindings
                .insert(key_handle, KeyBinding { device, device_key });
            session.last_key_device = Some(device);
        });

        Ok(Action::Reply(keygen_result(
            reply_header.code,
            reply_header.handle,
            reply_header.status,
            key_handle,
            &outgoing,
        )))
    }

    fn continue_match(
        &self,
        header: PacketHeader,
        mut progress: MatchProgress,
        reply: Vec<u8>,
    ) -> Result<Action> {
        let page = KeyMatchReply::parse(&reply)?;
        if !page.header.is_ok() {
            return Ok(Action::Reply(reply));
        }

        let device = progress.device;
        for device_key in &page.uuids {
            let Some(master) = self.cache.master_for(device, device_key) else {
                debug!(device, %device_key, "Match returned a key the cache does not know");
                continue;
            };
            // a mirrored key is reported by its lowest-index holder only
            let reported_here = self
                .cache
                .lowest_index_holding(&master)
                .is_some_and(|(lowest, _)| lowest == device);
            if reported_here {
                progress.found.push(master);
            }
        }

        let wanted = progress.wanted as usize;
        if progress.found.len() < wanted {
            let asked = progress.request.result_max as usize;
            let next = device + 1;
            if asked > 0 && page.uuids.len() >= asked {
                // full page: this device may hold more
                let Some(last) = page.uuids.last() else {
                    return Err(HsmError::Internal("full match page without keys".into()));
                };
                progress.request.previous = *last;
                progress.request.state = page.state;
            } else if next < self.devices.len() {
                progress.request.previous = Uuid::nil();
                progress.request.state = 0;
                progress.device = next;
            } else {
                return Ok(self.match_reply(header, page.state, &progress));
            }
            progress.request.result_max = (wanted - progress.found.len()) as u32;
            let request = progress.request.encode(header.handle);
            debug!(
                device = progress.device,
                found = progress.found.len(),
                "Continuing key match"
            );
            return Ok(Action::forward(request, progress.device, Continuation::Match(progress)));
        }

        Ok(self.match_reply(header, page.state, &progress))
    }

    fn match_reply(&self, header: PacketHeader, state: u32, progress: &MatchProgress) -> Action {
        Action::Reply(KeyMatchReply::encode(
            header.code,
            header.handle,
            state,
            &progress.found,
            progress.wanted,
        ))
    }
}
