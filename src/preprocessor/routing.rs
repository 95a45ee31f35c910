//! Request routing by function code

use tracing::debug;

use super::action::{Action, Continuation, MatchProgress};
use super::session::Session;
use super::RpcPreprocessor;
use crate::protocol::packets::{
    error_reply, keygen_flag_offset, ok_reply_writer, pkey_open_request, uuid_from_wire,
    PacketHeader,
};
use crate::protocol::xdr::{read_u32_at, write_u32_at};
use crate::protocol::{key_flags, HalError, KeyMatchRequest, KeyType, RpcFunc, XdrReader};
use crate::types::{HsmError, Result};

/// Offset of the first body field, after code and client handle
const BODY_OFFSET: usize = 8;

/// SET_RPC_DEVICE value that returns the session to automatic selection
const AUTO_SELECT_DEVICE: u32 = u32::MAX;

fn reject(header: PacketHeader, status: HalError) -> Action {
    Action::Reply(error_reply(header.code, header.handle, status.code()))
}

fn ok(header: PacketHeader) -> Action {
    Action::Reply(ok_reply_writer(header.code, header.handle).finish())
}

impl RpcPreprocessor {
    /// Decide what to do with `request` on behalf of session `handle`
    pub(super) fn route(&self, handle: u32, header: PacketHeader, request: &[u8]) -> Result<Action> {
        let Some(func) = RpcFunc::from_code(header.code) else {
            debug!(code = header.code, "Unknown function code");
            return Ok(reject(header, HalError::RpcBadFunction));
        };

        let mut session = self
            .sessions
            .get_mut(&handle)
            .ok_or_else(|| HsmError::Internal(format!("no session for handle 0x{:x}", handle)))?;

        if session.from_untrusted && (self.is_tampered() || self.is_rpc_locked()) {
            return Ok(reject(header, self.lockout_status()));
        }

        debug!(
            handle = %format!("0x{:x}", handle),
            code = ?func,
            device_override = ?session.device_override,
            "Routing request"
        );

        use RpcFunc::*;
        match func {
            GetVersion | GetRandom | HashGetDigestLen | HashGetDigestAlgorithmId => {
                Ok(self.any_device(&session, request))
            }

            SetPin | Login | Logout | LogoutAll | IsLoggedIn => {
                Ok(self.all_devices(&session, request))
            }

            HashInitialize => Ok(self.start_hash(&session, request)),
            HashGetAlgorithm | HashUpdate => self.hash_step(&session, header, request, false),
            HashFinalize => self.hash_step(&session, header, request, true),

            PkeyOpen => self.open_key(&mut session, header, request),

            PkeyGenerateRsa | PkeyGenerateEc | PkeyGenerateHashsig => {
                self.generate_key(&mut session, func, request)
            }
            PkeyLoad | PkeyImport => self.create_key(&mut session, func, request),

            PkeyClose | PkeyDelete | PkeyGetKeyType | PkeyGetKeyCurve | PkeyGetKeyFlags
            | PkeyGetPublicKeyLen | PkeyGetPublicKey | PkeySign | PkeyVerify
            | PkeySetAttributes | PkeyGetAttributes => {
                self.key_step(&mut session, func, header, request)
            }

            PkeyMatch => self.match_keys(&session, header, request),

            PkeyExport => self.export_key(&mut session, header, request),
            CheckTamper => Ok(self.check_tamper(&session, request)),

            GetHsmState => Ok(self.hsm_state(header)),
            GetIp => Ok(self.ip_address(header)),

            SetRpcDevice | DisableCacheKeygen | EnableCacheKeygen | UseIncomingDeviceUuids
            | UseIncomingMasterUuids => self.session_setting(&mut session, func, header, request),
        }
    }

    /// Pinned device, else the rotation's choice
    fn select_device(&self, session: &Session) -> Option<usize> {
        session.device_override.or_else(|| {
            self.balancer.pick(self.devices.len(), |index| {
                self.devices[index].status().busy_factor() >= 0
            })
        })
    }

    fn forward_selected(&self, session: &Session, request: &[u8], then: Continuation) -> Action {
        match self.select_device(session) {
            Some(device) => Action::forward(request.to_vec(), device, then),
            None => Action::Forward {
                request: request.to_vec(),
                targets: Vec::new(),
                then,
            },
        }
    }

    // =========================================================================
    // Stateless and replicated calls
    // =========================================================================

    fn any_device(&self, session: &Session, request: &[u8]) -> Action {
        self.forward_selected(session, request, Continuation::PassThrough)
    }

    fn all_devices(&self, session: &Session, request: &[u8]) -> Action {
        let targets = match session.device_override {
            Some(device) => vec![device],
            None => (0..self.devices.len()).collect(),
        };
        Action::Forward {
            request: request.to_vec(),
            targets,
            then: Continuation::AllDevices,
        }
    }

    // =========================================================================
    // Hashing
    // =========================================================================

    fn start_hash(&self, session: &Session, request: &[u8]) -> Action {
        match self.select_device(session) {
            Some(device) => {
                Action::forward(request.to_vec(), device, Continuation::StartHash { device })
            }
            None => Action::Forward {
                request: request.to_vec(),
                targets: Vec::new(),
                then: Continuation::PassThrough,
            },
        }
    }

    fn hash_step(
        &self,
        session: &Session,
        header: PacketHeader,
        request: &[u8],
        finalize: bool,
    ) -> Result<Action> {
        let hash_handle = read_u32_at(request, BODY_OFFSET)?;
        let Some(&device) = session.hash_bindings.get(&hash_handle) else {
            debug!(hash_handle, "Hash handle not bound to a device");
            return Ok(reject(header, HalError::BadArguments));
        };

        let then = if finalize {
            Continuation::EndHash { hash_handle }
        } else {
            Continuation::PassThrough
        };
        Ok(Action::forward(request.to_vec(), device, then))
    }

    // =========================================================================
    // Keys
    // =========================================================================

    fn open_key(&self, session: &mut Session, header: PacketHeader, request: &[u8]) -> Result<Action> {
        let mut r = XdrReader::new(request);
        r.get_u32()?;
        r.get_u32()?;
        let pkcs11_session = r.get_u32()?;
        let uuid = uuid_from_wire(r.get_opaque()?)?;

        if session.incoming_device_uuids {
            let Some(device) = session.device_override else {
                return Ok(reject(header, HalError::Impossible));
            };
            session.last_key_device = Some(device);
            return Ok(Action::forward(
                request.to_vec(),
                device,
                Continuation::OpenKey {
                    device,
                    device_key: uuid,
                },
            ));
        }

        let holders = self.cache.devices_holding(&uuid);
        let chosen = match session.device_override {
            Some(device) => holders.get(&device).map(|key| (device, *key)),
            None => holders
                .iter()
                .find(|(index, _)| {
                    self.devices
                        .get(**index)
                        .is_some_and(|d| d.status().busy_factor() >= 0)
                })
                .or_else(|| holders.iter().next())
                .map(|(index, key)| (*index, *key)),
        };

        let Some((device, device_key)) = chosen else {
            debug!(%uuid, "Key not in cache");
            return Ok(reject(header, HalError::KeyNotFound));
        };

        session.last_key_device = Some(device);
        Ok(Action::forward(
            pkey_open_request(header.handle, pkcs11_session, &device_key),
            device,
            Continuation::OpenKey { device, device_key },
        ))
    }

    fn generate_key(&self, session: &mut Session, func: RpcFunc, request: &[u8]) -> Result<Action> {
        let offset = keygen_flag_offset(func, request)?;
        let mut flags = read_u32_at(request, offset)?;

        let mut forwarded = request.to_vec();
        let usage = key_flags::USAGE_KEYENCIPHERMENT | key_flags::USAGE_DATAENCIPHERMENT;
        if session.exportable_private_keys && flags & usage == 0 {
            flags |= key_flags::EXPORTABLE;
            write_u32_at(&mut forwarded, offset, flags)?;
        }

        let key_type = match func {
            RpcFunc::PkeyGenerateRsa => KeyType::RsaPrivate,
            RpcFunc::PkeyGenerateEc => KeyType::EcPrivate,
            _ => KeyType::HashsigPrivate,
        };
        session.last_key_type = key_type;

        Ok(self.forward_created_key(session, forwarded, key_type, flags))
    }

    /// PKEY_LOAD and PKEY_IMPORT
    fn create_key(&self, session: &mut Session, func: RpcFunc, request: &[u8]) -> Result<Action> {
        let mut r = XdrReader::new(request);
        r.get_u32()?;
        r.get_u32()?;
        r.get_u32()?;
        if func == RpcFunc::PkeyImport {
            r.get_u32()?;
            r.get_opaque()?;
        }
        r.get_opaque()?;
        let flags = r.get_u32()?;

        // a load after keygen is taken to be that key's public half
        let key_type = if session.last_key_type.is_private() && flags & key_flags::PUBLIC != 0 {
            session.last_key_type.public_variant()
        } else {
            session.last_key_type
        };
        session.last_key_type = key_type;

        Ok(self.forward_created_key(session, request.to_vec(), key_type, flags))
    }

    fn forward_created_key(&self, session: &mut Session, request: Vec<u8>, key_type: KeyType, flags: u32) -> Action {
        match self.select_device(session) {
            Some(device) => {
                session.last_key_device = Some(device);
                Action::forward(
                    request,
                    device,
                    Continuation::CreateKey {
                        device,
                        key_type,
                        flags,
                    },
                )
            }
            None => Action::Forward {
                request,
                targets: Vec::new(),
                then: Continuation::PassThrough,
            },
        }
    }

    /// Calls addressed by an open key handle
    fn key_step(
        &self,
        session: &mut Session,
        func: RpcFunc,
        header: PacketHeader,
        request: &[u8],
    ) -> Result<Action> {
        let key_handle = read_u32_at(request, BODY_OFFSET)?;
        let Some(binding) = session.key_bindings.get(&key_handle).copied() else {
            debug!(key_handle, code = ?func, "Key handle not bound to a device");
            return Ok(reject(header, HalError::BadArguments));
        };

        session.last_key_device = Some(binding.device);
        let then = match func {
            RpcFunc::PkeyClose | RpcFunc::PkeyDelete => Continuation::CloseKey {
                key_handle,
                device: binding.device,
                device_key: binding.device_key,
                delete: func == RpcFunc::PkeyDelete,
            },
            _ => Continuation::PassThrough,
        };
        Ok(Action::forward(request.to_vec(), binding.device, then))
    }

    fn match_keys(&self, session: &Session, header: PacketHeader, request: &[u8]) -> Result<Action> {
        let mut parsed = KeyMatchRequest::parse(request)?;

        if session.incoming_device_uuids {
            return Ok(match session.device_override {
                Some(device) => Action::forward(request.to_vec(), device, Continuation::PassThrough),
                None => reject(header, HalError::Impossible),
            });
        }

        let start = if parsed.previous.is_nil() {
            session.device_override.unwrap_or(0)
        } else {
            let holders = self.cache.devices_holding(&parsed.previous);
            let located = match session.device_override {
                Some(device) => holders.get(&device).map(|key| (device, *key)),
                None => holders.iter().next().map(|(index, key)| (*index, *key)),
            };
            let Some((device, device_key)) = located else {
                debug!(previous = %parsed.previous, "Match continuation key not in cache");
                return Ok(reject(header, HalError::KeyNotFound));
            };
            parsed.previous = device_key;
            device
        };

        if start >= self.devices.len() {
            return Ok(reject(header, HalError::Forbidden));
        }

        let wanted = parsed.result_max;
        Ok(Action::forward(
            parsed.encode(header.handle),
            start,
            Continuation::Match(MatchProgress {
                request: parsed,
                device: start,
                wanted,
                found: Vec::new(),
            }),
        ))
    }

    fn export_key(&self, session: &mut Session, header: PacketHeader, request: &[u8]) -> Result<Action> {
        if session.from_untrusted && !self.settings.key_export() {
            return Ok(reject(header, HalError::Forbidden));
        }

        let key_handle = read_u32_at(request, BODY_OFFSET)?;
        let device = session
            .device_override
            .or_else(|| session.key_bindings.get(&key_handle).map(|b| b.device))
            .or(session.last_key_device);

        Ok(match device {
            Some(device) => Action::forward(request.to_vec(), device, Continuation::PassThrough),
            None => reject(header, HalError::BadArguments),
        })
    }

    fn check_tamper(&self, session: &Session, request: &[u8]) -> Action {
        match session.device_override.or(session.last_key_device) {
            Some(device) => Action::forward(request.to_vec(), device, Continuation::PassThrough),
            None => self.any_device(session, request),
        }
    }

    // =========================================================================
    // Answered locally
    // =========================================================================

    fn hsm_state(&self, header: PacketHeader) -> Action {
        let mut w = ok_reply_writer(header.code, header.handle);
        w.put_u32(self.devices.len() as u32);
        for device in &self.devices {
            w.put_opaque(device.state_description().as_bytes());
        }
        Action::Reply(w.finish())
    }

    fn ip_address(&self, header: PacketHeader) -> Action {
        let mut w = ok_reply_writer(header.code, header.handle);
        w.put_opaque(self.settings.advertised_ip().as_bytes());
        Action::Reply(w.finish())
    }

    fn session_setting(
        &self,
        session: &mut Session,
        func: RpcFunc,
        header: PacketHeader,
        request: &[u8],
    ) -> Result<Action> {
        if session.from_untrusted {
            return Ok(reject(header, HalError::Forbidden));
        }

        match func {
            RpcFunc::SetRpcDevice => {
                let index = read_u32_at(request, BODY_OFFSET)?;
                if index == AUTO_SELECT_DEVICE {
                    session.device_override = None;
                } else if (index as usize) < self.devices.len() {
                    session.device_override = Some(index as usize);
                } else {
                    return Ok(reject(header, HalError::BadArguments));
                }
            }
            RpcFunc::DisableCacheKeygen => session.cache_generated_keys = false,
            RpcFunc::EnableCacheKeygen => session.cache_generated_keys = true,
            RpcFunc::UseIncomingDeviceUuids => session.incoming_device_uuids = true,
            RpcFunc::UseIncomingMasterUuids => session.incoming_device_uuids = false,
            other => {
                return Err(HsmError::Internal(format!("{:?} is not a session setting", other)));
            }
        }

        debug!(handle = %format!("0x{:x}", session.handle), code = ?func, "Session setting changed");
        Ok(ok(header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lockout_reply_shape() {
        let header = PacketHeader { code: 3, handle: 9 };
        let Action::Reply(reply) = reject(header, HalError::Forbidden) else {
            panic!("expected a local reply");
        };
        assert_eq!(reply, error_reply(3, 9, 26));
    }
}
