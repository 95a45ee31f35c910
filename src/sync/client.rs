//! Typed HAL calls issued by the synchronizer straight to one device

use uuid::Uuid;

use crate::device::DeviceSession;
use crate::protocol::packets::{
    generate_rsa_request, get_public_key_request, login_request, ok_payload, pkey_export_request,
    pkey_handle_request, pkey_import_request, pkey_load_request, pkey_open_request, uuid_from_wire,
};
use crate::protocol::{HalUser, KeyMatchRequest, KeyType, RpcFunc, XdrReader};
use crate::types::{HsmError, Result};

/// HAL session used for everything the synchronizer does
const SESSION: u32 = 0;

const DER_MAX: u32 = 4096;
const PKCS8_MAX: u32 = 8192;
const KEK_MAX: u32 = 2048;
const MATCH_PAGE: u32 = 64;

pub struct DeviceClient<'a> {
    device: &'a DeviceSession,
    handle: u32,
}

impl<'a> DeviceClient<'a> {
    pub fn new(device: &'a DeviceSession, handle: u32) -> Self {
        Self { device, handle }
    }

    pub fn index(&self) -> usize {
        self.device.index()
    }

    async fn call<T>(
        &self,
        request: Vec<u8>,
        parse: impl FnOnce(&mut XdrReader<'_>) -> Result<T>,
    ) -> Result<T> {
        let reply = self.device.exchange(request).await?;
        let mut payload = ok_payload(&reply)?;
        parse(&mut payload)
    }

    fn key_result(r: &mut XdrReader<'_>) -> Result<(u32, Uuid)> {
        let pkey = r.get_u32()?;
        let uuid = uuid_from_wire(r.get_opaque()?)?;
        Ok((pkey, uuid))
    }

    pub async fn login(&self, user: HalUser, pin: &[u8]) -> Result<()> {
        self.call(login_request(self.handle, user, pin), |_| Ok(())).await
    }

    /// One page of a key search
    pub async fn match_page(&self, request: &KeyMatchRequest) -> Result<(u32, Vec<Uuid>)> {
        self.call(request.encode(self.handle), |r| {
            let state = r.get_u32()?;
            let count = r.get_u32()?;
            let mut uuids = Vec::with_capacity(count.min(request.result_max) as usize);
            for _ in 0..count {
                uuids.push(uuid_from_wire(r.get_opaque()?)?);
            }
            Ok((state, uuids))
        })
        .await
    }

    /// Every key matching `mask`/`flags`, following pagination to the end
    pub async fn match_all(&self, key_type: KeyType, mask: u32, flags: u32) -> Result<Vec<Uuid>> {
        let mut request = KeyMatchRequest::all(SESSION, MATCH_PAGE);
        request.key_type = key_type.into();
        request.mask = mask;
        request.flags = flags;

        let mut found = Vec::new();
        loop {
            let (state, page) = self.match_page(&request).await?;
            let Some(last) = page.last().copied() else {
                break;
            };
            if request.previous == last {
                return Err(HsmError::Sync(format!(
                    "device {} repeated key {} while paging",
                    self.index(),
                    last
                )));
            }
            found.extend(page);
            request.previous = last;
            request.state = state;
        }
        Ok(found)
    }

    pub async fn open(&self, uuid: &Uuid) -> Result<u32> {
        self.call(pkey_open_request(self.handle, SESSION, uuid), |r| r.get_u32())
            .await
    }

    pub async fn close(&self, pkey: u32) -> Result<()> {
        self.call(pkey_handle_request(RpcFunc::PkeyClose, self.handle, pkey), |_| Ok(()))
            .await
    }

    pub async fn delete(&self, pkey: u32) -> Result<()> {
        self.call(pkey_handle_request(RpcFunc::PkeyDelete, self.handle, pkey), |_| Ok(()))
            .await
    }

    pub async fn key_type(&self, pkey: u32) -> Result<KeyType> {
        let code = self
            .call(pkey_handle_request(RpcFunc::PkeyGetKeyType, self.handle, pkey), |r| r.get_u32())
            .await?;
        KeyType::from_code(code)
            .ok_or_else(|| HsmError::Sync(format!("device reported unknown key type {}", code)))
    }

    pub async fn key_flags(&self, pkey: u32) -> Result<u32> {
        self.call(pkey_handle_request(RpcFunc::PkeyGetKeyFlags, self.handle, pkey), |r| r.get_u32())
            .await
    }

    pub async fn public_key(&self, pkey: u32) -> Result<Vec<u8>> {
        self.call(get_public_key_request(self.handle, pkey, DER_MAX), |r| {
            Ok(r.get_opaque()?.to_vec())
        })
        .await
    }

    /// Open `uuid` just long enough to read its type and flags
    pub async fn describe_key(&self, uuid: &Uuid) -> Result<(KeyType, u32)> {
        let pkey = self.open(uuid).await?;
        let described = async {
            let key_type = self.key_type(pkey).await?;
            let flags = self.key_flags(pkey).await?;
            Ok::<_, HsmError>((key_type, flags))
        }
        .await;
        self.close_quietly(pkey).await;
        described
    }

    pub async fn load(&self, der: &[u8], flags: u32) -> Result<(u32, Uuid)> {
        self.call(pkey_load_request(self.handle, SESSION, der, flags), Self::key_result)
            .await
    }

    pub async fn generate_rsa(&self, key_len: u32, exponent: &[u8], flags: u32) -> Result<(u32, Uuid)> {
        self.call(
            generate_rsa_request(self.handle, SESSION, key_len, exponent, flags),
            Self::key_result,
        )
        .await
    }

    /// Wrapped private key and its key-encryption key
    pub async fn export(&self, pkey: u32, kekek: u32) -> Result<(Vec<u8>, Vec<u8>)> {
        self.call(
            pkey_export_request(self.handle, pkey, kekek, PKCS8_MAX, KEK_MAX),
            |r| {
                let pkcs8 = r.get_opaque()?.to_vec();
                let kek = r.get_opaque()?.to_vec();
                Ok((pkcs8, kek))
            },
        )
        .await
    }

    pub async fn import(&self, kekek: u32, pkcs8: &[u8], kek: &[u8], flags: u32) -> Result<(u32, Uuid)> {
        self.call(
            pkey_import_request(self.handle, SESSION, kekek, pkcs8, kek, flags),
            Self::key_result,
        )
        .await
    }

    pub async fn close_quietly(&self, pkey: u32) {
        if let Err(e) = self.close(pkey).await {
            tracing::debug!(device = self.index(), pkey, "Closing key handle failed: {}", e);
        }
    }
}
