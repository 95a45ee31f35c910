//! One client connection

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::preprocessor::RpcPreprocessor;
use crate::protocol::packets::{error_reply, swap_client_handle, PacketHeader, MIN_PACKET_LEN};
use crate::protocol::slip::{self, SlipDecoder};
use crate::types::Result;

/// Serve `stream` until the client disconnects.
///
/// `untrusted` marks connections that arrived over the network.
pub async fn handle_connection<S>(
    preprocessor: Arc<RpcPreprocessor>,
    stream: S,
    untrusted: bool,
    peer: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if untrusted && preprocessor.is_rpc_locked() {
        if let Err(e) = refuse_locked(&preprocessor, stream).await {
            debug!(%peer, "Refusing locked connection failed: {}", e);
        }
        info!(%peer, "Connection refused, HSM locked");
        return;
    }

    let handle = preprocessor.create_session(untrusted);
    info!(%peer, handle = %format!("0x{:x}", handle), untrusted, "Client connected");

    if let Err(e) = serve(&preprocessor, stream, handle).await {
        warn!(%peer, handle = %format!("0x{:x}", handle), "Connection error: {}", e);
    }

    preprocessor.end_session(handle).await;
    info!(%peer, handle = %format!("0x{:x}", handle), "Client disconnected");
}

async fn serve<S>(preprocessor: &RpcPreprocessor, mut stream: S, handle: u32) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut decoder = SlipDecoder::new();
    let mut buf = vec![0u8; 8192];

    loop {
        while let Some(mut request) = decoder.next_frame() {
            if request.len() < MIN_PACKET_LEN {
                continue;
            }

            let client_handle = swap_client_handle(&mut request, handle)?;
            let mut reply = preprocessor.process(handle, request).await;
            if reply.len() >= MIN_PACKET_LEN {
                swap_client_handle(&mut reply, client_handle)?;
            }

            stream.write_all(&slip::encode(&reply)).await?;
            stream.flush().await?;
        }

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        decoder.extend(&buf[..n]);
    }
}

/// Answer the first request with the lockout status, then hang up
async fn refuse_locked<S>(preprocessor: &RpcPreprocessor, mut stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut decoder = SlipDecoder::new();
    let mut buf = vec![0u8; 1024];

    loop {
        if let Some(request) = decoder.next_frame() {
            if request.len() < MIN_PACKET_LEN {
                continue;
            }
            let header = PacketHeader::parse(&request)?;
            let reply = error_reply(
                header.code,
                header.handle,
                preprocessor.lockout_status().code(),
            );
            stream.write_all(&slip::encode(&reply)).await?;
            stream.flush().await?;
            return Ok(());
        }

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        decoder.extend(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyCache;
    use crate::protocol::packets::ReplyHeader;
    use crate::protocol::{HalError, RpcFunc, XdrWriter};
    use crate::settings::Settings;

    fn preprocessor(masterkey_set: bool) -> Arc<RpcPreprocessor> {
        let cache = Arc::new(KeyCache::new(0));
        cache.set_initialized(true);
        let settings = Arc::new(Settings::new(masterkey_set, false, false, "192.0.2.1"));
        Arc::new(RpcPreprocessor::new(Vec::new(), cache, settings, 2))
    }

    fn request(func: RpcFunc, handle: u32) -> Vec<u8> {
        let mut w = XdrWriter::new();
        w.put_u32(func.code()).put_u32(handle);
        slip::encode(&w.finish())
    }

    async fn read_reply<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
        let mut decoder = SlipDecoder::new();
        let mut buf = [0u8; 256];
        loop {
            if let Some(frame) = decoder.next_frame() {
                return frame;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before a reply");
            decoder.extend(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_client_handle_is_restored() {
        let pre = preprocessor(true);
        pre.unlock_hsm();
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(handle_connection(pre.clone(), server, false, "test".into()));

        client.write_all(&request(RpcFunc::GetIp, 0xabcd)).await.unwrap();
        let reply = read_reply(&mut client).await;
        let header = ReplyHeader::parse(&reply).unwrap();
        assert_eq!(header.handle, 0xabcd);
        assert!(header.is_ok());

        drop(client);
        task.await.unwrap();
        assert_eq!(pre.session_count(), 0);
    }

    #[tokio::test]
    async fn test_locked_untrusted_connection_gets_one_reply() {
        let pre = preprocessor(false);
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(handle_connection(pre.clone(), server, true, "test".into()));

        // runt frames are ignored
        client.write_all(&slip::encode(&[1, 2, 3])).await.unwrap();
        client.write_all(&request(RpcFunc::GetVersion, 7)).await.unwrap();
        let reply = read_reply(&mut client).await;
        let header = ReplyHeader::parse(&reply).unwrap();
        assert_eq!(header.handle, 7);
        assert_eq!(header.status, HalError::MasterkeyNotSet.code());

        task.await.unwrap();
        assert_eq!(pre.session_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_devices_is_forbidden() {
        let pre = preprocessor(true);
        pre.unlock_hsm();
        let (mut client, server) = tokio::io::duplex(1024);
        tokio::spawn(handle_connection(pre, server, true, "test".into()));

        client.write_all(&request(RpcFunc::GetVersion, 1)).await.unwrap();
        let header = ReplyHeader::parse(&read_reply(&mut client).await).unwrap();
        assert_eq!(header.status, HalError::Forbidden.code());
    }
}
