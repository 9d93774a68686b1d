use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Maximum payload a length-prefixed TCP/TLS frame may carry (RFC 1035 §4.2.2).
pub const MAX_TCP_PAYLOAD: usize = 65535;

/// UDP receive buffer sized generously above common path MTUs.
pub const UDP_RECV_BUF: usize = 4096;

/// Conservative default response size before EDNS0 bumps it up.
pub const DEFAULT_UDP_RESPONSE_SIZE: usize = 512;

/// Reads one 2-byte-BE-length-prefixed DNS message from a TCP/TLS stream.
///
/// Rejects a declared length of zero as malformed framing.
pub async fn read_tcp_framed(read_half: &mut OwnedReadHalf) -> Result<Bytes> {
    let mut len_buf = [0u8; 2];
    read_half
        .read_exact(&mut len_buf)
        .await
        .context("read tcp frame length")?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 {
        bail!("zero-length tcp dns frame");
    }
    let mut body = BytesMut::zeroed(len);
    read_half
        .read_exact(&mut body)
        .await
        .context("read tcp frame body")?;
    Ok(body.freeze())
}

/// Writes one length-prefixed DNS message to a TCP/TLS stream.
pub async fn write_tcp_framed(write_half: &mut OwnedWriteHalf, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_TCP_PAYLOAD {
        bail!("tcp dns payload too large: {} bytes", payload.len());
    }
    let len = (payload.len() as u16).to_be_bytes();
    write_half.write_all(&len).await?;
    write_half.write_all(payload).await?;
    Ok(())
}

/// Generic framed read/write over any AsyncRead/AsyncWrite pair (used by the
/// DoT transport, which wraps a TLS stream rather than a raw TcpStream half).
pub mod generic {
    use super::*;
    use tokio::io::{AsyncRead, AsyncWrite};

    pub async fn read_framed<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
        let mut len_buf = [0u8; 2];
        reader.read_exact(&mut len_buf).await.context("read frame length")?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            bail!("zero-length framed dns message");
        }
        let mut body = BytesMut::zeroed(len);
        reader.read_exact(&mut body).await.context("read frame body")?;
        Ok(body.freeze())
    }

    pub async fn write_framed<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_TCP_PAYLOAD {
            bail!("framed dns payload too large: {} bytes", payload.len());
        }
        let len = (payload.len() as u16).to_be_bytes();
        writer.write_all(&len).await?;
        writer.write_all(payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_framed_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut cread, mut cwrite) = tokio::io::split(client);
        let (mut sread, mut swrite) = tokio::io::split(server);

        let payload = b"hello dns".to_vec();
        let writer = tokio::spawn(async move {
            generic::write_framed(&mut cwrite, &payload).await.unwrap();
        });
        let got = generic::read_framed(&mut sread).await.unwrap();
        writer.await.unwrap();
        assert_eq!(&got[..], b"hello dns");

        // keep handles alive
        drop(cread);
        drop(swrite);
    }

    #[tokio::test]
    async fn zero_length_frame_rejected() {
        let (client, server) = tokio::io::duplex(64);
        let (_cread, mut cwrite) = tokio::io::split(client);
        let (mut sread, _swrite) = tokio::io::split(server);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = cwrite.write_all(&[0u8, 0u8]).await;
        });
        let res = generic::read_framed(&mut sread).await;
        assert!(res.is_err());
    }
}
