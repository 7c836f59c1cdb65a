//! Length-prefixed framing over a byte stream, optionally sealed.
//!
//! Every frame is a 4-byte big-endian length followed by the payload. A
//! [`Channel`] owns one stream and, once a handshake has completed, the
//! [`SessionCipher`] that seals outgoing and opens incoming frames.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::TransportError;
use crate::security::SessionCipher;

/// Largest frame either side will send or accept.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the stream between
/// frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
        Err(e) => Err(e.into()),
    }
}

/// A framed connection, plain or sealed.
#[derive(Debug)]
pub struct Channel<S = TcpStream> {
    stream: S,
    cipher: Option<SessionCipher>,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn plain(stream: S) -> Self {
        Self {
            stream,
            cipher: None,
        }
    }

    pub fn sealed(stream: S, cipher: SessionCipher) -> Self {
        Self {
            stream,
            cipher: Some(cipher),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.cipher.is_some()
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        match self.cipher.as_mut() {
            Some(cipher) => {
                let sealed = cipher.seal(payload)?;
                write_frame(&mut self.stream, &sealed).await
            }
            None => write_frame(&mut self.stream, payload).await,
        }
    }

    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(frame) = read_frame(&mut self.stream).await? else {
            return Ok(None);
        };
        match self.cipher.as_mut() {
            Some(cipher) => cipher.open(&frame).map(Some),
            None => Ok(Some(frame)),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frames_preserve_boundaries() {
        let (mut a, mut b) = duplex(1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        write_frame(&mut a, b"third frame").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"third frame");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn truncated_payload_is_a_closed_connection() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn plain_channels_exchange_messages() {
        let (a, b) = duplex(1024);
        let mut left = Channel::plain(a);
        let mut right = Channel::plain(b);
        assert!(!left.is_sealed());

        left.send(b"ping").await.unwrap();
        assert_eq!(right.recv().await.unwrap().unwrap(), b"ping");
        right.send(b"pong").await.unwrap();
        assert_eq!(left.recv().await.unwrap().unwrap(), b"pong");
    }
}
