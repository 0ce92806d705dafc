//! Connection handshake — runs once per socket before any frame flows.
//!
//! The client opens with `[u32 len][u32 magic][advertised address]`, where the
//! address is the client's own listening endpoint. The server validates it,
//! answers with a bare `[u32 magic]`, and from then on both sides speak
//! frames. Bytes that arrive behind the handshake block are handed back so
//! the frame decoder can start from them.
//!
//! [`Handshake`] is the sans-IO state machine; [`client_handshake`] and
//! [`server_handshake`] drive it over an async stream with an optional
//! timeout.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::address::{encoded_len, read_address, write_address};
use crate::error::HandshakeError;

/// Opens every handshake block. Distinct from the frame magic.
pub const HANDSHAKE_MAGIC: u32 = 0x0FA4_5A99;

/// Magic plus the largest (IPv6) address.
const MAX_BLOCK_LEN: u32 = 4 + 4 + 16 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingPeerBytes,
    Validating,
    Success,
    Failure,
}

/// What a successful handshake learned from the peer's block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Server side: the client's advertised listening address.
    Advertised(SocketAddr),
    /// Client side: the server acknowledged with the protocol magic.
    Acknowledged,
}

#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
}

impl Handshake {
    pub fn client() -> Self {
        Self::new(HandshakeRole::Client)
    }

    pub fn server() -> Self {
        Self::new(HandshakeRole::Server)
    }

    fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            state: HandshakeState::AwaitingPeerBytes,
        }
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, HandshakeState::Success | HandshakeState::Failure)
    }

    /// The block a client writes as soon as its socket is connected.
    pub fn greeting(advertised: &SocketAddr) -> BytesMut {
        let block_len = 4 + encoded_len(advertised);
        let mut buf = BytesMut::with_capacity(4 + block_len);
        buf.put_u32(block_len as u32);
        buf.put_u32(HANDSHAKE_MAGIC);
        write_address(&mut buf, advertised);
        buf
    }

    /// The server's acknowledgement.
    pub fn reply() -> [u8; 4] {
        HANDSHAKE_MAGIC.to_be_bytes()
    }

    /// Consume the peer's block from the front of `buf` if it is complete.
    ///
    /// Returns `Ok(None)` while more bytes are needed. Anything after the
    /// block is left in `buf`. Once the handshake has completed, further
    /// calls return `Ok(None)` and touch nothing.
    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<Option<HandshakeOutcome>, HandshakeError> {
        if self.is_complete() {
            return Ok(None);
        }

        let parsed = match self.role {
            HandshakeRole::Client => self.take_reply(buf),
            HandshakeRole::Server => self.take_greeting(buf),
        };

        match parsed {
            Ok(None) => Ok(None),
            Ok(Some(outcome)) => {
                self.state = HandshakeState::Success;
                Ok(Some(outcome))
            }
            Err(e) => {
                self.state = HandshakeState::Failure;
                Err(e)
            }
        }
    }

    /// Mark the handshake failed. Returns `false` if it had already
    /// completed, so a failure is only ever signalled once.
    pub fn fail(&mut self) -> bool {
        if self.is_complete() {
            return false;
        }
        self.state = HandshakeState::Failure;
        true
    }

    fn take_reply(&mut self, buf: &mut BytesMut) -> Result<Option<HandshakeOutcome>, HandshakeError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        self.state = HandshakeState::Validating;
        let magic = buf.get_u32();
        if magic != HANDSHAKE_MAGIC {
            return Err(HandshakeError::BadMagic(magic));
        }
        Ok(Some(HandshakeOutcome::Acknowledged))
    }

    fn take_greeting(&mut self, buf: &mut BytesMut) -> Result<Option<HandshakeOutcome>, HandshakeError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[..4]);
        let block_len = u32::from_be_bytes(len_bytes);
        if !(4..=MAX_BLOCK_LEN).contains(&block_len) {
            return Err(HandshakeError::Length(block_len));
        }
        if buf.len() < 4 + block_len as usize {
            return Ok(None);
        }

        self.state = HandshakeState::Validating;
        buf.advance(4);
        let mut block = buf.split_to(block_len as usize);
        let magic = block.get_u32();
        if magic != HANDSHAKE_MAGIC {
            return Err(HandshakeError::BadMagic(magic));
        }
        let advertised = read_address(&mut block)?;
        if block.has_remaining() {
            return Err(HandshakeError::Length(block_len));
        }
        Ok(Some(HandshakeOutcome::Advertised(advertised)))
    }
}

/// Run the client side: send the greeting, wait for the acknowledgement.
///
/// Returns any bytes read past the acknowledgement.
pub async fn client_handshake<S>(
    stream: &mut S,
    advertised: SocketAddr,
    timeout: Option<Duration>,
) -> Result<BytesMut, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::client();
    let result = within(timeout, async {
        stream.write_all(&Handshake::greeting(&advertised)).await?;
        stream.flush().await?;
        read_outcome(stream, &mut handshake).await
    })
    .await;

    settle(&mut handshake, result).map(|(_, leftover)| leftover)
}

/// Run the server side up to validation: read and check the client's block.
///
/// The caller registers the advertised address and then acknowledges with
/// [`send_reply`] before any frame is written.
pub async fn server_handshake<S>(
    stream: &mut S,
    timeout: Option<Duration>,
) -> Result<(SocketAddr, BytesMut), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut handshake = Handshake::server();
    let result = within(timeout, read_outcome(stream, &mut handshake)).await;

    match settle(&mut handshake, result)? {
        (HandshakeOutcome::Advertised(peer), leftover) => Ok((peer, leftover)),
        (HandshakeOutcome::Acknowledged, _) => Err(HandshakeError::Length(0)),
    }
}

pub async fn send_reply<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<(), HandshakeError> {
    stream.write_all(&Handshake::reply()).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_outcome<S: AsyncRead + Unpin>(
    stream: &mut S,
    handshake: &mut Handshake,
) -> Result<(HandshakeOutcome, BytesMut), HandshakeError> {
    let mut buf = BytesMut::with_capacity(64);
    loop {
        if let Some(outcome) = handshake.feed(&mut buf)? {
            return Ok((outcome, buf));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::PeerClosed);
        }
    }
}

async fn within<T>(
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T, HandshakeError>>,
) -> Result<T, HandshakeError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| HandshakeError::Timeout(limit))?,
        None => fut.await,
    }
}

fn settle<T>(
    handshake: &mut Handshake,
    result: Result<T, HandshakeError>,
) -> Result<T, HandshakeError> {
    if let Err(e) = &result {
        if handshake.fail() {
            debug!("{:?} handshake failed: {e}", handshake.role());
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
