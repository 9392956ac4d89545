//! Datagram media socket with the binary AUTH handshake. AUTH is idempotent
//! on the server, so the client retries with exponential backoff over the
//! unreliable transport.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use pv_wire::{AuthCode, Packet};

/// Wait per attempt: 1 s, 2 s, 4 s.
pub const AUTH_BACKOFF: [Duration; 3] =
    [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];

pub struct VoiceSocket {
    socket: UdpSocket,
}

impl VoiceSocket {
    pub async fn connect(server: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.context("bind media socket")?;
        socket.connect(server).await.context("connect media socket")?;
        Ok(Self { socket })
    }

    /// Present the control-channel secret; returns the server's sample rate.
    pub async fn authenticate(&self, player: Uuid, secret: &str) -> Result<u32> {
        let auth = Packet::Auth { player, secret: secret.to_string() }.encode();
        for (attempt, wait) in AUTH_BACKOFF.iter().enumerate() {
            self.socket.send(&auth).await.context("send media auth")?;
            match timeout(*wait, self.await_ack()).await {
                Ok(result) => return result,
                Err(_) => {
                    warn!(attempt, "media auth unanswered, retrying");
                }
            }
        }
        bail!("media auth timed out after {} attempts", AUTH_BACKOFF.len())
    }

    async fn await_ack(&self) -> Result<u32> {
        let mut buf = vec![0u8; 2048];
        loop {
            let n = self.socket.recv(&mut buf).await.context("recv media auth ack")?;
            match Packet::decode(&buf[..n]) {
                Ok(Packet::AuthAck { code: AuthCode::Accepted, sample_rate }) => {
                    return Ok(sample_rate)
                }
                Ok(Packet::AuthAck { code, .. }) => bail!("media auth rejected: {code:?}"),
                Ok(_) | Err(_) => {
                    debug!("non-ack datagram during media auth");
                }
            }
        }
    }

    pub async fn send_frame(&self, frame: Bytes) -> Result<()> {
        self.socket.send(&frame).await.context("send media frame")?;
        Ok(())
    }

    pub async fn recv_frame(&self) -> Result<Bytes> {
        let mut buf = vec![0u8; 2048];
        let n = self.socket.recv(&mut buf).await.context("recv media frame")?;
        Ok(Bytes::copy_from_slice(&buf[..n]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The server drops the first AUTH; the retry succeeds.
    #[tokio::test]
    async fn auth_retries_after_loss() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let player = Uuid::new_v4();

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            // Swallow the first attempt.
            let _ = server.recv_from(&mut buf).await.unwrap();
            // Ack the second.
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert!(matches!(Packet::decode(&buf[..n]), Ok(Packet::Auth { .. })));
            let ack = Packet::AuthAck { code: AuthCode::Accepted, sample_rate: 24_000 }.encode();
            server.send_to(&ack, from).await.unwrap();
        });

        let voice = VoiceSocket::connect(server_addr).await.unwrap();
        let rate = voice.authenticate(player, "secret").await.unwrap();
        assert_eq!(rate, 24_000);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn auth_rejection_is_fatal() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let ack =
                Packet::AuthAck { code: AuthCode::InvalidCredentials, sample_rate: 0 }.encode();
            server.send_to(&ack, from).await.unwrap();
        });

        let voice = VoiceSocket::connect(server_addr).await.unwrap();
        let err = voice.authenticate(Uuid::new_v4(), "bad").await.unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }
}
