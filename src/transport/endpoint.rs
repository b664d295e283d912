//! # UDP Endpoint
//!
//! Plain datagram transport: one JSON frame per UDP packet, no
//! acknowledgements, no ordering guarantees.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use super::frame::{Frame, MAX_DATAGRAM};
use super::{SendOutcome, Transport};
use crate::common::messages::{Envelope, Message};

pub struct Endpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl Endpoint {
    /// Bind a UDP socket.
    ///
    /// # Example
    /// ```ignore
    /// let endpoint = Endpoint::bind("127.0.0.1:0".parse()?).await?;
    /// ```
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        debug!("📡 Endpoint bound on {}", local_addr);
        Ok(Self { socket, local_addr })
    }

    pub(crate) async fn send_frame(&self, receiver: SocketAddr, frame: &Frame) -> Result<()> {
        let bytes = frame.to_bytes()?;
        self.socket.send_to(&bytes, receiver).await?;
        Ok(())
    }

    pub(crate) fn try_send_frame(&self, receiver: SocketAddr, frame: &Frame) -> Result<()> {
        let bytes = frame.to_bytes()?;
        self.socket.try_send_to(&bytes, receiver)?;
        Ok(())
    }

    /// Wait for the next decodable frame. Undecodable datagrams are skipped.
    pub(crate) async fn recv_frame(&self) -> Result<(Frame, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, sender) = self.socket.recv_from(&mut buf).await?;
            match Frame::from_bytes(&buf[..len]) {
                Ok(frame) => return Ok((frame, sender)),
                Err(e) => warn!("⚠️  Dropping undecodable datagram from {}: {}", sender, e),
            }
        }
    }

    /// Next decodable frame already queued on the socket, if any.
    pub(crate) fn try_recv_frame(&self) -> Result<Option<(Frame, SocketAddr)>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, sender)) => match Frame::from_bytes(&buf[..len]) {
                    Ok(frame) => return Ok(Some((frame, sender))),
                    Err(e) => warn!("⚠️  Dropping undecodable datagram from {}: {}", sender, e),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn surface(frame: Frame, sender: SocketAddr) -> Option<Envelope> {
        match frame {
            Frame::Plain { message } => Some(Envelope::new(message, sender)),
            other => {
                warn!(
                    "⚠️  Plain endpoint ignoring {} frame from {} (peer runs the secure transport?)",
                    frame_name(&other),
                    sender
                );
                None
            }
        }
    }
}

pub(crate) fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Plain { .. } => "plain",
        Frame::KeyExchange { .. } => "key_exchange",
        Frame::Sealed { .. } => "sealed",
    }
}

#[async_trait]
impl Transport for Endpoint {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, receiver: SocketAddr, payload: &Message) -> Result<SendOutcome> {
        self.send_frame(
            receiver,
            &Frame::Plain {
                message: payload.clone(),
            },
        )
        .await?;
        Ok(SendOutcome::Sent)
    }

    async fn blocking_receive(&self) -> Result<Envelope> {
        loop {
            let (frame, sender) = self.recv_frame().await?;
            if let Some(envelope) = Self::surface(frame, sender) {
                return Ok(envelope);
            }
        }
    }

    fn non_blocking_receive(&self) -> Result<Option<Envelope>> {
        while let Some((frame, sender)) = self.try_recv_frame()? {
            if let Some(envelope) = Self::surface(frame, sender) {
                return Ok(Some(envelope));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn plain_round_trip_over_loopback() {
        let a = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        assert!(b.non_blocking_receive().unwrap().is_none());

        let outcome = a.send(b.local_addr(), &Message::Token).await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);

        let envelope = tokio::time::timeout(Duration::from_secs(2), b.blocking_receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.payload, Message::Token);
        assert_eq!(envelope.sender, a.local_addr());
    }

    #[tokio::test]
    async fn garbage_datagrams_are_skipped() {
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        raw.send_to(b"definitely not json", b.local_addr()).await.unwrap();
        let frame = Frame::Plain {
            message: Message::Shutdown,
        };
        raw.send_to(&frame.to_bytes().unwrap(), b.local_addr())
            .await
            .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(2), b.blocking_receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.payload, Message::Shutdown);
    }
}
