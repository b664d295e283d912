//! In-process datagram network. Each address owns one FIFO mailbox; sends to
//! an address nobody listens on vanish, the way UDP would drop them.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use super::{SendOutcome, Transport};
use crate::common::messages::{Envelope, Message};

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    mailboxes: Arc<Mutex<HashMap<SocketAddr, UnboundedSender<Envelope>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint at `addr`, replacing any previous one.
    pub fn endpoint(&self, addr: SocketAddr) -> Arc<MemoryEndpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(addr, tx);
        Arc::new(MemoryEndpoint {
            addr,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        })
    }

    /// Detach `addr`; later sends to it are lost.
    pub fn disconnect(&self, addr: SocketAddr) {
        self.mailboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&addr);
    }

    fn is_attached(&self, addr: SocketAddr) -> bool {
        self.mailboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&addr)
    }

    fn post(&self, receiver: SocketAddr, envelope: Envelope) {
        let mailboxes = self
            .mailboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = mailboxes.get(&receiver) {
            let _ = tx.send(envelope);
        }
    }
}

pub struct MemoryEndpoint {
    addr: SocketAddr,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<UnboundedReceiver<Envelope>>,
}

#[async_trait]
impl Transport for MemoryEndpoint {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, receiver: SocketAddr, payload: &Message) -> Result<SendOutcome> {
        self.network
            .post(receiver, Envelope::new(payload.clone(), self.addr));
        Ok(SendOutcome::Sent)
    }

    async fn blocking_receive(&self) -> Result<Envelope> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow!("memory endpoint {} disconnected", self.addr))
    }

    fn non_blocking_receive(&self) -> Result<Option<Envelope>> {
        let mut inbox = match self.inbox.try_lock() {
            Ok(inbox) => inbox,
            // A blocking receiver owns the mailbox right now.
            Err(_) => return Ok(None),
        };
        match inbox.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(anyhow!("memory endpoint {} disconnected", self.addr))
            }
        }
    }

    fn is_closed(&self) -> bool {
        !self.network.is_attached(self.addr)
    }
}
