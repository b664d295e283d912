//! # Secure Endpoint
//!
//! Confidentiality layer over the UDP [`Endpoint`]. Before the first
//! application payload to a peer, both sides run a one-round X25519 exchange
//! and derive an AES-256-GCM key with HKDF-SHA256. Until a key exists the
//! payload is *not* sent: the key exchange goes out instead and the caller is
//! told [`SendOutcome::Deferred`].
//!
//! ## Handshake
//!
//! ```text
//! A -> B  KeyExchange { pub_a, reply: false }   (A keeps its private key pending)
//! B -> A  KeyExchange { pub_b, reply: true }    (B derives the key immediately)
//! A                                             (A derives on the reply)
//! A -> B  Sealed { nonce, ciphertext }
//! ```
//!
//! Key exchange frames are consumed here and never surfaced to the caller.
//! A frame that fails to decrypt is dropped; the peer's key stays usable.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use super::endpoint::{frame_name, Endpoint};
use super::frame::Frame;
use super::{SendOutcome, Transport};
use crate::common::messages::{Envelope, Message};

const KDF_SALT: &[u8] = b"tank-ring/v1";
const KDF_INFO: &[&[u8]] = &[b"aead key"];

// ============================================================================
// KEY TABLE
// ============================================================================

/// Agreed key for one peer.
struct PeerKey {
    key: LessSafeKey,
    /// Public key the peer used, to recognise a retransmitted initiation.
    peer_public: Vec<u8>,
    /// Our half of the exchange, replayed if the peer asks again.
    our_public: Vec<u8>,
}

/// Exchange we initiated and are waiting on.
struct Pending {
    private: EphemeralPrivateKey,
    public: Vec<u8>,
}

#[derive(Default)]
struct KeyTable {
    established: HashMap<SocketAddr, PeerKey>,
    pending: HashMap<SocketAddr, Pending>,
}

/// What to do with one incoming frame.
enum Absorbed {
    Deliver(Envelope),
    Reply(Frame),
    Drop,
}

// ============================================================================
// SECURE ENDPOINT
// ============================================================================

pub struct SecureEndpoint {
    inner: Endpoint,
    keys: Mutex<KeyTable>,
    rng: SystemRandom,
}

impl SecureEndpoint {
    pub fn new(inner: Endpoint) -> Self {
        Self {
            inner,
            keys: Mutex::new(KeyTable::default()),
            rng: SystemRandom::new(),
        }
    }

    fn keys(&self) -> MutexGuard<'_, KeyTable> {
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn generate(&self) -> Result<(EphemeralPrivateKey, Vec<u8>)> {
        let private = EphemeralPrivateKey::generate(&X25519, &self.rng)
            .map_err(|_| anyhow!("failed to generate ephemeral key"))?;
        let public = private
            .compute_public_key()
            .map_err(|_| anyhow!("failed to compute public key"))?
            .as_ref()
            .to_vec();
        Ok((private, public))
    }

    /// Send our public key to `peer`, reusing a pending one if we already
    /// started an exchange.
    async fn initiate(&self, peer: SocketAddr) -> Result<()> {
        let public_key = {
            let mut keys = self.keys();
            match keys.pending.get(&peer) {
                Some(pending) => pending.public.clone(),
                None => {
                    let (private, public) = self.generate()?;
                    keys.pending.insert(
                        peer,
                        Pending {
                            private,
                            public: public.clone(),
                        },
                    );
                    public
                }
            }
        };

        debug!("🔑 Sending key exchange to {}", peer);
        self.inner
            .send_frame(
                peer,
                &Frame::KeyExchange {
                    public_key,
                    reply: false,
                },
            )
            .await
    }

    fn seal(&self, key: &LessSafeKey, payload: &Message) -> Result<Frame> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| anyhow!("failed to generate nonce"))?;

        let mut in_out = payload.to_bytes()?;
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("failed to seal payload"))?;

        Ok(Frame::Sealed {
            nonce: nonce.to_vec(),
            ciphertext: in_out,
        })
    }

    /// Process one frame against the key table.
    fn absorb(&self, frame: Frame, sender: SocketAddr) -> Result<Absorbed> {
        match frame {
            Frame::KeyExchange {
                public_key,
                reply: false,
            } => {
                let mut keys = self.keys();

                if let Some(known) = keys.established.get(&sender) {
                    if known.peer_public == public_key {
                        // Our reply got lost; answer with the same key again.
                        return Ok(Absorbed::Reply(Frame::KeyExchange {
                            public_key: known.our_public.clone(),
                            reply: true,
                        }));
                    }
                }

                if let Some(pending) = keys.pending.remove(&sender) {
                    // Both sides initiated; each completes with its own key.
                    let key = derive_key(pending.private, &public_key)?;
                    keys.established.insert(
                        sender,
                        PeerKey {
                            key,
                            peer_public: public_key,
                            our_public: pending.public,
                        },
                    );
                    info!("🔐 Key agreed with {} (crossed initiation)", sender);
                    return Ok(Absorbed::Drop);
                }

                let (private, our_public) = self.generate()?;
                let key = derive_key(private, &public_key)?;
                if keys.established.contains_key(&sender) {
                    info!("🔄 Peer {} presented a new key, re-keying", sender);
                }
                keys.established.insert(
                    sender,
                    PeerKey {
                        key,
                        peer_public: public_key,
                        our_public: our_public.clone(),
                    },
                );
                info!("🔐 Key agreed with {}", sender);
                Ok(Absorbed::Reply(Frame::KeyExchange {
                    public_key: our_public,
                    reply: true,
                }))
            }

            Frame::KeyExchange {
                public_key,
                reply: true,
            } => {
                let mut keys = self.keys();
                match keys.pending.remove(&sender) {
                    Some(pending) => {
                        let key = derive_key(pending.private, &public_key)?;
                        keys.established.insert(
                            sender,
                            PeerKey {
                                key,
                                peer_public: public_key,
                                our_public: pending.public,
                            },
                        );
                        info!("🔐 Key agreed with {}", sender);
                    }
                    None => debug!("Ignoring unsolicited key exchange reply from {}", sender),
                }
                Ok(Absorbed::Drop)
            }

            Frame::Sealed { nonce, ciphertext } => {
                let keys = self.keys();
                let peer = keys
                    .established
                    .get(&sender)
                    .ok_or_else(|| anyhow!("sealed frame from {} without an agreed key", sender))?;
                let message = open(&peer.key, &nonce, ciphertext)?;
                Ok(Absorbed::Deliver(Envelope::new(message, sender)))
            }

            Frame::Plain { message } => {
                warn!(
                    "⚠️  Unencrypted {} from {} passed through",
                    message.kind(),
                    sender
                );
                Ok(Absorbed::Deliver(Envelope::new(message, sender)))
            }
        }
    }
}

fn derive_key(private: EphemeralPrivateKey, peer_public: &[u8]) -> Result<LessSafeKey> {
    let peer = UnparsedPublicKey::new(&X25519, peer_public);
    let unbound = agreement::agree_ephemeral(private, &peer, |shared| {
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, KDF_SALT).extract(shared);
        let okm = prk.expand(KDF_INFO, &aead::AES_256_GCM);
        okm.map(UnboundKey::from)
    })
    .map_err(|_| anyhow!("key agreement failed"))?
    .map_err(|_| anyhow!("key derivation failed"))?;
    Ok(LessSafeKey::new(unbound))
}

fn open(key: &LessSafeKey, nonce: &[u8], ciphertext: Vec<u8>) -> Result<Message> {
    let nonce =
        Nonce::try_assume_unique_for_key(nonce).map_err(|_| anyhow!("malformed nonce"))?;
    let mut in_out = ciphertext;
    let plain = key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| anyhow!("authentication failed"))?;
    Message::from_bytes(plain)
}

#[async_trait]
impl Transport for SecureEndpoint {
    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    async fn send(&self, receiver: SocketAddr, payload: &Message) -> Result<SendOutcome> {
        let sealed = {
            let keys = self.keys();
            match keys.established.get(&receiver) {
                Some(peer) => Some(self.seal(&peer.key, payload)?),
                None => None,
            }
        };

        match sealed {
            Some(frame) => {
                self.inner.send_frame(receiver, &frame).await?;
                Ok(SendOutcome::Sent)
            }
            None => {
                debug!(
                    "⏸️  {} to {} held back until a key is agreed",
                    payload.kind(),
                    receiver
                );
                self.initiate(receiver).await?;
                Ok(SendOutcome::Deferred)
            }
        }
    }

    async fn blocking_receive(&self) -> Result<Envelope> {
        loop {
            let (frame, sender) = self.inner.recv_frame().await?;
            let name = frame_name(&frame);
            match self.absorb(frame, sender) {
                Ok(Absorbed::Deliver(envelope)) => return Ok(envelope),
                Ok(Absorbed::Reply(reply)) => {
                    if let Err(e) = self.inner.send_frame(sender, &reply).await {
                        warn!("⚠️  Failed to answer key exchange from {}: {}", sender, e);
                    }
                }
                Ok(Absorbed::Drop) => {}
                Err(e) => warn!("⚠️  Discarding {} frame from {}: {}", name, sender, e),
            }
        }
    }

    fn non_blocking_receive(&self) -> Result<Option<Envelope>> {
        while let Some((frame, sender)) = self.inner.try_recv_frame()? {
            let name = frame_name(&frame);
            match self.absorb(frame, sender) {
                Ok(Absorbed::Deliver(envelope)) => return Ok(Some(envelope)),
                Ok(Absorbed::Reply(reply)) => {
                    if let Err(e) = self.inner.try_send_frame(sender, &reply) {
                        warn!("⚠️  Failed to answer key exchange from {}: {}", sender, e);
                    }
                }
                Ok(Absorbed::Drop) => {}
                Err(e) => warn!("⚠️  Discarding {} frame from {}: {}", name, sender, e),
            }
        }
        Ok(None)
    }

    fn is_ready(&self, peer: SocketAddr) -> bool {
        self.keys().established.contains_key(&peer)
    }

    async fn prepare(&self, peer: SocketAddr) -> Result<()> {
        if self.is_ready(peer) {
            return Ok(());
        }
        self.initiate(peer).await
    }
}
