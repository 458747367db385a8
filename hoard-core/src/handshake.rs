//! Session handshake: hello encoding, key schedule and key confirmation.
//!
//! Both sides send a fixed-size [`Hello`] carrying their static and ephemeral X25519 keys.
//! Session keys mix the static-static and ephemeral-ephemeral secrets with a transcript
//! hash over both hellos, so only holders of the two static secrets end up with matching keys.
//! Each side then proves it holds the keys by sending the encrypted transcript
//! ([`confirmation`]). The host does all I/O; this module only builds and checks bytes.

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::identity::{decrypt_wire, encrypt_wire, DeviceId, Keypair, PublicKey};
use crate::protocol::PROTOCOL_VERSION;

/// version + device_id + static key + ephemeral key
pub const HELLO_LEN: usize = 1 + 16 + 32 + 32;

/// Nonce used for the confirmation frame; data frames start at 1.
pub const CONFIRM_NONCE: u64 = 0;

/// Which end of the connection we are. The initiator dialed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Handshake hello as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u8,
    pub device_id: DeviceId,
    pub static_key: PublicKey,
    pub ephemeral_key: PublicKey,
}

impl Hello {
    pub fn to_bytes(&self) -> [u8; HELLO_LEN] {
        let mut out = [0u8; HELLO_LEN];
        out[0] = self.version;
        out[1..17].copy_from_slice(self.device_id.as_bytes());
        out[17..49].copy_from_slice(self.static_key.as_bytes());
        out[49..81].copy_from_slice(self.ephemeral_key.as_bytes());
        out
    }

    /// Parse and check a received hello: version must match ours and the device ID must be
    /// derived from the static key.
    pub fn from_bytes(buf: &[u8; HELLO_LEN]) -> Result<Self, HandshakeError> {
        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return Err(HandshakeError::Version {
                ours: PROTOCOL_VERSION,
                theirs: version,
            });
        }
        let mut device_id = [0u8; 16];
        device_id.copy_from_slice(&buf[1..17]);
        let mut static_key = [0u8; 32];
        static_key.copy_from_slice(&buf[17..49]);
        let mut ephemeral_key = [0u8; 32];
        ephemeral_key.copy_from_slice(&buf[49..81]);

        let device_id = DeviceId::from_bytes(device_id);
        if DeviceId::from_public_key(&static_key) != device_id {
            return Err(HandshakeError::ForgedIdentity);
        }
        Ok(Hello {
            version,
            device_id,
            static_key: PublicKey::from_bytes(static_key),
            ephemeral_key: PublicKey::from_bytes(ephemeral_key),
        })
    }
}

/// Directional session keys plus the transcript they were bound to.
pub struct SessionKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
    pub transcript: [u8; 32],
}

/// One side of a handshake in progress. Consumed by [`Handshake::finish`].
pub struct Handshake<'a> {
    keypair: &'a Keypair,
    role: Role,
    ephemeral: EphemeralSecret,
    hello: Hello,
}

impl<'a> Handshake<'a> {
    pub fn new(keypair: &'a Keypair, role: Role) -> Self {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let hello = Hello {
            version: PROTOCOL_VERSION,
            device_id: keypair.device_id(),
            static_key: keypair.public_key().clone(),
            ephemeral_key: PublicKey::from_bytes(X25519PublicKey::from(&ephemeral).to_bytes()),
        };
        Self {
            keypair,
            role,
            ephemeral,
            hello,
        }
    }

    /// Our hello, to be written to the peer.
    pub fn hello(&self) -> &Hello {
        &self.hello
    }

    /// Derive session keys from the peer's (already validated) hello.
    pub fn finish(self, peer: &Hello) -> Result<SessionKeys, HandshakeError> {
        if peer.device_id == self.hello.device_id {
            return Err(HandshakeError::SelfConnect);
        }
        let ss = self.keypair.shared_secret(&peer.static_key);
        let ee = self
            .ephemeral
            .diffie_hellman(&X25519PublicKey::from(*peer.ephemeral_key.as_bytes()))
            .to_bytes();

        let (initiator, responder) = match self.role {
            Role::Initiator => (&self.hello, peer),
            Role::Responder => (peer, &self.hello),
        };
        let mut t = Sha256::new();
        t.update(b"hoard-handshake-v1");
        t.update(initiator.to_bytes());
        t.update(responder.to_bytes());
        let transcript: [u8; 32] = t.finalize().into();

        let i2r = derive_key(b"hoard-i2r", &ss, &ee, &transcript);
        let r2i = derive_key(b"hoard-r2i", &ss, &ee, &transcript);
        let (send, recv) = match self.role {
            Role::Initiator => (i2r, r2i),
            Role::Responder => (r2i, i2r),
        };
        Ok(SessionKeys {
            send,
            recv,
            transcript,
        })
    }
}

fn derive_key(label: &[u8], ss: &[u8; 32], ee: &[u8; 32], transcript: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(ss);
    hasher.update(ee);
    hasher.update(transcript);
    hasher.finalize().into()
}

/// Encrypted transcript proving we derived the same keys. Sent once after the hellos.
pub fn confirmation(keys: &SessionKeys) -> Result<Vec<u8>, HandshakeError> {
    encrypt_wire(&keys.send, CONFIRM_NONCE, &keys.transcript)
        .map_err(|_| HandshakeError::Confirmation)
}

/// Check the peer's confirmation frame.
pub fn verify_confirmation(keys: &SessionKeys, frame: &[u8]) -> Result<(), HandshakeError> {
    let plain =
        decrypt_wire(&keys.recv, CONFIRM_NONCE, frame).map_err(|_| HandshakeError::Confirmation)?;
    if plain.as_slice() != keys.transcript.as_slice() {
        return Err(HandshakeError::Confirmation);
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("protocol version mismatch (ours {ours}, theirs {theirs})")]
    Version { ours: u8, theirs: u8 },
    #[error("device id does not match static key")]
    ForgedIdentity,
    #[error("peer is this node")]
    SelfConnect,
    #[error("key confirmation failed")]
    Confirmation,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_pair(a: &Keypair, b: &Keypair) -> (SessionKeys, SessionKeys) {
        let ha = Handshake::new(a, Role::Initiator);
        let hb = Handshake::new(b, Role::Responder);
        let hello_a = Hello::from_bytes(&ha.hello().to_bytes()).unwrap();
        let hello_b = Hello::from_bytes(&hb.hello().to_bytes()).unwrap();
        (ha.finish(&hello_b).unwrap(), hb.finish(&hello_a).unwrap())
    }

    #[test]
    fn both_sides_agree_on_directional_keys() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        let (ka, kb) = run_pair(&a, &b);
        assert_eq!(ka.send, kb.recv);
        assert_eq!(ka.recv, kb.send);
        assert_ne!(ka.send, ka.recv);
        assert_eq!(ka.transcript, kb.transcript);

        verify_confirmation(&kb, &confirmation(&ka).unwrap()).unwrap();
        verify_confirmation(&ka, &confirmation(&kb).unwrap()).unwrap();
    }

    #[test]
    fn fresh_ephemerals_give_fresh_keys() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        let (k1, _) = run_pair(&a, &b);
        let (k2, _) = run_pair(&a, &b);
        assert_ne!(k1.send, k2.send);
    }

    #[test]
    fn forged_device_id_rejected() {
        let a = Keypair::generate();
        let other = Keypair::generate();
        let mut hello = Handshake::new(&a, Role::Initiator).hello().clone();
        hello.device_id = other.device_id();
        assert!(matches!(
            Hello::from_bytes(&hello.to_bytes()),
            Err(HandshakeError::ForgedIdentity)
        ));
    }

    #[test]
    fn version_mismatch_rejected() {
        let a = Keypair::generate();
        let mut bytes = Handshake::new(&a, Role::Initiator).hello().to_bytes();
        bytes[0] = PROTOCOL_VERSION.wrapping_add(1);
        assert!(matches!(
            Hello::from_bytes(&bytes),
            Err(HandshakeError::Version { .. })
        ));
    }

    #[test]
    fn impostor_fails_confirmation() {
        // Mallory replays Bob's static public key but does not hold Bob's secret.
        let (alice, bob, mallory) = (Keypair::generate(), Keypair::generate(), Keypair::generate());
        let ha = Handshake::new(&alice, Role::Initiator);
        let hm = Handshake::new(&mallory, Role::Responder);
        let mut fake = hm.hello().clone();
        fake.device_id = bob.device_id();
        fake.static_key = bob.public_key().clone();
        let alice_hello = ha.hello().clone();

        let ka = ha.finish(&fake).unwrap();
        let km = hm.finish(&alice_hello).unwrap();
        assert!(matches!(
            verify_confirmation(&ka, &confirmation(&km).unwrap()),
            Err(HandshakeError::Confirmation)
        ));
    }

    #[test]
    fn self_connect_rejected() {
        let a = Keypair::generate();
        let h1 = Handshake::new(&a, Role::Initiator);
        let h2 = Handshake::new(&a, Role::Responder);
        let peer = h2.hello().clone();
        assert!(matches!(h1.finish(&peer), Err(HandshakeError::SelfConnect)));
    }
}
