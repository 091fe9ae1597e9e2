//! Skewer - Session secret ring
//!
//! Per-session key material for the daemon and its children: a signing key,
//! a symmetric box secret and the ring password, all held in buffers that
//! are wiped when released. The rest of the daemon treats the ring as an
//! opaque capability handed to children at spawn time.

use std::io::Write;

use parking_lot::Mutex;
use rand::RngCore;
use ulid::Ulid;
use zeroize::Zeroizing;

/// 32 bytes of key material, wiped on drop
pub type Secret = Zeroizing<[u8; 32]>;

#[derive(Debug, thiserror::Error)]
pub enum KringError {
    #[error("no such secret in the ring")]
    NotFound,

    #[error("the ring has been destroyed")]
    Destroyed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Generate a fresh 32-byte secret from the OS entropy source
pub fn new_secret() -> Secret {
    let mut secret = Zeroizing::new([0u8; 32]);
    rand::rngs::OsRng.fill_bytes(secret.as_mut());
    secret
}

/// Session identity and ring password, created once per daemon invocation
pub struct RingCreds {
    pub session_id: Ulid,
    pub secret: Secret,
}

pub fn new_creds() -> RingCreds {
    RingCreds {
        session_id: Ulid::new(),
        secret: new_secret(),
    }
}

/// Session-scoped secret storage with guaranteed zeroisation on release
pub trait Ring: Send + Sync {
    fn new_signature_pubkey(&self) -> Result<Secret, KringError>;
    fn get_signature_pubkey(&self) -> Result<Secret, KringError>;
    fn delete_signature_pubkey(&self) -> Result<(), KringError>;

    fn new_box_secret(&self) -> Result<Secret, KringError>;
    fn get_box_secret(&self) -> Result<Secret, KringError>;
    fn delete_box_secret(&self) -> Result<(), KringError>;

    /// Serialise the ring password for a child process
    fn write_ring_pass(&self, writer: &mut dyn Write) -> Result<(), KringError>;

    fn session_id(&self) -> Ulid;

    /// Wipe everything; all further operations fail
    fn destroy(&self);
}

struct Slots {
    destroyed: bool,
    pass: Secret,
    signature: Option<Secret>,
    box_secret: Option<Secret>,
}

/// In-memory ring implementation
pub struct MemRing {
    session_id: Ulid,
    slots: Mutex<Slots>,
}

impl MemRing {
    pub fn new(creds: RingCreds) -> Self {
        Self {
            session_id: creds.session_id,
            slots: Mutex::new(Slots {
                destroyed: false,
                pass: creds.secret,
                signature: None,
                box_secret: None,
            }),
        }
    }
}

impl Ring for MemRing {
    fn new_signature_pubkey(&self) -> Result<Secret, KringError> {
        let mut slots = self.slots.lock();
        if slots.destroyed {
            return Err(KringError::Destroyed);
        }
        let secret = new_secret();
        slots.signature = Some(secret.clone());
        Ok(secret)
    }

    fn get_signature_pubkey(&self) -> Result<Secret, KringError> {
        let slots = self.slots.lock();
        if slots.destroyed {
            return Err(KringError::Destroyed);
        }
        slots.signature.clone().ok_or(KringError::NotFound)
    }

    fn delete_signature_pubkey(&self) -> Result<(), KringError> {
        self.slots.lock().signature = None;
        Ok(())
    }

    fn new_box_secret(&self) -> Result<Secret, KringError> {
        let mut slots = self.slots.lock();
        if slots.destroyed {
            return Err(KringError::Destroyed);
        }
        let secret = new_secret();
        slots.box_secret = Some(secret.clone());
        Ok(secret)
    }

    fn get_box_secret(&self) -> Result<Secret, KringError> {
        let slots = self.slots.lock();
        if slots.destroyed {
            return Err(KringError::Destroyed);
        }
        slots.box_secret.clone().ok_or(KringError::NotFound)
    }

    fn delete_box_secret(&self) -> Result<(), KringError> {
        self.slots.lock().box_secret = None;
        Ok(())
    }

    fn write_ring_pass(&self, writer: &mut dyn Write) -> Result<(), KringError> {
        let slots = self.slots.lock();
        if slots.destroyed {
            return Err(KringError::Destroyed);
        }
        writer.write_all(slots.pass.as_ref())?;
        Ok(())
    }

    fn session_id(&self) -> Ulid {
        self.session_id
    }

    fn destroy(&self) {
        let mut slots = self.slots.lock();
        slots.destroyed = true;
        // Zeroizing wipes on drop; overwrite the password in place too
        slots.pass.fill(0);
        slots.signature = None;
        slots.box_secret = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_roundtrip() {
        let ring = MemRing::new(new_creds());

        assert!(matches!(
            ring.get_box_secret(),
            Err(KringError::NotFound)
        ));
        let created = ring.new_box_secret().unwrap();
        let fetched = ring.get_box_secret().unwrap();
        assert_eq!(created.as_ref(), fetched.as_ref());

        ring.delete_box_secret().unwrap();
        assert!(matches!(ring.get_box_secret(), Err(KringError::NotFound)));
    }

    #[test]
    fn ring_pass_is_the_session_secret() {
        let creds = new_creds();
        let expected = creds.secret.clone();
        let session = creds.session_id;
        let ring = MemRing::new(creds);

        let mut out = Vec::new();
        ring.write_ring_pass(&mut out).unwrap();
        assert_eq!(out.as_slice(), expected.as_ref());
        assert_eq!(ring.session_id(), session);
    }

    #[test]
    fn destroyed_ring_refuses_everything() {
        let ring = MemRing::new(new_creds());
        ring.new_signature_pubkey().unwrap();
        ring.destroy();

        assert!(matches!(
            ring.get_signature_pubkey(),
            Err(KringError::Destroyed)
        ));
        assert!(matches!(ring.new_box_secret(), Err(KringError::Destroyed)));
        let mut out = Vec::new();
        assert!(matches!(
            ring.write_ring_pass(&mut out),
            Err(KringError::Destroyed)
        ));
    }

    #[test]
    fn fresh_secrets_differ() {
        assert_ne!(new_secret().as_ref(), new_secret().as_ref());
    }
}
