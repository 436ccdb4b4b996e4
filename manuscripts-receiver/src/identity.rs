//! Receiver identity and the shared-passphrase verifier.
//!
//! The store is written exactly once at startup and read concurrently by
//! every handshake afterwards, so it needs no lock: a `OnceLock` holds the
//! immutable [`ReceiverIdentity`].

use std::{fmt, sync::OnceLock};

use manuscripts_core::{
    Challenge, CoreError, KEY_LEN, KdfParams, NONCE_LEN, PROTOCOL_VERSION, SALT_LEN, compute_proof,
    derive_passphrase_key, proofs_match,
};
use rand::RngCore;
use thiserror::Error;

const MAX_DISPLAY_NAME_CHARS: usize = 64;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity is already configured")]
    AlreadyConfigured,
    #[error("identity has not been configured")]
    NotConfigured,
    #[error("display name must be non-empty and <= 64 chars")]
    InvalidDisplayName,
    #[error(transparent)]
    KeyDerivation(#[from] CoreError),
}

/// Salted slow hash of the passphrase. The plaintext is never retained.
#[derive(Clone, PartialEq, Eq)]
pub struct PassphraseHash {
    pub salt: [u8; SALT_LEN],
    pub key: [u8; KEY_LEN],
    pub kdf: KdfParams,
}

impl fmt::Debug for PassphraseHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassphraseHash")
            .field("salt", &"<redacted>")
            .field("key", &"<redacted>")
            .field("kdf", &self.kdf)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverIdentity {
    pub display_name: String,
    pub passphrase_hash: Option<PassphraseHash>,
    pub protocol_version: u32,
}

impl ReceiverIdentity {
    pub fn requires_passphrase(&self) -> bool {
        self.passphrase_hash.is_some()
    }
}

#[derive(Debug)]
pub struct CredentialStore {
    identity: OnceLock<ReceiverIdentity>,
    kdf: KdfParams,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_kdf(KdfParams::default())
    }

    /// Cheaper Argon2 parameters are only appropriate for tests.
    #[must_use]
    pub fn with_kdf(kdf: KdfParams) -> Self {
        Self {
            identity: OnceLock::new(),
            kdf,
        }
    }

    /// A blank passphrase means none.
    pub fn configure(
        &self,
        display_name: &str,
        passphrase: Option<&str>,
    ) -> Result<(), IdentityError> {
        if self.identity.get().is_some() {
            return Err(IdentityError::AlreadyConfigured);
        }

        let display_name = display_name.trim();
        if display_name.is_empty()
            || display_name.chars().count() > MAX_DISPLAY_NAME_CHARS
            || display_name.chars().any(char::is_control)
        {
            return Err(IdentityError::InvalidDisplayName);
        }

        let passphrase_hash = match passphrase.map(str::trim).filter(|p| !p.is_empty()) {
            Some(passphrase) => {
                let mut salt = [0_u8; SALT_LEN];
                rand::rng().fill_bytes(&mut salt);
                let key = derive_passphrase_key(passphrase, &salt, &self.kdf)?;
                Some(PassphraseHash {
                    salt,
                    key,
                    kdf: self.kdf,
                })
            }
            None => None,
        };

        self.identity
            .set(ReceiverIdentity {
                display_name: display_name.to_owned(),
                passphrase_hash,
                protocol_version: PROTOCOL_VERSION,
            })
            .map_err(|_| IdentityError::AlreadyConfigured)
    }

    pub fn snapshot(&self) -> Result<ReceiverIdentity, IdentityError> {
        self.identity.get().cloned().ok_or(IdentityError::NotConfigured)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.identity.get().map(|id| id.display_name.as_str())
    }

    pub fn requires_passphrase(&self) -> bool {
        self.identity
            .get()
            .is_some_and(ReceiverIdentity::requires_passphrase)
    }

    /// Fresh single-use challenge, or `None` when no passphrase is configured.
    pub fn issue_challenge(&self) -> Option<Challenge> {
        let hash = self.identity.get()?.passphrase_hash.as_ref()?;
        let mut nonce = vec![0_u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        Some(Challenge {
            nonce,
            salt: hash.salt.to_vec(),
            kdf: hash.kdf,
        })
    }

    /// Checks a proof against the stored hash for the given nonce.
    ///
    /// Always true without a passphrase, whatever the proof says.
    /// Always false before `configure`.
    pub fn verify(&self, nonce: &[u8], proof: Option<&[u8]>) -> bool {
        let Some(identity) = self.identity.get() else {
            return false;
        };
        let Some(hash) = identity.passphrase_hash.as_ref() else {
            return true;
        };
        let Some(proof) = proof else {
            return false;
        };
        match compute_proof(&hash.key, nonce) {
            Ok(expected) => proofs_match(&expected, proof),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use manuscripts_core::answer_challenge;

    use super::*;

    fn light_kdf() -> KdfParams {
        KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn configure_twice_fails() {
        let store = CredentialStore::with_kdf(light_kdf());
        store.configure("Room 204", None).unwrap();
        assert!(matches!(
            store.configure("Room 205", None),
            Err(IdentityError::AlreadyConfigured)
        ));
        assert_eq!(store.display_name(), Some("Room 204"));
    }

    #[test]
    fn no_passphrase_always_verifies() {
        let store = CredentialStore::with_kdf(light_kdf());
        store.configure("Room 204", Some("   ")).unwrap();
        assert!(!store.requires_passphrase());
        assert!(store.issue_challenge().is_none());
        assert!(store.verify(b"nonce", None));
        assert!(store.verify(b"nonce", Some(b"garbage")));
    }

    #[test]
    fn correct_proof_verifies_and_wrong_one_does_not() {
        let store = CredentialStore::with_kdf(light_kdf());
        store.configure("Room 204", Some("quill and ink")).unwrap();
        assert!(store.requires_passphrase());

        let challenge = store.issue_challenge().unwrap();
        let good = answer_challenge("quill and ink", &challenge).unwrap();
        let bad = answer_challenge("quill and inc", &challenge).unwrap();

        assert!(store.verify(&challenge.nonce, Some(&good)));
        assert!(!store.verify(&challenge.nonce, Some(&bad)));
        assert!(!store.verify(&challenge.nonce, None));
    }

    #[test]
    fn proof_is_bound_to_its_nonce() {
        let store = CredentialStore::with_kdf(light_kdf());
        store.configure("Room 204", Some("pw")).unwrap();

        let first = store.issue_challenge().unwrap();
        let second = store.issue_challenge().unwrap();
        assert_ne!(first.nonce, second.nonce);

        let proof = answer_challenge("pw", &first).unwrap();
        assert!(!store.verify(&second.nonce, Some(&proof)));
    }

    #[test]
    fn unconfigured_store_rejects_everything() {
        let store = CredentialStore::with_kdf(light_kdf());
        assert!(!store.verify(b"n", None));
        assert!(matches!(store.snapshot(), Err(IdentityError::NotConfigured)));
    }

    #[test]
    fn snapshot_never_exposes_key_in_debug() {
        let store = CredentialStore::with_kdf(light_kdf());
        store.configure("Room 204", Some("pw")).unwrap();
        let rendered = format!("{:?}", store.snapshot().unwrap());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("pw\""));
    }
}
