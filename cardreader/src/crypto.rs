//! Crypto API the host installs for sealing data bound for the reader.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("crypto operation failed")]
pub struct CryptoError;

/// Encrypts payloads for the reader's secure element
///
/// The algorithm lives with the host (secure element or whitebox); this
/// library only hands over bytes and forwards the result. `whitebox_key` is
/// whatever the secure session was provisioned with before init, if anything.
pub trait CryptoApi {
    fn seal(&self, whitebox_key: Option<&[u8]>, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}
