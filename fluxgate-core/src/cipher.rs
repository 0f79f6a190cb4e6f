//! AEAD cipher engine for tunneled payload bytes.
//!
//! Key schedule and chunk framing are wire-compatible with deployed
//! servers: the master key comes from EVP_BytesToKey (MD5) over the
//! credential, per-session subkeys from HKDF-SHA1 with the session salt,
//! and the stream is a sequence of sealed `(length, payload)` chunks with
//! a little-endian counter nonce.

use crate::error::{Error, Result};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type Aes192Gcm = aes_gcm::AesGcm<aes_gcm::aes::Aes192, aes_gcm::aead::generic_array::typenum::U12>;

/// Payload chunks are capped at 16KB - 1 on the wire.
pub const MAX_CHUNK: usize = 0x3fff;

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Supported cipher methods
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    XChaCha20Poly1305,
}

/// The fixed set of supported cipher names, in UI order.
pub const SUPPORTED_CIPHERS: [&str; 5] = [
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
];

impl CipherKind {
    /// Look up a cipher by its configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "aes-128-gcm" => Some(Self::Aes128Gcm),
            "aes-192-gcm" => Some(Self::Aes192Gcm),
            "aes-256-gcm" => Some(Self::Aes256Gcm),
            "chacha20-ietf-poly1305" => Some(Self::ChaCha20Poly1305),
            "xchacha20-ietf-poly1305" => Some(Self::XChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes192Gcm => "aes-192-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
            Self::XChaCha20Poly1305 => "xchacha20-ietf-poly1305",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes192Gcm => 24,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 | Self::XChaCha20Poly1305 => 32,
        }
    }

    /// Session salt length equals the key length.
    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    pub fn nonce_len(&self) -> usize {
        match self {
            Self::XChaCha20Poly1305 => 24,
            _ => 12,
        }
    }

    pub fn tag_len(&self) -> usize {
        16
    }

    /// Generate a fresh random session salt.
    pub fn generate_salt(&self) -> Result<Vec<u8>> {
        let mut salt = vec![0u8; self.salt_len()];
        getrandom::fill(&mut salt)
            .map_err(|e| Error::internal(format!("Failed to generate salt: {}", e)))?;
        Ok(salt)
    }
}

/// Derive the master key from the credential, OpenSSL EVP_BytesToKey style.
fn evp_bytes_to_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::new();
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password.as_bytes());
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

/// Derive the per-session subkey from the credential and session salt.
fn derive_subkey(password: &str, salt: &[u8], key_len: usize) -> Result<Vec<u8>> {
    let master_key = evp_bytes_to_key(password, key_len);

    let hk = Hkdf::<Sha1>::new(Some(salt), &master_key);
    let mut okm = vec![0u8; key_len];
    hk.expand(SUBKEY_INFO, &mut okm)
        .map_err(|e| Error::internal(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

enum AeadInner {
    Aes128Gcm(Aes128Gcm),
    Aes192Gcm(Aes192Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
    XChaCha20Poly1305(XChaCha20Poly1305),
}

/// Per-session, per-direction cipher state.
///
/// Bound 1:1 to one tunnel direction; the nonce counter makes contexts
/// single-use, so they are never shared across sessions.
pub struct CipherContext {
    inner: AeadInner,
    kind: CipherKind,
    counter: u64,
}

impl CipherContext {
    /// Derive a context from the credential and a session-unique salt.
    pub fn new(kind: CipherKind, password: &str, salt: &[u8]) -> Result<Self> {
        if salt.len() != kind.salt_len() {
            return Err(Error::internal(format!(
                "Salt length mismatch: expected {}, got {}",
                kind.salt_len(),
                salt.len()
            )));
        }

        let key = derive_subkey(password, salt, kind.key_len())?;
        let inner = match kind {
            CipherKind::Aes128Gcm => {
                AeadInner::Aes128Gcm(Aes128Gcm::new(GenericArray::from_slice(&key)))
            }
            CipherKind::Aes192Gcm => {
                AeadInner::Aes192Gcm(Aes192Gcm::new(GenericArray::from_slice(&key)))
            }
            CipherKind::Aes256Gcm => {
                AeadInner::Aes256Gcm(Aes256Gcm::new(GenericArray::from_slice(&key)))
            }
            CipherKind::ChaCha20Poly1305 => {
                AeadInner::ChaCha20Poly1305(ChaCha20Poly1305::new(GenericArray::from_slice(&key)))
            }
            CipherKind::XChaCha20Poly1305 => {
                AeadInner::XChaCha20Poly1305(XChaCha20Poly1305::new(GenericArray::from_slice(&key)))
            }
        };

        Ok(Self {
            inner,
            kind,
            counter: 0,
        })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Little-endian counter nonce, advanced on every seal/open.
    fn next_nonce(&mut self) -> [u8; 24] {
        let mut nonce = [0u8; 24];
        nonce[..8].copy_from_slice(&self.counter.to_le_bytes());
        self.counter = self.counter.wrapping_add(1);
        nonce
    }

    /// Encrypt one plaintext block, appending the authentication tag.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let n = &nonce[..self.kind.nonce_len()];
        let sealed = match &self.inner {
            AeadInner::Aes128Gcm(c) => c.encrypt(GenericArray::from_slice(n), plaintext),
            AeadInner::Aes192Gcm(c) => c.encrypt(GenericArray::from_slice(n), plaintext),
            AeadInner::Aes256Gcm(c) => c.encrypt(GenericArray::from_slice(n), plaintext),
            AeadInner::ChaCha20Poly1305(c) => c.encrypt(GenericArray::from_slice(n), plaintext),
            AeadInner::XChaCha20Poly1305(c) => c.encrypt(GenericArray::from_slice(n), plaintext),
        };
        sealed.map_err(|_| Error::internal("AEAD seal failed"))
    }

    /// Decrypt and verify one sealed block. A tag mismatch is an
    /// authentication failure: fatal to the owning session, never retried.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let n = &nonce[..self.kind.nonce_len()];
        let opened = match &self.inner {
            AeadInner::Aes128Gcm(c) => c.decrypt(GenericArray::from_slice(n), ciphertext),
            AeadInner::Aes192Gcm(c) => c.decrypt(GenericArray::from_slice(n), ciphertext),
            AeadInner::Aes256Gcm(c) => c.decrypt(GenericArray::from_slice(n), ciphertext),
            AeadInner::ChaCha20Poly1305(c) => c.decrypt(GenericArray::from_slice(n), ciphertext),
            AeadInner::XChaCha20Poly1305(c) => c.decrypt(GenericArray::from_slice(n), ciphertext),
        };
        opened.map_err(|_| Error::auth("AEAD tag verification failed"))
    }
}

/// Seal and send one chunk: sealed 2-byte length, then sealed payload.
pub async fn write_sealed_chunk<W: AsyncWrite + Unpin>(
    writer: &mut W,
    ctx: &mut CipherContext,
    data: &[u8],
) -> Result<()> {
    let len = data.len();
    if len > MAX_CHUNK {
        return Err(Error::internal("Chunk too large (>16KB)"));
    }

    let len_bytes = (len as u16).to_be_bytes();
    let sealed_len = ctx.seal(&len_bytes)?;
    writer
        .write_all(&sealed_len)
        .await
        .map_err(|e| Error::connect_with_source("Failed to send chunk length", e))?;

    if len > 0 {
        let sealed_data = ctx.seal(data)?;
        writer
            .write_all(&sealed_data)
            .await
            .map_err(|e| Error::connect_with_source("Failed to send chunk payload", e))?;
    }

    Ok(())
}

/// Receive and open one chunk; `None` means clean EOF from the peer.
pub async fn read_sealed_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    ctx: &mut CipherContext,
) -> Result<Option<Vec<u8>>> {
    let tag = ctx.kind().tag_len();

    let mut sealed_len = vec![0u8; 2 + tag];
    match reader.read_exact(&mut sealed_len).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }

    let len_plain = ctx.open(&sealed_len)?;
    if len_plain.len() != 2 {
        return Err(Error::handshake("Invalid chunk length field"));
    }
    let data_len = u16::from_be_bytes([len_plain[0], len_plain[1]]) as usize;
    if data_len == 0 {
        return Ok(None);
    }
    if data_len > MAX_CHUNK {
        return Err(Error::handshake("Chunk length exceeds protocol cap"));
    }

    let mut sealed_data = vec![0u8; data_len + tag];
    reader.read_exact(&mut sealed_data).await.map_err(Error::Io)?;

    let data = ctx.open(&sealed_data)?;
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_lookup() {
        assert_eq!(
            CipherKind::from_name("aes-256-gcm"),
            Some(CipherKind::Aes256Gcm)
        );
        assert_eq!(
            CipherKind::from_name("AES-256-GCM"),
            Some(CipherKind::Aes256Gcm)
        );
        assert_eq!(CipherKind::from_name("rc4-md5"), None);
        for name in SUPPORTED_CIPHERS {
            assert_eq!(CipherKind::from_name(name).unwrap().name(), name);
        }
    }

    #[test]
    fn test_cipher_parameters() {
        assert_eq!(CipherKind::Aes128Gcm.key_len(), 16);
        assert_eq!(CipherKind::Aes192Gcm.key_len(), 24);
        assert_eq!(CipherKind::Aes256Gcm.key_len(), 32);
        assert_eq!(CipherKind::XChaCha20Poly1305.nonce_len(), 24);
        assert_eq!(CipherKind::ChaCha20Poly1305.nonce_len(), 12);
    }

    #[test]
    fn test_evp_bytes_to_key_known_vector() {
        // OpenSSL EVP_BytesToKey("password", no salt, MD5, 16 bytes)
        let key = evp_bytes_to_key("password", 16);
        assert_eq!(
            key,
            [
                0x5f, 0x4d, 0xcc, 0x3b, 0x5a, 0xa7, 0x65, 0xd6, 0x1d, 0x83, 0x27, 0xde, 0xb8,
                0x82, 0xcf, 0x99
            ]
        );
    }

    #[test]
    fn test_seal_open_roundtrip_all_ciphers() {
        for name in SUPPORTED_CIPHERS {
            let kind = CipherKind::from_name(name).unwrap();
            let salt = kind.generate_salt().unwrap();
            let mut enc = CipherContext::new(kind, "secret", &salt).unwrap();
            let mut dec = CipherContext::new(kind, "secret", &salt).unwrap();

            let plaintext = b"the quick brown fox";
            let sealed = enc.seal(plaintext).unwrap();
            assert_eq!(sealed.len(), plaintext.len() + kind.tag_len());
            let opened = dec.open(&sealed).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn test_mismatched_credential_is_auth_failure() {
        let kind = CipherKind::Aes256Gcm;
        let salt = kind.generate_salt().unwrap();
        let mut enc = CipherContext::new(kind, "right", &salt).unwrap();
        let mut dec = CipherContext::new(kind, "wrong", &salt).unwrap();

        let sealed = enc.seal(b"payload").unwrap();
        let err = dec.open(&sealed).unwrap_err();
        assert_eq!(err.code(), "AUTH");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_tampered_ciphertext_is_auth_failure() {
        let kind = CipherKind::ChaCha20Poly1305;
        let salt = kind.generate_salt().unwrap();
        let mut enc = CipherContext::new(kind, "secret", &salt).unwrap();
        let mut dec = CipherContext::new(kind, "secret", &salt).unwrap();

        let mut sealed = enc.seal(b"payload").unwrap();
        sealed[0] ^= 0x01;
        assert_eq!(dec.open(&sealed).unwrap_err().code(), "AUTH");
    }

    #[tokio::test]
    async fn test_chunk_framing_roundtrip() {
        let kind = CipherKind::Aes256Gcm;
        let salt = kind.generate_salt().unwrap();
        let mut enc = CipherContext::new(kind, "secret", &salt).unwrap();
        let mut dec = CipherContext::new(kind, "secret", &salt).unwrap();

        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_sealed_chunk(&mut client, &mut enc, b"hello").await.unwrap();
        write_sealed_chunk(&mut client, &mut enc, b"world").await.unwrap();
        drop(client);

        let first = read_sealed_chunk(&mut server, &mut dec).await.unwrap();
        assert_eq!(first.as_deref(), Some(b"hello".as_slice()));
        let second = read_sealed_chunk(&mut server, &mut dec).await.unwrap();
        assert_eq!(second.as_deref(), Some(b"world".as_slice()));
        let eof = read_sealed_chunk(&mut server, &mut dec).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_oversized_chunk_rejected() {
        let kind = CipherKind::Aes128Gcm;
        let salt = kind.generate_salt().unwrap();
        let mut enc = CipherContext::new(kind, "secret", &salt).unwrap();

        let data = vec![0u8; MAX_CHUNK + 1];
        let mut sink: Vec<u8> = Vec::new();
        assert!(write_sealed_chunk(&mut sink, &mut enc, &data).await.is_err());
        assert!(sink.is_empty());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_cipher() -> impl Strategy<Value = CipherKind> {
        prop_oneof![
            Just(CipherKind::Aes128Gcm),
            Just(CipherKind::Aes192Gcm),
            Just(CipherKind::Aes256Gcm),
            Just(CipherKind::ChaCha20Poly1305),
            Just(CipherKind::XChaCha20Poly1305),
        ]
    }

    fn arb_plaintext() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 1..1024)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// For any plaintext and supported cipher, sealing then opening with
        /// a matching context recovers the original bytes.
        #[test]
        fn prop_seal_open_roundtrip(plaintext in arb_plaintext(), kind in arb_cipher()) {
            let salt = vec![0x42u8; kind.salt_len()];
            let mut enc = CipherContext::new(kind, "pw", &salt).unwrap();
            let mut dec = CipherContext::new(kind, "pw", &salt).unwrap();

            let sealed = enc.seal(&plaintext).unwrap();
            let opened = dec.open(&sealed).unwrap();
            prop_assert_eq!(plaintext, opened);
        }

        /// Sealed output is exactly tag_len longer than the input.
        #[test]
        fn prop_sealed_length(plaintext in arb_plaintext(), kind in arb_cipher()) {
            let salt = vec![0x42u8; kind.salt_len()];
            let mut enc = CipherContext::new(kind, "pw", &salt).unwrap();
            let sealed = enc.seal(&plaintext).unwrap();
            prop_assert_eq!(sealed.len(), plaintext.len() + kind.tag_len());
        }

        /// The advancing nonce makes repeated seals of the same plaintext
        /// produce different ciphertexts.
        #[test]
        fn prop_nonce_advances(plaintext in arb_plaintext(), kind in arb_cipher()) {
            let salt = vec![0x42u8; kind.salt_len()];
            let mut enc = CipherContext::new(kind, "pw", &salt).unwrap();
            let first = enc.seal(&plaintext).unwrap();
            let second = enc.seal(&plaintext).unwrap();
            prop_assert_ne!(first, second);
        }
    }
}
