//! # Payload Transforms
//!
//! Compression and encryption are pluggable strategies handed to the encoder and
//! decoder. The codec only decides *when* to call them, from the header flags.
//!
//! ## Compression
//! - **Lz4**: size-prepended block format, fast
//! - **Zstd**: streaming format, better ratio
//!
//! Decompression enforces an output limit so a small frame cannot expand into an
//! unbounded allocation.
//!
//! ## Encryption
//! - [`NoopEncryptor`]: identity transform, for deployments that encrypt at the
//!   transport layer or not at all
//! - [`ChaChaEncryptor`]: XChaCha20-Poly1305 with a random 24-byte nonce
//!   prepended to each ciphertext

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Maximum output size for decompression
const MAX_DECOMPRESSION_SIZE: usize = MAX_PAYLOAD_SIZE;

/// Size of the XChaCha20 nonce prefix
const NONCE_SIZE: usize = 24;

/// Compression strategy invoked by the codec pipeline.
pub trait BinaryPacketCompressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn uncompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Encryption strategy invoked by the codec pipeline.
pub trait BinaryPacketEncryptor: Send + Sync {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Algorithms available for the built-in compressor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    None,
    Lz4,
    Zstd,
}

impl CompressionKind {
    /// Build the compressor for this kind, `None` when compression is disabled.
    pub fn compressor(self) -> Option<CompressionCodec> {
        match self {
            CompressionKind::None => None,
            kind => Some(CompressionCodec { kind }),
        }
    }
}

/// Built-in compressor backed by lz4 or zstd.
#[derive(Debug, Clone, Copy)]
pub struct CompressionCodec {
    kind: CompressionKind,
}

impl CompressionCodec {
    pub fn lz4() -> Self {
        Self {
            kind: CompressionKind::Lz4,
        }
    }

    pub fn zstd() -> Self {
        Self {
            kind: CompressionKind::Zstd,
        }
    }

    pub fn kind(&self) -> CompressionKind {
        self.kind
    }
}

impl BinaryPacketCompressor for CompressionCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.kind {
            CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            CompressionKind::Zstd => {
                let mut out = Vec::new();
                zstd::stream::copy_encode(data, &mut out, 1)
                    .map_err(|_| ProtocolError::CompressionFailure)?;
                Ok(out)
            }
            CompressionKind::None => Ok(data.to_vec()),
        }
    }

    fn uncompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.kind {
            CompressionKind::Lz4 => {
                if data.len() < 4 {
                    return Err(ProtocolError::DecompressionFailure);
                }

                // Reject the claimed size before lz4_flex allocates for it
                let claimed_size =
                    u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
                if claimed_size > MAX_DECOMPRESSION_SIZE {
                    return Err(ProtocolError::DecompressionFailure);
                }

                lz4_flex::decompress_size_prepended(data)
                    .map_err(|_| ProtocolError::DecompressionFailure)
            }
            CompressionKind::Zstd => {
                let mut out = Vec::new();
                let mut reader = zstd::stream::Decoder::new(data)
                    .map_err(|_| ProtocolError::DecompressionFailure)?;

                let mut buffer = [0u8; 8192];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(n) => {
                            out.extend_from_slice(&buffer[..n]);
                            if out.len() > MAX_DECOMPRESSION_SIZE {
                                return Err(ProtocolError::DecompressionFailure);
                            }
                        }
                        Err(_) => return Err(ProtocolError::DecompressionFailure),
                    }
                }
                Ok(out)
            }
            CompressionKind::None => Ok(data.to_vec()),
        }
    }
}

/// Identity encryptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEncryptor;

impl BinaryPacketEncryptor for NoopEncryptor {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// XChaCha20-Poly1305 encryptor with a pre-shared 32-byte key.
pub struct ChaChaEncryptor {
    cipher: XChaCha20Poly1305,
}

impl ChaChaEncryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Parse a 64-character hex key, as stored in configuration.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() != 64 {
            return Err(ProtocolError::ConfigError(format!(
                "Encryption key must be 64 hex characters, got {}",
                hex.len()
            )));
        }

        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| {
                ProtocolError::ConfigError("Encryption key is not valid hex".to_string())
            })?;
        }
        Ok(Self::new(&key))
    }

    /// Generate a key from the OS random source.
    pub fn generate_key() -> Result<[u8; 32]> {
        let mut key = [0u8; 32];
        getrandom::fill(&mut key)
            .map_err(|e| ProtocolError::Custom(format!("Random source failure: {e}")))?;
        Ok(key)
    }
}

impl BinaryPacketEncryptor for ChaChaEncryptor {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce).map_err(|_| ProtocolError::EncryptionFailure)?;

        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), data)
            .map_err(|_| ProtocolError::EncryptionFailure)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}
