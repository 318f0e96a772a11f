//! Crypto-provider boundary and the block-based protected stream adapter.
//!
//! A [`CryptoProvider`] performs the actual cipher transforms; the transform
//! engine only drives it with block numbers and aligned byte ranges. The
//! [`ProtectedStream`] adapter splits a flat byte range into provider-sized
//! blocks (512-byte granularity when the provider's native block size is 512,
//! 4096 otherwise) and feeds each block through the provider.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use thiserror::Error;
use zeroize::Zeroizing;

/// Native block size of the AES ciphers used by the legacy mode.
pub const AES_BLOCK_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("input length {len} is not a multiple of the {block_size}-byte cipher block")]
    UnalignedInput { len: usize, block_size: usize },
    #[error("cipher provider failure: {0}")]
    Provider(String),
}

/// Cipher mode a provider operates in. Only [`CipherMode::Ecb`] (the legacy
/// mode) is currently honored by the transform engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Ecb,
    Cbc512,
    Cbc4k,
}

impl CipherMode {
    /// True for ECB-like modes whose input must be padded to whole cipher
    /// blocks by the caller.
    pub fn is_block_mode(self) -> bool {
        matches!(self, CipherMode::Ecb)
    }
}

/// Block cipher transforms, driven synchronously by the transform engine.
pub trait CryptoProvider: Send + Sync {
    fn cipher_mode(&self) -> CipherMode;

    /// Native cipher block size in bytes.
    fn block_size(&self) -> usize;

    /// Encrypt one protected-stream block. `plaintext` length must be a
    /// multiple of [`CryptoProvider::block_size`]; the ciphertext is appended
    /// to `out` and may differ in length from the input for non-ECB modes.
    fn encrypt_block(
        &self,
        block_number: u64,
        plaintext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError>;

    /// Decrypt one protected-stream block, appending plaintext to `out`.
    fn decrypt_block(
        &self,
        block_number: u64,
        ciphertext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError>;
}

/// Granularity of the protected-stream adapter for a given provider: 512 if
/// the provider's native block size is 512, otherwise 4096.
pub fn protected_stream_block_size(provider: &dyn CryptoProvider) -> usize {
    if provider.block_size() == 512 {
        512
    } else {
        4096
    }
}

/// Adapter that maps a flat byte range onto provider blocks.
///
/// Callers buffer bytes with [`ProtectedStream::write`] and then run the
/// terminal operation for their direction: [`ProtectedStream::flush`]
/// encrypts the buffered plaintext, [`ProtectedStream::read`] decrypts the
/// buffered ciphertext. Block numbers restart at zero for every adapter
/// instance; the engine creates one adapter per chunk.
pub struct ProtectedStream<'a> {
    provider: &'a dyn CryptoProvider,
    block_size: usize,
    buffered: Vec<u8>,
}

impl<'a> ProtectedStream<'a> {
    pub fn create(provider: &'a dyn CryptoProvider, block_size: usize) -> Self {
        Self {
            provider,
            block_size,
            buffered: Vec::new(),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.buffered.extend_from_slice(bytes);
    }

    /// Encrypt everything buffered so far and return the ciphertext.
    pub fn flush(self) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::with_capacity(self.buffered.len());
        for (block_number, block) in self.buffered.chunks(self.block_size).enumerate() {
            self.provider
                .encrypt_block(block_number as u64, block, &mut out)?;
        }
        Ok(out)
    }

    /// Decrypt everything buffered so far and return the plaintext.
    pub fn read(self) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::with_capacity(self.buffered.len());
        for (block_number, block) in self.buffered.chunks(self.block_size).enumerate() {
            self.provider
                .decrypt_block(block_number as u64, block, &mut out)?;
        }
        Ok(out)
    }
}

/// AES-128 ECB provider, the legacy cipher mode.
///
/// ECB keeps ciphertext and plaintext the same length, so the engine pads the
/// final chunk to a 16-byte multiple and carries the logical length in the
/// payload stream's size prefix.
pub struct Aes128EcbProvider {
    cipher: Aes128,
}

impl Aes128EcbProvider {
    /// The key copy is wiped on return; only the cipher's schedule remains.
    pub fn new(key: [u8; 16]) -> Self {
        let key = Zeroizing::new(key);
        let cipher = Aes128::new(GenericArray::from_slice(&*key));
        Self { cipher }
    }
}

impl CryptoProvider for Aes128EcbProvider {
    fn cipher_mode(&self) -> CipherMode {
        CipherMode::Ecb
    }

    fn block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn encrypt_block(
        &self,
        _block_number: u64,
        plaintext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        if plaintext.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::UnalignedInput {
                len: plaintext.len(),
                block_size: AES_BLOCK_SIZE,
            });
        }
        for chunk in plaintext.chunks_exact(AES_BLOCK_SIZE) {
            let mut block = GenericArray::clone_from_slice(chunk);
            self.cipher.encrypt_block(&mut block);
            out.extend_from_slice(&block);
        }
        Ok(())
    }

    fn decrypt_block(
        &self,
        _block_number: u64,
        ciphertext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        if ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::UnalignedInput {
                len: ciphertext.len(),
                block_size: AES_BLOCK_SIZE,
            });
        }
        for chunk in ciphertext.chunks_exact(AES_BLOCK_SIZE) {
            let mut block = GenericArray::clone_from_slice(chunk);
            self.cipher.decrypt_block(&mut block);
            out.extend_from_slice(&block);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProvider {
        block_size: usize,
    }

    impl CryptoProvider for FakeProvider {
        fn cipher_mode(&self) -> CipherMode {
            CipherMode::Cbc512
        }

        fn block_size(&self) -> usize {
            self.block_size
        }

        fn encrypt_block(
            &self,
            _block_number: u64,
            plaintext: &[u8],
            out: &mut Vec<u8>,
        ) -> Result<(), CryptoError> {
            out.extend_from_slice(plaintext);
            Ok(())
        }

        fn decrypt_block(
            &self,
            _block_number: u64,
            ciphertext: &[u8],
            out: &mut Vec<u8>,
        ) -> Result<(), CryptoError> {
            out.extend_from_slice(ciphertext);
            Ok(())
        }
    }

    #[test]
    fn adapter_granularity_follows_provider_block_size() {
        assert_eq!(
            protected_stream_block_size(&FakeProvider { block_size: 512 }),
            512
        );
        assert_eq!(
            protected_stream_block_size(&FakeProvider { block_size: 16 }),
            4096
        );
        assert_eq!(
            protected_stream_block_size(&FakeProvider { block_size: 4096 }),
            4096
        );
    }

    #[test]
    fn ecb_round_trips_aligned_input() {
        let provider = Aes128EcbProvider::new([7u8; 16]);
        let plaintext = vec![0xABu8; 64];

        let mut stream = ProtectedStream::create(&provider, 4096);
        stream.write(&plaintext);
        let ciphertext = stream.flush().expect("encrypt");
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_ne!(ciphertext, plaintext);

        let mut stream = ProtectedStream::create(&provider, 4096);
        stream.write(&ciphertext);
        let decrypted = stream.read().expect("decrypt");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn ecb_rejects_unaligned_input() {
        let provider = Aes128EcbProvider::new([7u8; 16]);
        let mut stream = ProtectedStream::create(&provider, 4096);
        stream.write(&[0u8; 17]);
        let err = stream.flush().expect_err("unaligned");
        assert!(matches!(err, CryptoError::UnalignedInput { len: 17, .. }));
    }

    #[test]
    fn ecb_is_deterministic_per_key() {
        let a = Aes128EcbProvider::new([1u8; 16]);
        let b = Aes128EcbProvider::new([2u8; 16]);
        let mut out_a = Vec::new();
        let mut out_b = Vec::new();
        a.encrypt_block(0, &[0u8; 16], &mut out_a).expect("encrypt");
        b.encrypt_block(0, &[0u8; 16], &mut out_b).expect("encrypt");
        assert_ne!(out_a, out_b);
    }
}
