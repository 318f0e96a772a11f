//! Chunked encryption/decryption driver for the protected payload stream.
//!
//! The payload is processed in fixed 4 MiB chunks, independent of the cipher
//! block size. Each chunk goes through a fresh [`ProtectedStream`] adapter
//! sized to the provider's granularity. For block (ECB-like) modes the final
//! chunk is rounded up to a whole number of cipher blocks with zero fill; the
//! true logical length travels in the payload stream's 8-byte prefix, and the
//! decrypt side bounds its final emit by that prefix so padding never reaches
//! the reconstituted container.

use std::io::{Read, Seek, SeekFrom, Write};

use sealdoc_policy::{protected_stream_block_size, CryptoProvider, ProtectedStream};

use crate::error::DrmError;

/// Chunk size for both directions; a multiple of every supported adapter
/// granularity.
pub const CHUNK_SIZE: u64 = 4 * 1024 * 1024;

const _: () = assert!(CHUNK_SIZE % 4096 == 0 && CHUNK_SIZE % 512 == 0);

/// Encrypt `plaintext_len` bytes from the start of `source` into `dest`.
/// The caller writes the length prefix first.
pub fn encrypt_stream<R, W>(
    provider: &dyn CryptoProvider,
    source: &mut R,
    dest: &mut W,
    plaintext_len: u64,
) -> Result<(), DrmError>
where
    R: Read + Seek,
    W: Write,
{
    let adapter_block = protected_stream_block_size(provider);
    let cipher_block = provider.block_size() as u64;
    let total = if provider.cipher_mode().is_block_mode() {
        plaintext_len.div_ceil(cipher_block) * cipher_block
    } else {
        plaintext_len
    };

    source
        .seek(SeekFrom::Start(0))
        .map_err(|e| DrmError::stream("failed to rewind payload source", e))?;
    let mut buf = vec![0u8; CHUNK_SIZE as usize];
    let mut position = 0u64;
    while position < total {
        let to_process = (total - position).min(CHUNK_SIZE) as usize;
        // Bytes past the logical end stay zero-filled.
        let available = plaintext_len.saturating_sub(position).min(to_process as u64) as usize;
        source
            .read_exact(&mut buf[..available])
            .map_err(|e| DrmError::stream("failed to read payload source", e))?;
        buf[available..to_process].fill(0);

        let mut stream = ProtectedStream::create(provider, adapter_block);
        stream.write(&buf[..to_process]);
        let ciphertext = stream.flush()?;
        dest.write_all(&ciphertext)
            .map_err(|e| DrmError::stream("failed to write encrypted payload", e))?;
        position += to_process as u64;
    }
    Ok(())
}

/// Decrypt `ciphertext_len` bytes from `source` (positioned past the length
/// prefix) into `dest`, emitting exactly `plaintext_len` logical bytes.
pub fn decrypt_stream<R, W>(
    provider: &dyn CryptoProvider,
    source: &mut R,
    dest: &mut W,
    ciphertext_len: u64,
    plaintext_len: u64,
) -> Result<(), DrmError>
where
    R: Read,
    W: Write,
{
    let adapter_block = protected_stream_block_size(provider);
    let mut buf = vec![0u8; CHUNK_SIZE as usize];
    let mut position = 0u64;
    while position < ciphertext_len {
        let to_process = (ciphertext_len - position).min(CHUNK_SIZE) as usize;
        source
            .read_exact(&mut buf[..to_process])
            .map_err(|e| DrmError::stream("failed to read encrypted payload", e))?;

        let mut stream = ProtectedStream::create(provider, adapter_block);
        stream.write(&buf[..to_process]);
        let plaintext = stream.read()?;

        let logical = plaintext_len
            .saturating_sub(position)
            .min(plaintext.len() as u64) as usize;
        dest.write_all(&plaintext[..logical])
            .map_err(|e| DrmError::stream("failed to write decrypted payload", e))?;
        position += to_process as u64;
    }
    dest.flush()
        .map_err(|e| DrmError::stream("failed to flush decrypted payload", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sealdoc_policy::Aes128EcbProvider;
    use std::io::Cursor;

    fn round_trip(payload: &[u8]) -> Vec<u8> {
        let provider = Aes128EcbProvider::new([0x2Au8; 16]);
        let mut ciphertext = Vec::new();
        encrypt_stream(
            &provider,
            &mut Cursor::new(payload.to_vec()),
            &mut ciphertext,
            payload.len() as u64,
        )
        .expect("encrypt");
        assert_eq!(ciphertext.len() % 16, 0);
        assert!(ciphertext.len() as u64 >= payload.len() as u64);

        let mut decrypted = Vec::new();
        decrypt_stream(
            &provider,
            &mut Cursor::new(ciphertext.clone()),
            &mut decrypted,
            ciphertext.len() as u64,
            payload.len() as u64,
        )
        .expect("decrypt");
        decrypted
    }

    #[test]
    fn zero_length_payload() {
        assert_eq!(round_trip(&[]), Vec::<u8>::new());
    }

    #[test]
    fn payload_smaller_than_one_chunk() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 255) as u8).collect();
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn payload_not_a_cipher_block_multiple() {
        let payload = vec![0x5Au8; 1007];
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn payload_spanning_exactly_one_chunk() {
        let payload: Vec<u8> = (0..CHUNK_SIZE).map(|i| (i % 249) as u8).collect();
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn payload_spanning_chunks_with_remainder() {
        let len = CHUNK_SIZE + 4097;
        let payload: Vec<u8> = (0..len).map(|i| (i % 247) as u8).collect();
        assert_eq!(round_trip(&payload), payload);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn arbitrary_small_payloads_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            prop_assert_eq!(round_trip(&payload), payload);
        }
    }
}
