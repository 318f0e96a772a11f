//! Byte-exact stream/file copies with size-limit validation, the payload
//! length header, and the scoped temporary workspace.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use tempfile::NamedTempFile;

use sealdoc_policy::{CryptoOptions, PolicyCreationOptions};

use crate::error::DrmError;

/// Encryption-path input ceiling.
pub const MAX_FILE_SIZE_FOR_ENCRYPT: u64 = 1 << 30;
/// Decryption-path input ceiling.
pub const MAX_FILE_SIZE_FOR_DECRYPT: u64 = 3 << 30;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Measure a seekable stream, enforce the given ceiling, and rewind it.
pub fn validate_stream_size<S: Seek>(stream: &mut S, max_size: u64) -> Result<u64, DrmError> {
    let size = stream
        .seek(SeekFrom::End(0))
        .map_err(|e| DrmError::stream("failed to measure input stream", e))?;
    stream
        .seek(SeekFrom::Start(0))
        .map_err(|e| DrmError::stream("failed to rewind input stream", e))?;
    if size > max_size {
        return Err(DrmError::NotSupported(format!(
            "the file is too large ({size} bytes); the limit is 1 GiB for encryption and \
             3 GiB for decryption"
        )));
    }
    Ok(size)
}

/// Copy exactly `len` bytes from the start of `reader` into `file`.
pub fn copy_stream_to_file<R: Read + Seek>(
    reader: &mut R,
    file: &mut File,
    len: u64,
) -> Result<(), DrmError> {
    reader
        .seek(SeekFrom::Start(0))
        .map_err(|e| DrmError::stream("failed to rewind input stream", e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| DrmError::stream("failed to rewind scratch file", e))?;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let take = remaining.min(COPY_BUF_SIZE as u64) as usize;
        reader
            .read_exact(&mut buf[..take])
            .map_err(|e| DrmError::stream("failed to read input stream", e))?;
        file.write_all(&buf[..take])
            .map_err(|e| DrmError::stream("failed to write scratch file", e))?;
        remaining -= take as u64;
    }
    file.flush()
        .map_err(|e| DrmError::stream("failed to flush scratch file", e))?;
    Ok(())
}

/// Copy a whole scratch file to the caller's output stream.
pub fn copy_file_to_writer<W: Write>(file: &mut File, writer: &mut W) -> Result<(), DrmError> {
    file.seek(SeekFrom::Start(0))
        .map_err(|e| DrmError::stream("failed to rewind scratch file", e))?;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| DrmError::stream("failed to read scratch file", e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| DrmError::stream("failed to write output stream", e))?;
    }
    writer
        .flush()
        .map_err(|e| DrmError::stream("failed to flush output stream", e))?;
    Ok(())
}

/// Write the 8-byte little-endian plaintext-length prefix of the encrypted
/// payload stream.
pub fn write_stream_header<W: Write>(stream: &mut W, content_length: u64) -> Result<(), DrmError> {
    stream
        .write_all(&content_length.to_le_bytes())
        .map_err(|e| DrmError::stream("failed to write payload header", e))
}

/// Read the 8-byte little-endian plaintext-length prefix.
pub fn read_stream_header<R: Read>(stream: &mut R) -> Result<u64, DrmError> {
    let mut buf = [0u8; 8];
    stream
        .read_exact(&mut buf)
        .map_err(|e| DrmError::stream("failed to read payload header", e))?;
    Ok(u64::from_le_bytes(buf))
}

/// Resolve protection options into license-creation flags. Only the legacy
/// block-cipher mode is supported; any other requested mode fails before any
/// I/O occurs.
pub fn resolve_creation_options(
    allow_audited_extraction: bool,
    crypto_options: CryptoOptions,
) -> Result<PolicyCreationOptions, DrmError> {
    match crypto_options {
        CryptoOptions::Auto | CryptoOptions::Aes128Ecb => Ok(PolicyCreationOptions {
            allow_audited_extraction,
            prefer_legacy_algorithms: true,
        }),
        CryptoOptions::Aes128Cbc4k => Err(DrmError::NotSupported(
            "CBC encryption for compound documents is not yet supported".into(),
        )),
    }
}

/// Three scratch files owned by one protect/unprotect call: the input copy,
/// the output build, and the protected-payload build. Deleted on drop on
/// every exit path; deletion failures are tolerated silently.
pub struct TempWorkspace {
    pub input: NamedTempFile,
    pub output: NamedTempFile,
    pub drm: NamedTempFile,
}

impl TempWorkspace {
    pub fn create(label: &str) -> Result<Self, DrmError> {
        Ok(TempWorkspace {
            input: scratch_file(label)?,
            output: scratch_file("output")?,
            drm: scratch_file("drm")?,
        })
    }
}

/// A single named scratch file; `label` seeds the file-name prefix.
pub fn scratch_file(label: &str) -> Result<NamedTempFile, DrmError> {
    let mut prefix: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(16)
        .collect();
    if prefix.is_empty() {
        prefix.push_str("sealdoc");
    }
    tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile()
        .map_err(|e| DrmError::stream("failed to create scratch file", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn size_at_ceiling_passes_and_over_fails() {
        let mut at = Cursor::new(vec![0u8; 1024]);
        assert_eq!(validate_stream_size(&mut at, 1024).expect("at ceiling"), 1024);
        assert_eq!(at.position(), 0);

        let mut over = Cursor::new(vec![0u8; 1025]);
        let err = validate_stream_size(&mut over, 1024).expect_err("over ceiling");
        assert!(matches!(err, DrmError::NotSupported(_)));
    }

    #[test]
    fn header_round_trips() {
        let mut buf = Vec::new();
        write_stream_header(&mut buf, 0x0123_4567_89AB_CDEF).expect("write");
        assert_eq!(buf.len(), 8);
        let value = read_stream_header(&mut Cursor::new(&buf)).expect("read");
        assert_eq!(value, 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn cbc_mode_is_rejected_before_io() {
        let err = resolve_creation_options(false, CryptoOptions::Aes128Cbc4k)
            .expect_err("cbc unsupported");
        assert!(matches!(err, DrmError::NotSupported(_)));

        let flags = resolve_creation_options(true, CryptoOptions::Auto).expect("auto");
        assert!(flags.allow_audited_extraction);
        assert!(flags.prefer_legacy_algorithms);
    }

    #[test]
    fn stream_file_copies_are_byte_exact() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut source = Cursor::new(payload.clone());
        let mut scratch = scratch_file("copy").expect("scratch");
        copy_stream_to_file(&mut source, scratch.as_file_mut(), payload.len() as u64)
            .expect("to file");

        let mut sink = Vec::new();
        copy_file_to_writer(scratch.as_file_mut(), &mut sink).expect("to writer");
        assert_eq!(sink, payload);
    }

    #[test]
    fn workspace_files_are_removed_on_drop() {
        let paths = {
            let ws = TempWorkspace::create("report1xls").expect("workspace");
            [
                ws.input.path().to_path_buf(),
                ws.output.path().to_path_buf(),
                ws.drm.path().to_path_buf(),
            ]
        };
        for path in paths {
            assert!(!path.exists(), "scratch file {path:?} should be deleted");
        }
    }
}
