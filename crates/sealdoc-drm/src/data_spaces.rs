//! DataSpaces transform metadata: the records describing which protection
//! transform was applied to the container and the opaque license blob needed
//! to undo it.
//!
//! Layout inside the protected container:
//!
//! ```text
//! \x06DataSpaces\
//!     Version                       version records
//!     DataSpaceMap                  binds \x09DRMContent to \x09DRMDataSpace
//!     DataSpaceInfo\
//!         \x09DRMDataSpace          transform chain (one entry)
//!     TransformInfo\
//!         \x09DRMTransform\
//!             \x06Primary           transform identity + license blob
//! ```
//!
//! Strings are UTF-16LE with a u32 byte-length prefix, padded to a 4-byte
//! boundary. The read path verifies every literal and version pair exactly;
//! a container that fails any check is rejected rather than partially
//! accepted, so a foreign or corrupted container is never misidentified as
//! one produced by this scheme.

use std::io::{Read, Seek, Write};

use cfb::CompoundFile;

use crate::error::{DrmError, OfficeFileReason};

pub const DATA_SPACES_STORAGE: &str = "\u{6}DataSpaces";
pub const DRM_CONTENT_STREAM: &str = "\u{9}DRMContent";

const VERSION_STREAM: &str = "Version";
const DATA_SPACE_MAP_STREAM: &str = "DataSpaceMap";
const DATA_SPACE_INFO_STORAGE: &str = "DataSpaceInfo";
const TRANSFORM_INFO_STORAGE: &str = "TransformInfo";
const DRM_DATA_SPACE: &str = "\u{9}DRMDataSpace";
const DRM_TRANSFORM: &str = "\u{9}DRMTransform";
const PRIMARY_STREAM: &str = "\u{6}Primary";

const VERSION_FEATURE: &str = "Microsoft.Container.DataSpaces";
const DRM_TRANSFORM_CLASS: &str = "{C73DFACD-061F-43B0-8B64-0C620D2A8B50}";
const DRM_TRANSFORM_FEATURE: &str = "Microsoft.Metadata.DRMTransform";

const MAX_STRING_BYTES: u32 = 4096;
const MAX_LICENSE_BYTES: u32 = 16 * 1024 * 1024;

fn version_path() -> String {
    format!("/{DATA_SPACES_STORAGE}/{VERSION_STREAM}")
}

fn data_space_map_path() -> String {
    format!("/{DATA_SPACES_STORAGE}/{DATA_SPACE_MAP_STREAM}")
}

fn drm_data_space_path() -> String {
    format!("/{DATA_SPACES_STORAGE}/{DATA_SPACE_INFO_STORAGE}/{DRM_DATA_SPACE}")
}

fn primary_path() -> String {
    format!("/{DATA_SPACES_STORAGE}/{TRANSFORM_INFO_STORAGE}/{DRM_TRANSFORM}/{PRIMARY_STREAM}")
}

/// Write the full DataSpaces tree into `ole`. Must run before the encrypted
/// payload stream is created.
pub fn write_data_spaces<F: Read + Write + Seek>(
    ole: &mut CompoundFile<F>,
    license: &[u8],
) -> Result<(), DrmError> {
    let create = |e| DrmError::stream("failed to create protection metadata", e);

    ole.create_storage(format!("/{DATA_SPACES_STORAGE}"))
        .map_err(create)?;
    write_stream(ole, &version_path(), &encode_version())?;
    write_stream(ole, &data_space_map_path(), &encode_data_space_map())?;
    ole.create_storage(format!("/{DATA_SPACES_STORAGE}/{DATA_SPACE_INFO_STORAGE}"))
        .map_err(create)?;
    write_stream(ole, &drm_data_space_path(), &encode_drm_data_space())?;
    ole.create_storage(format!("/{DATA_SPACES_STORAGE}/{TRANSFORM_INFO_STORAGE}"))
        .map_err(create)?;
    ole.create_storage(format!(
        "/{DATA_SPACES_STORAGE}/{TRANSFORM_INFO_STORAGE}/{DRM_TRANSFORM}"
    ))
    .map_err(create)?;
    write_stream(ole, &primary_path(), &encode_primary(license))?;
    Ok(())
}

/// Read and verify the DataSpaces tree, returning the license blob.
pub fn read_data_spaces<F: Read + Seek>(ole: &mut CompoundFile<F>) -> Result<Vec<u8>, DrmError> {
    let version = read_stream(ole, &version_path())?;
    decode_version(&version)?;
    let map = read_stream(ole, &data_space_map_path())?;
    decode_data_space_map(&map)?;
    let data_space = read_stream(ole, &drm_data_space_path())?;
    decode_drm_data_space(&data_space)?;
    let primary = read_stream(ole, &primary_path())?;
    decode_primary(&primary)
}

fn write_stream<F: Read + Write + Seek>(
    ole: &mut CompoundFile<F>,
    path: &str,
    content: &[u8],
) -> Result<(), DrmError> {
    let mut stream = ole
        .create_stream(path)
        .map_err(|e| DrmError::stream("failed to create protection metadata", e))?;
    stream
        .write_all(content)
        .map_err(|e| DrmError::stream("failed to write protection metadata", e))
}

fn read_stream<F: Read + Seek>(
    ole: &mut CompoundFile<F>,
    path: &str,
) -> Result<Vec<u8>, DrmError> {
    let mut stream = ole.open_stream(path).map_err(|_| {
        DrmError::office(
            OfficeFileReason::CorruptFile,
            format!("protection metadata stream {path:?} is missing"),
        )
    })?;
    let mut content = Vec::new();
    stream.read_to_end(&mut content).map_err(|_| {
        DrmError::office(
            OfficeFileReason::CorruptFile,
            format!("protection metadata stream {path:?} is unreadable"),
        )
    })?;
    Ok(content)
}

// --- record encoding ---

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// UTF-16LE string with a u32 byte-length prefix, padded to 4 bytes.
fn put_unicode_lp(out: &mut Vec<u8>, value: &str) {
    let units: Vec<u16> = value.encode_utf16().collect();
    put_u32(out, (units.len() * 2) as u32);
    for unit in &units {
        put_u16(out, *unit);
    }
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn unicode_lp_len(value: &str) -> u32 {
    let bytes = value.encode_utf16().count() as u32 * 2;
    4 + bytes + (4 - bytes % 4) % 4
}

fn encode_version() -> Vec<u8> {
    let mut out = Vec::new();
    put_unicode_lp(&mut out, VERSION_FEATURE);
    for _ in 0..3 {
        // reader, updater, writer versions: 1.0 each
        put_u16(&mut out, 1);
        put_u16(&mut out, 0);
    }
    out
}

fn encode_data_space_map() -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, 8); // header length
    put_u32(&mut out, 1); // entry count
    let entry_len = 4 + 4 + 4 + unicode_lp_len(DRM_CONTENT_STREAM) + unicode_lp_len(DRM_DATA_SPACE);
    put_u32(&mut out, entry_len);
    put_u32(&mut out, 1); // referenced component count
    put_u32(&mut out, 0); // component type: stream
    put_unicode_lp(&mut out, DRM_CONTENT_STREAM);
    put_unicode_lp(&mut out, DRM_DATA_SPACE);
    out
}

fn encode_drm_data_space() -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, 8); // header length
    put_u32(&mut out, 1); // transform reference count
    put_unicode_lp(&mut out, DRM_TRANSFORM);
    out
}

fn encode_primary(license: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, 8 + unicode_lp_len(DRM_TRANSFORM_CLASS)); // transform record length
    put_u32(&mut out, 1); // transform class type
    put_unicode_lp(&mut out, DRM_TRANSFORM_CLASS);
    put_unicode_lp(&mut out, DRM_TRANSFORM_FEATURE);
    for _ in 0..3 {
        put_u16(&mut out, 1);
        put_u16(&mut out, 0);
    }
    put_u32(&mut out, license.len() as u32);
    out.extend_from_slice(license);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

// --- record decoding ---

struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
    stream: &'static str,
}

impl<'a> RecordReader<'a> {
    fn new(buf: &'a [u8], stream: &'static str) -> Self {
        Self {
            buf,
            pos: 0,
            stream,
        }
    }

    fn corrupt(&self, what: &str) -> DrmError {
        DrmError::office(
            OfficeFileReason::CorruptFile,
            format!("protection metadata stream {:?}: {what}", self.stream),
        )
    }

    fn bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8], DrmError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| self.corrupt(&format!("truncated {what}")))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self, what: &str) -> Result<u16, DrmError> {
        let b = self.bytes(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32, DrmError> {
        let b = self.bytes(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn unicode_lp(&mut self, what: &str) -> Result<String, DrmError> {
        let byte_len = self.u32(what)?;
        if byte_len % 2 != 0 || byte_len > MAX_STRING_BYTES {
            return Err(self.corrupt(&format!("{what} has invalid length {byte_len}")));
        }
        let raw = self.bytes(byte_len as usize, what)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let value = String::from_utf16(&units)
            .map_err(|_| self.corrupt(&format!("{what} is not valid UTF-16")))?;
        let pad = (4 - byte_len % 4) % 4;
        let padding = self.bytes(pad as usize, what)?;
        if padding.iter().any(|b| *b != 0) {
            return Err(self.corrupt(&format!("{what} has non-zero padding")));
        }
        Ok(value)
    }

    fn expect_u32(&mut self, expected: u32, what: &str) -> Result<(), DrmError> {
        let got = self.u32(what)?;
        if got != expected {
            return Err(self.corrupt(&format!("{what} is {got}, expected {expected}")));
        }
        Ok(())
    }

    fn expect_version_pair(&mut self, what: &str) -> Result<(), DrmError> {
        let major = self.u16(what)?;
        let minor = self.u16(what)?;
        if (major, minor) != (1, 0) {
            return Err(self.corrupt(&format!("{what} is {major}.{minor}, expected 1.0")));
        }
        Ok(())
    }

    fn expect_end(&self) -> Result<(), DrmError> {
        if self.pos != self.buf.len() {
            return Err(self.corrupt("trailing bytes after final record"));
        }
        Ok(())
    }
}

fn foreign(stream: &str, what: &str, got: &str) -> DrmError {
    DrmError::office(
        OfficeFileReason::NonRmsProtected,
        format!("stream {stream:?} references a foreign {what}: {got:?}"),
    )
}

fn decode_version(buf: &[u8]) -> Result<(), DrmError> {
    let mut r = RecordReader::new(buf, VERSION_STREAM);
    let feature = r.unicode_lp("feature identifier")?;
    if feature != VERSION_FEATURE {
        return Err(r.corrupt(&format!("unexpected feature identifier {feature:?}")));
    }
    r.expect_version_pair("reader version")?;
    r.expect_version_pair("updater version")?;
    r.expect_version_pair("writer version")?;
    r.expect_end()
}

fn decode_data_space_map(buf: &[u8]) -> Result<(), DrmError> {
    let mut r = RecordReader::new(buf, DATA_SPACE_MAP_STREAM);
    r.expect_u32(8, "header length")?;
    let entry_count = r.u32("entry count")?;
    if entry_count != 1 {
        return Err(foreign(
            DATA_SPACE_MAP_STREAM,
            "data-space layout",
            &format!("{entry_count} map entries"),
        ));
    }
    let entry_len = r.u32("entry length")?;
    let entry_start = r.pos - 4;
    r.expect_u32(1, "referenced component count")?;
    r.expect_u32(0, "referenced component type")?;
    let content = r.unicode_lp("content reference")?;
    let data_space = r.unicode_lp("data space name")?;
    if content != DRM_CONTENT_STREAM {
        return Err(foreign(DATA_SPACE_MAP_STREAM, "content stream", &content));
    }
    if data_space != DRM_DATA_SPACE {
        return Err(foreign(DATA_SPACE_MAP_STREAM, "data space", &data_space));
    }
    if entry_len as usize != r.pos - entry_start {
        return Err(r.corrupt("entry length does not match entry size"));
    }
    r.expect_end()
}

fn decode_drm_data_space(buf: &[u8]) -> Result<(), DrmError> {
    let mut r = RecordReader::new(buf, DRM_DATA_SPACE);
    r.expect_u32(8, "header length")?;
    let transform_count = r.u32("transform reference count")?;
    if transform_count != 1 {
        return Err(foreign(
            DRM_DATA_SPACE,
            "transform chain",
            &format!("{transform_count} transforms"),
        ));
    }
    let transform = r.unicode_lp("transform reference")?;
    if transform != DRM_TRANSFORM {
        return Err(foreign(DRM_DATA_SPACE, "transform", &transform));
    }
    r.expect_end()
}

fn decode_primary(buf: &[u8]) -> Result<Vec<u8>, DrmError> {
    let mut r = RecordReader::new(buf, PRIMARY_STREAM);
    r.expect_u32(8 + unicode_lp_len(DRM_TRANSFORM_CLASS), "transform record length")?;
    r.expect_u32(1, "transform class type")?;
    let class = r.unicode_lp("transform class")?;
    if class != DRM_TRANSFORM_CLASS {
        return Err(foreign(PRIMARY_STREAM, "transform class", &class));
    }
    let feature = r.unicode_lp("transform feature name")?;
    if feature != DRM_TRANSFORM_FEATURE {
        return Err(foreign(PRIMARY_STREAM, "transform feature", &feature));
    }
    r.expect_version_pair("reader version")?;
    r.expect_version_pair("updater version")?;
    r.expect_version_pair("writer version")?;
    let license_len = r.u32("license length")?;
    if license_len > MAX_LICENSE_BYTES {
        return Err(r.corrupt(&format!("license length {license_len} out of range")));
    }
    let license = r.bytes(license_len as usize, "license")?.to_vec();
    let pad = (4 - r.pos % 4) % 4;
    let padding = r.bytes(pad, "license padding")?;
    if padding.iter().any(|b| *b != 0) {
        return Err(r.corrupt("license padding is non-zero"));
    }
    r.expect_end()?;
    Ok(license)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn empty_container() -> CompoundFile<Cursor<Vec<u8>>> {
        cfb::CompoundFile::create(Cursor::new(Vec::new())).expect("create cfb")
    }

    #[test]
    fn metadata_round_trips_license() {
        let license = b"license bytes with arbitrary \x00 content".to_vec();
        let mut ole = empty_container();
        write_data_spaces(&mut ole, &license).expect("write");
        let recovered = read_data_spaces(&mut ole).expect("read");
        assert_eq!(recovered, license);
    }

    #[test]
    fn empty_license_round_trips() {
        let mut ole = empty_container();
        write_data_spaces(&mut ole, &[]).expect("write");
        assert_eq!(read_data_spaces(&mut ole).expect("read"), Vec::<u8>::new());
    }

    #[test]
    fn missing_metadata_reads_as_corrupt() {
        let mut ole = empty_container();
        let err = read_data_spaces(&mut ole).expect_err("missing");
        assert_eq!(
            err.office_file_reason(),
            Some(OfficeFileReason::CorruptFile)
        );
    }

    #[test]
    fn any_flipped_version_byte_defeats_the_read() {
        let baseline = {
            let mut ole = empty_container();
            write_data_spaces(&mut ole, b"license").expect("write");
            let mut stream = ole.open_stream(version_path()).expect("open");
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes).expect("read");
            bytes
        };

        for index in 0..baseline.len() {
            let mut mutated = baseline.clone();
            mutated[index] ^= 0x01;
            let mut ole = empty_container();
            write_data_spaces(&mut ole, b"license").expect("write");
            let mut stream = ole.create_stream(version_path()).expect("rewrite");
            stream.write_all(&mutated).expect("write mutated");
            drop(stream);
            assert!(
                read_data_spaces(&mut ole).is_err(),
                "flipping version byte {index} must reject the container"
            );
        }
    }

    #[test]
    fn foreign_data_space_name_reports_non_rms() {
        let mut out = Vec::new();
        put_u32(&mut out, 8);
        put_u32(&mut out, 1);
        let entry_len =
            4 + 4 + 4 + unicode_lp_len("EncryptedPackage") + unicode_lp_len("StrongEncryption");
        put_u32(&mut out, entry_len);
        put_u32(&mut out, 1);
        put_u32(&mut out, 0);
        put_unicode_lp(&mut out, "EncryptedPackage");
        put_unicode_lp(&mut out, "StrongEncryption");

        let mut ole = empty_container();
        write_data_spaces(&mut ole, b"license").expect("write");
        let mut stream = ole.create_stream(data_space_map_path()).expect("rewrite");
        stream.write_all(&out).expect("write foreign map");
        drop(stream);

        let err = read_data_spaces(&mut ole).expect_err("foreign");
        assert_eq!(
            err.office_file_reason(),
            Some(OfficeFileReason::NonRmsProtected)
        );
    }

    #[test]
    fn foreign_transform_class_reports_non_rms() {
        let mut ole = empty_container();
        write_data_spaces(&mut ole, b"license").expect("write");

        let mut out = Vec::new();
        let class = "{00000000-0000-0000-0000-000000000000}";
        put_u32(&mut out, 8 + unicode_lp_len(class));
        put_u32(&mut out, 1);
        put_unicode_lp(&mut out, class);
        put_unicode_lp(&mut out, DRM_TRANSFORM_FEATURE);
        for _ in 0..3 {
            put_u16(&mut out, 1);
            put_u16(&mut out, 0);
        }
        put_u32(&mut out, 0);
        let mut stream = ole.create_stream(primary_path()).expect("rewrite");
        stream.write_all(&out).expect("write foreign primary");
        drop(stream);

        let err = read_data_spaces(&mut ole).expect_err("foreign");
        assert_eq!(
            err.office_file_reason(),
            Some(OfficeFileReason::NonRmsProtected)
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut ole = empty_container();
        write_data_spaces(&mut ole, b"license").expect("write");
        let mut bytes = Vec::new();
        ole.open_stream(drm_data_space_path())
            .expect("open")
            .read_to_end(&mut bytes)
            .expect("read");
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        let mut stream = ole.create_stream(drm_data_space_path()).expect("rewrite");
        stream.write_all(&bytes).expect("write padded");
        drop(stream);

        let err = read_data_spaces(&mut ole).expect_err("trailing");
        assert_eq!(
            err.office_file_reason(),
            Some(OfficeFileReason::CorruptFile)
        );
    }
}
