//! Partition sets for the transform engine: the public element names copied
//! unencrypted, and the stub skeletons substituted for recognized main
//! content streams so a protected file still opens as a recognizable (but
//! empty) document of its kind before rights are granted.

use std::io::{Read, Seek, Write};

use cfb::CompoundFile;

/// Container children copied verbatim into the protected output.
pub const PUBLIC_ELEMENTS: &[&str] = &[
    "_signatures",
    "\u{1}CompObj",
    "Macros",
    "_VBA_PROJECT_CUR",
    "\u{5}SummaryInformation",
    "\u{5}DocumentSummaryInformation",
    "MsoDataStore",
];

pub fn is_public_element(name: &str) -> bool {
    PUBLIC_ELEMENTS.contains(&name)
}

/// Document kinds with a recognized main content stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Word,
    PowerPoint,
    Excel,
}

/// Main content stream name to document kind; anything else that is not a
/// public element is protected content without a stub.
pub fn stub_kind(name: &str) -> Option<DocumentKind> {
    match name {
        "WordDocument" => Some(DocumentKind::Word),
        "PowerPoint Document" => Some(DocumentKind::PowerPoint),
        "Workbook" => Some(DocumentKind::Excel),
        _ => None,
    }
}

// Minimal skeleton bytes per document kind. Each carries the real format
// magic so consumers identify the kind, with no content records behind it.

/// Word FIB header: wIdent 0xA5EC, nFib 0x00C1, empty flags.
pub const WORD_DOCUMENT_STUB: &[u8] = &[
    0xEC, 0xA5, 0xC1, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];

/// Empty Word table stream.
pub const TABLE_STUB: &[u8] = &[0x00, 0x00, 0x00, 0x00];

/// PowerPoint CurrentUserAtom record header with the plaintext header token.
pub const CURRENT_USER_STUB: &[u8] = &[
    0x00, 0x00, 0xF6, 0x0F, 0x08, 0x00, 0x00, 0x00, 0x5F, 0xC0, 0x91, 0xE3, 0x00, 0x00, 0x00,
    0x00,
];

/// Empty PowerPoint document container record.
pub const POWERPOINT_DOCUMENT_STUB: &[u8] = &[
    0x0F, 0x00, 0xE8, 0x03, 0x00, 0x00, 0x00, 0x00,
];

/// Workbook skeleton: BIFF8 BOF (worksheet-substream flavor) followed by EOF.
pub const WORKBOOK_STUB: &[u8] = &[
    0x09, 0x08, 0x10, 0x00, 0x00, 0x06, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00,
];

/// Write the skeleton streams for `kind` at the root of `ole`.
pub fn write_stub<F: Read + Write + Seek>(
    ole: &mut CompoundFile<F>,
    kind: DocumentKind,
) -> std::io::Result<()> {
    match kind {
        DocumentKind::Word => {
            ole.create_stream("/1Table")?.write_all(TABLE_STUB)?;
            ole.create_stream("/WordDocument")?
                .write_all(WORD_DOCUMENT_STUB)?;
        }
        DocumentKind::PowerPoint => {
            ole.create_stream("/Current User")?
                .write_all(CURRENT_USER_STUB)?;
            ole.create_stream("/PowerPoint Document")?
                .write_all(POWERPOINT_DOCUMENT_STUB)?;
        }
        DocumentKind::Excel => {
            ole.create_stream("/Workbook")?.write_all(WORKBOOK_STUB)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn recognizes_main_content_streams() {
        assert_eq!(stub_kind("WordDocument"), Some(DocumentKind::Word));
        assert_eq!(
            stub_kind("PowerPoint Document"),
            Some(DocumentKind::PowerPoint)
        );
        assert_eq!(stub_kind("Workbook"), Some(DocumentKind::Excel));
        assert_eq!(stub_kind("1Table"), None);
        assert_eq!(stub_kind("worddocument"), None);
    }

    #[test]
    fn public_set_matches_exact_names() {
        assert!(is_public_element("\u{5}SummaryInformation"));
        assert!(is_public_element("Macros"));
        assert!(!is_public_element("WordDocument"));
        assert!(!is_public_element("\u{9}DRMContent"));
    }

    #[test]
    fn word_stub_writes_both_skeleton_streams() {
        let mut ole = cfb::CompoundFile::create(Cursor::new(Vec::new())).expect("create");
        write_stub(&mut ole, DocumentKind::Word).expect("stub");
        let mut word = Vec::new();
        ole.open_stream("/WordDocument")
            .expect("open")
            .read_to_end(&mut word)
            .expect("read");
        assert_eq!(word, WORD_DOCUMENT_STUB);
        let mut table = Vec::new();
        ole.open_stream("/1Table")
            .expect("open")
            .read_to_end(&mut table)
            .expect("read");
        assert_eq!(table, TABLE_STUB);
    }
}
