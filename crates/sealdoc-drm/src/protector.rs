//! The container transform engine: partitions a compound document into
//! public and protected subtrees, drives the metadata and payload writing on
//! protect, and license acquisition plus tree merge on unprotect.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use cfb::CompoundFile;

use sealdoc_policy::{
    AcquisitionOptions, CacheFlags, CryptoOptions, PolicyDescriptor, PolicyService,
    TemplateDescriptor, UnprotectResult, UserContext, UserPolicy,
};

use crate::block_codec::{decrypt_stream, encrypt_stream};
use crate::data_spaces::{read_data_spaces, write_data_spaces, DRM_CONTENT_STREAM};
use crate::error::{DrmError, OfficeFileReason};
use crate::stubs::{is_public_element, stub_kind, write_stub};
use crate::utils::{
    copy_file_to_writer, copy_stream_to_file, read_stream_header, resolve_creation_options,
    scratch_file, validate_stream_size, write_stream_header, TempWorkspace,
    MAX_FILE_SIZE_FOR_DECRYPT, MAX_FILE_SIZE_FOR_ENCRYPT,
};

#[derive(Debug, Clone)]
pub struct ProtectWithTemplateOptions {
    pub template: TemplateDescriptor,
    pub crypto_options: CryptoOptions,
    pub allow_audited_extraction: bool,
    pub signed_app_data: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ProtectWithCustomRightsOptions {
    pub descriptor: PolicyDescriptor,
    pub crypto_options: CryptoOptions,
    pub allow_audited_extraction: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnprotectOptions {
    pub offline_only: bool,
    pub use_cache: bool,
}

/// Whether a container is protected by this scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionState {
    Protected,
    NotProtected,
    /// The input could not be read at all, so no determination was made.
    Indeterminate,
}

/// Protects and unprotects one compound document. An instance owns its input
/// stream and at most one policy handle per call; it is not meant for
/// concurrent reuse.
pub struct OfficeProtector<R> {
    file_name: String,
    input: R,
    policy: Option<Arc<dyn UserPolicy>>,
}

impl<R: Read + Seek> OfficeProtector<R> {
    pub fn new(file_name: impl Into<String>, input: R) -> Self {
        Self {
            file_name: file_name.into(),
            input,
            policy: None,
        }
    }

    /// Protect the input with rights from a named template.
    pub fn protect_with_template<W: Write>(
        &mut self,
        service: &dyn PolicyService,
        user: &UserContext,
        options: &ProtectWithTemplateOptions,
        output: &mut W,
        cancel: &AtomicBool,
    ) -> Result<(), DrmError> {
        log::debug!("protect_with_template: {}", self.file_name);
        let creation =
            resolve_creation_options(options.allow_audited_extraction, options.crypto_options)?;
        self.ensure_not_protected()?;
        let input_size = validate_stream_size(&mut self.input, MAX_FILE_SIZE_FOR_ENCRYPT)?;
        let policy = service
            .create_from_template(
                &options.template,
                &user.user_id,
                user.authentication.as_ref(),
                creation,
                &options.signed_app_data,
                cancel,
            )
            .map_err(|e| DrmError::InvalidArgument(format!("user policy creation failed: {e}")))?;
        self.policy = Some(policy);
        self.run_protect(input_size, output)
    }

    /// Protect the input with an explicit custom-rights set.
    pub fn protect_with_custom_rights<W: Write>(
        &mut self,
        service: &dyn PolicyService,
        user: &UserContext,
        options: &ProtectWithCustomRightsOptions,
        output: &mut W,
        cancel: &AtomicBool,
    ) -> Result<(), DrmError> {
        log::debug!("protect_with_custom_rights: {}", self.file_name);
        let creation =
            resolve_creation_options(options.allow_audited_extraction, options.crypto_options)?;
        self.ensure_not_protected()?;
        let input_size = validate_stream_size(&mut self.input, MAX_FILE_SIZE_FOR_ENCRYPT)?;
        let policy = service
            .create(
                &options.descriptor,
                &user.user_id,
                user.authentication.as_ref(),
                creation,
                cancel,
            )
            .map_err(|e| DrmError::InvalidArgument(format!("user policy creation failed: {e}")))?;
        self.policy = Some(policy);
        self.run_protect(input_size, output)
    }

    /// Unprotect the input, returning the rights the caller holds.
    pub fn unprotect<W: Write>(
        &mut self,
        service: &dyn PolicyService,
        user: &UserContext,
        options: &UnprotectOptions,
        output: &mut W,
        cancel: &AtomicBool,
    ) -> Result<UnprotectResult, DrmError> {
        log::debug!("unprotect: {}", self.file_name);
        let input_size = validate_stream_size(&mut self.input, MAX_FILE_SIZE_FOR_DECRYPT)?;
        let mut workspace = TempWorkspace::create(&self.file_name)?;
        let result =
            self.unprotect_internal(service, user, options, &mut workspace, input_size, cancel)?;
        copy_file_to_writer(workspace.output.as_file_mut(), output)?;
        Ok(result)
    }

    /// Determine whether the input is protected by this scheme, without
    /// mutating it.
    pub fn protection_state(&mut self) -> ProtectionState {
        let input_size = match validate_stream_size(&mut self.input, MAX_FILE_SIZE_FOR_DECRYPT) {
            Ok(size) => size,
            Err(_) => return ProtectionState::Indeterminate,
        };
        let mut scratch = match scratch_file(&self.file_name) {
            Ok(file) => file,
            Err(_) => return ProtectionState::Indeterminate,
        };
        if copy_stream_to_file(&mut self.input, scratch.as_file_mut(), input_size).is_err() {
            return ProtectionState::Indeterminate;
        }
        let mut ole = match CompoundFile::open(scratch.as_file_mut()) {
            Ok(ole) => ole,
            Err(_) => return ProtectionState::NotProtected,
        };
        match read_data_spaces(&mut ole) {
            Ok(_) => ProtectionState::Protected,
            // A container carrying a foreign data-space scheme still reports
            // Protected; see DESIGN.md before relying on this mapping.
            Err(DrmError::OfficeFile {
                reason: OfficeFileReason::NonRmsProtected,
                ..
            }) => ProtectionState::Protected,
            Err(_) => ProtectionState::NotProtected,
        }
    }

    pub fn is_protected(&mut self) -> bool {
        matches!(self.protection_state(), ProtectionState::Protected)
    }

    fn ensure_not_protected(&mut self) -> Result<(), DrmError> {
        if self.is_protected() {
            log::warn!("{} is already protected", self.file_name);
            return Err(DrmError::office(
                OfficeFileReason::AlreadyProtected,
                "the file is already protected",
            ));
        }
        Ok(())
    }

    fn run_protect<W: Write>(&mut self, input_size: u64, output: &mut W) -> Result<(), DrmError> {
        let mut workspace = TempWorkspace::create(&self.file_name)?;
        self.protect_internal(&mut workspace, input_size)?;
        copy_file_to_writer(workspace.output.as_file_mut(), output)
    }

    fn protect_internal(
        &mut self,
        workspace: &mut TempWorkspace,
        input_size: u64,
    ) -> Result<(), DrmError> {
        let policy = self
            .policy
            .clone()
            .ok_or_else(|| DrmError::InvalidArgument("user policy creation failed".into()))?;
        let TempWorkspace { input, output, drm } = workspace;
        copy_stream_to_file(&mut self.input, input.as_file_mut(), input_size)?;
        let mut input_ole = CompoundFile::open(input.as_file_mut()).map_err(|_| {
            DrmError::office(
                OfficeFileReason::NotOfficeFile,
                "the file is not a valid compound document",
            )
        })?;
        let children = root_children(&mut input_ole)?;
        if children.is_empty() {
            return Err(DrmError::office(
                OfficeFileReason::NotOfficeFile,
                "the container has no content to protect",
            ));
        }

        let mut output_ole = CompoundFile::create(output.as_file_mut())
            .map_err(|e| DrmError::stream("failed to create output container", e))?;
        {
            let mut drm_ole = CompoundFile::create(drm.as_file_mut())
                .map_err(|e| DrmError::stream("failed to create scratch container", e))?;
            for name in &children {
                if let Some(kind) = stub_kind(name) {
                    write_stub(&mut output_ole, kind)
                        .map_err(|e| DrmError::stream("failed to write skeleton content", e))?;
                }
                let path = format!("/{name}");
                if is_public_element(name) {
                    copy_tree(&mut input_ole, &mut output_ole, &path)?;
                } else {
                    copy_tree(&mut input_ole, &mut drm_ole, &path)?;
                }
            }
            drm_ole
                .flush()
                .map_err(|e| DrmError::stream("failed to flush scratch container", e))?;
        }
        let drm_size = validate_stream_size(drm.as_file_mut(), MAX_FILE_SIZE_FOR_ENCRYPT)?;

        // Metadata must be fully written before the payload stream opens.
        write_data_spaces(&mut output_ole, &policy.serialized_license())?;
        {
            let provider = policy.crypto_provider();
            let mut payload = output_ole
                .create_stream(format!("/{DRM_CONTENT_STREAM}"))
                .map_err(|e| DrmError::stream("failed to create encrypted payload stream", e))?;
            write_stream_header(&mut payload, drm_size)?;
            encrypt_stream(provider.as_ref(), drm.as_file_mut(), &mut payload, drm_size)?;
        }
        output_ole
            .flush()
            .map_err(|e| DrmError::stream("failed to flush output container", e))?;
        Ok(())
    }

    fn unprotect_internal(
        &mut self,
        service: &dyn PolicyService,
        user: &UserContext,
        options: &UnprotectOptions,
        workspace: &mut TempWorkspace,
        input_size: u64,
        cancel: &AtomicBool,
    ) -> Result<UnprotectResult, DrmError> {
        let TempWorkspace { input, output, drm } = workspace;
        copy_stream_to_file(&mut self.input, input.as_file_mut(), input_size)?;
        let mut input_ole = CompoundFile::open(input.as_file_mut()).map_err(|_| {
            DrmError::office(
                OfficeFileReason::NotOfficeFile,
                "the file is not a valid compound document",
            )
        })?;
        let license = read_data_spaces(&mut input_ole)?;

        let acquisition_options = AcquisitionOptions {
            offline_only: options.offline_only,
        };
        let cache = if options.use_cache {
            CacheFlags::all()
        } else {
            CacheFlags::NO_CACHE
        };
        let acquisition = service
            .acquire(
                &license,
                &user.user_id,
                user.authentication.as_ref(),
                user.consent.as_ref(),
                acquisition_options,
                cache,
                cancel,
            )
            .map_err(|e| {
                DrmError::office(
                    OfficeFileReason::CorruptFile,
                    format!("license acquisition failed: {e}"),
                )
            })?;
        if acquisition.result == UnprotectResult::NoRights {
            log::warn!("license acquisition denied for {}", self.file_name);
            return Err(DrmError::office(
                OfficeFileReason::CorruptFile,
                "the caller holds no rights to this file",
            ));
        }
        let policy = acquisition
            .policy
            .ok_or_else(|| DrmError::InvalidArgument("user policy acquisition failed".into()))?;
        if !policy.uses_legacy_cipher_mode() {
            return Err(DrmError::NotSupported(
                "CBC decryption for compound documents is not yet supported".into(),
            ));
        }
        self.policy = Some(policy.clone());

        {
            let mut payload = input_ole
                .open_stream(format!("/{DRM_CONTENT_STREAM}"))
                .map_err(|_| {
                    DrmError::office(OfficeFileReason::CorruptFile, "encrypted content not found")
                })?;
            let payload_size = payload
                .seek(SeekFrom::End(0))
                .map_err(|e| DrmError::stream("failed to measure encrypted payload", e))?;
            payload
                .seek(SeekFrom::Start(0))
                .map_err(|e| DrmError::stream("failed to rewind encrypted payload", e))?;
            if payload_size < 8 {
                return Err(DrmError::office(
                    OfficeFileReason::CorruptFile,
                    "encrypted payload is truncated",
                ));
            }
            let plaintext_len = read_stream_header(&mut payload)?;
            // The prefix is untrusted input; it can never exceed what the
            // encryption ceiling allowed in.
            if plaintext_len > MAX_FILE_SIZE_FOR_ENCRYPT {
                return Err(DrmError::office(
                    OfficeFileReason::CorruptFile,
                    format!("encrypted payload declares an implausible size {plaintext_len}"),
                ));
            }
            let provider = policy.crypto_provider();
            decrypt_stream(
                provider.as_ref(),
                &mut payload,
                drm.as_file_mut(),
                payload_size - 8,
                plaintext_len,
            )?;
        }

        let mut output_ole = CompoundFile::create(output.as_file_mut())
            .map_err(|e| DrmError::stream("failed to create output container", e))?;
        for name in root_children(&mut input_ole)? {
            if is_public_element(&name) {
                copy_tree(&mut input_ole, &mut output_ole, &format!("/{name}"))?;
            }
        }
        let mut drm_ole = CompoundFile::open(drm.as_file_mut()).map_err(|_| {
            DrmError::office(
                OfficeFileReason::CorruptFile,
                "decrypted content is not a valid compound document",
            )
        })?;
        for name in root_children(&mut drm_ole)? {
            copy_tree(&mut drm_ole, &mut output_ole, &format!("/{name}"))?;
        }
        output_ole
            .flush()
            .map_err(|e| DrmError::stream("failed to flush output container", e))?;
        Ok(acquisition.result)
    }
}

fn root_children<F: Read + Seek>(ole: &mut CompoundFile<F>) -> Result<Vec<String>, DrmError> {
    let entries = ole.read_storage("/").map_err(|_| {
        DrmError::office(
            OfficeFileReason::NotOfficeFile,
            "the container root is unreadable",
        )
    })?;
    Ok(entries.map(|entry| entry.name().to_string()).collect())
}

/// Copy the node at `path` (stream or whole storage subtree) from `src` to
/// the same path in `dest`. Nodes are created once and never mutated after;
/// children are visited in the container's enumeration order.
fn copy_tree<S, D>(
    src: &mut CompoundFile<S>,
    dest: &mut CompoundFile<D>,
    path: &str,
) -> Result<(), DrmError>
where
    S: Read + Seek,
    D: Read + Write + Seek,
{
    let entry = src
        .entry(path)
        .map_err(|e| DrmError::stream("failed to read container entry", e))?;
    if entry.is_stream() {
        let mut bytes = Vec::new();
        src.open_stream(path)
            .map_err(|e| DrmError::stream("failed to open source stream", e))?
            .read_to_end(&mut bytes)
            .map_err(|e| DrmError::stream("failed to read source stream", e))?;
        dest.create_stream(path)
            .map_err(|e| DrmError::stream("failed to create destination stream", e))?
            .write_all(&bytes)
            .map_err(|e| DrmError::stream("failed to write destination stream", e))?;
        return Ok(());
    }
    dest.create_storage(path)
        .map_err(|e| DrmError::stream("failed to create destination storage", e))?;
    let children: Vec<String> = src
        .read_storage(path)
        .map_err(|e| DrmError::stream("failed to enumerate source storage", e))?
        .map(|entry| entry.name().to_string())
        .collect();
    for child in children {
        copy_tree(src, dest, &format!("{path}/{child}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn new_container() -> CompoundFile<Cursor<Vec<u8>>> {
        cfb::CompoundFile::create(Cursor::new(Vec::new())).expect("create cfb")
    }

    #[test]
    fn copy_tree_preserves_nested_structure() {
        let mut src = new_container();
        src.create_storage("/Macros").expect("storage");
        src.create_storage("/Macros/VBA").expect("storage");
        src.create_stream("/Macros/VBA/Module1")
            .expect("stream")
            .write_all(b"Sub Main()\nEnd Sub\n")
            .expect("write");
        src.create_stream("/Macros/PROJECT")
            .expect("stream")
            .write_all(b"ID=\"{0}\"")
            .expect("write");

        let mut dest = new_container();
        copy_tree(&mut src, &mut dest, "/Macros").expect("copy");

        let mut module = Vec::new();
        dest.open_stream("/Macros/VBA/Module1")
            .expect("open")
            .read_to_end(&mut module)
            .expect("read");
        assert_eq!(module, b"Sub Main()\nEnd Sub\n");
        let mut project = Vec::new();
        dest.open_stream("/Macros/PROJECT")
            .expect("open")
            .read_to_end(&mut project)
            .expect("read");
        assert_eq!(project, b"ID=\"{0}\"");
    }

    #[test]
    fn copy_tree_handles_empty_stream() {
        let mut src = new_container();
        src.create_stream("/empty").expect("stream");
        let mut dest = new_container();
        copy_tree(&mut src, &mut dest, "/empty").expect("copy");
        let mut bytes = Vec::new();
        dest.open_stream("/empty")
            .expect("open")
            .read_to_end(&mut bytes)
            .expect("read");
        assert!(bytes.is_empty());
    }

    #[test]
    fn protection_state_of_plain_bytes_is_not_protected() {
        let mut protector =
            OfficeProtector::new("notes.txt", Cursor::new(b"just some text".to_vec()));
        assert_eq!(protector.protection_state(), ProtectionState::NotProtected);
        assert!(!protector.is_protected());
    }

    #[test]
    fn protection_state_of_unprotected_container_is_not_protected() {
        let mut ole = new_container();
        ole.create_stream("/WordDocument")
            .expect("stream")
            .write_all(&[0xEC, 0xA5, 0x00, 0x00])
            .expect("write");
        let bytes = ole.into_inner().into_inner();
        let mut protector = OfficeProtector::new("report.doc", Cursor::new(bytes));
        assert_eq!(protector.protection_state(), ProtectionState::NotProtected);
    }
}
