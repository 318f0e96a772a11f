//! DRM protection of OLE/CFB compound documents.
//!
//! Protecting a document partitions its container children into public and
//! protected sets: public elements (signatures, summary information, macro
//! storages, ...) are copied verbatim into the output, recognized main
//! content streams are replaced with minimal document skeletons, and
//! everything else is serialized into an inner container that is encrypted
//! into a single reserved payload stream. DataSpaces transform metadata plus
//! the serialized rights license are embedded alongside the payload, and
//! restoring the original content requires a successful license acquisition
//! through a [`PolicyService`](sealdoc_policy::PolicyService).
//!
//! ```no_run
//! use std::fs::File;
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use sealdoc_drm::{OfficeProtector, UnprotectOptions};
//! use sealdoc_policy::{
//!     AlwaysConsent, LocalKeyPolicyService, StaticTokenAuth, UnprotectResult, UserContext,
//! };
//!
//! # fn main() -> Result<(), sealdoc_drm::DrmError> {
//! let service = LocalKeyPolicyService::new().grant("user@contoso.com", UnprotectResult::FullControl);
//! let user = UserContext {
//!     user_id: "user@contoso.com".into(),
//!     authentication: Arc::new(StaticTokenAuth::new("token")),
//!     consent: Arc::new(AlwaysConsent),
//! };
//! let input = File::open("report.doc").map_err(|e| sealdoc_drm::DrmError::Stream(e.to_string()))?;
//! let mut protector = OfficeProtector::new("report.doc", input);
//! let mut output = Vec::new();
//! let rights = protector.unprotect(
//!     &service,
//!     &user,
//!     &UnprotectOptions::default(),
//!     &mut output,
//!     &AtomicBool::new(false),
//! )?;
//! assert_ne!(rights, UnprotectResult::NoRights);
//! # Ok(())
//! # }
//! ```

mod block_codec;
mod data_spaces;
mod error;
mod protector;
mod stubs;
mod utils;

pub use crate::block_codec::{decrypt_stream, encrypt_stream, CHUNK_SIZE};
pub use crate::data_spaces::{
    read_data_spaces, write_data_spaces, DATA_SPACES_STORAGE, DRM_CONTENT_STREAM,
};
pub use crate::error::{DrmError, OfficeFileReason};
pub use crate::protector::{
    OfficeProtector, ProtectWithCustomRightsOptions, ProtectWithTemplateOptions, ProtectionState,
    UnprotectOptions,
};
pub use crate::stubs::{
    is_public_element, stub_kind, DocumentKind, CURRENT_USER_STUB, POWERPOINT_DOCUMENT_STUB,
    PUBLIC_ELEMENTS, TABLE_STUB, WORD_DOCUMENT_STUB, WORKBOOK_STUB,
};
pub use crate::utils::{MAX_FILE_SIZE_FOR_DECRYPT, MAX_FILE_SIZE_FOR_ENCRYPT};
