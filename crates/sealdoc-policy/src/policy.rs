//! License/policy service boundary.
//!
//! The transform engine never issues or validates licenses itself; it asks a
//! [`PolicyService`] for a [`UserPolicy`] handle and only queries that handle
//! for the cipher mode, the crypto provider, and the serialized license blob
//! embedded into protected containers.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use thiserror::Error;

use crate::crypto::CryptoProvider;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("license not recognized by this service")]
    UnknownLicense,
    #[error("malformed license: {0}")]
    MalformedLicense(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("policy service failure: {0}")]
    Service(String),
}

/// Requested cipher mode for protection. `Auto` resolves to the legacy
/// AES-128 ECB mode, the only mode currently supported for compound
/// documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoOptions {
    Auto,
    Aes128Ecb,
    Aes128Cbc4k,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyCreationOptions {
    pub allow_audited_extraction: bool,
    pub prefer_legacy_algorithms: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionOptions {
    pub offline_only: bool,
}

/// Response-cache placement flags for license acquisition. All flags off
/// means no caching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheFlags {
    pub in_memory: bool,
    pub on_disk: bool,
    pub encrypted: bool,
}

impl CacheFlags {
    pub const NO_CACHE: CacheFlags = CacheFlags {
        in_memory: false,
        on_disk: false,
        encrypted: false,
    };

    pub fn all() -> CacheFlags {
        CacheFlags {
            in_memory: true,
            on_disk: true,
            encrypted: true,
        }
    }
}

/// Rights outcome of an unprotect call, one variant per license outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnprotectResult {
    NoRights,
    ViewOnly,
    Owner,
    FullControl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDescriptor {
    pub template_id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDescriptor {
    pub name: String,
    pub description: String,
    pub user_rights: Vec<UserRights>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRights {
    pub users: Vec<String>,
    pub rights: Vec<Right>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Right {
    View,
    Edit,
    Print,
    Extract,
    Owner,
}

/// Identity of the caller plus its authentication and consent callbacks.
pub struct UserContext {
    pub user_id: String,
    pub authentication: Arc<dyn AuthenticationCallback>,
    pub consent: Arc<dyn ConsentCallback>,
}

pub trait AuthenticationCallback: Send + Sync {
    fn access_token(&self, user_id: &str) -> Result<String, PolicyError>;
}

/// Asked before content is decrypted on behalf of the user; returning false
/// denies the acquisition.
pub trait ConsentCallback: Send + Sync {
    fn consents(&self, user_id: &str) -> bool;
}

/// Opaque rights-policy handle held by the transform engine for the duration
/// of one protect/unprotect call.
pub trait UserPolicy: Send + Sync {
    /// True when the policy's content key uses the legacy ECB cipher mode.
    fn uses_legacy_cipher_mode(&self) -> bool;

    fn crypto_provider(&self) -> Arc<dyn CryptoProvider>;

    /// The license blob embedded into the protected container's metadata.
    fn serialized_license(&self) -> Vec<u8>;
}

/// Outcome of a license acquisition: the rights the caller holds and, when
/// those rights are non-empty, the policy handle to decrypt with.
pub struct PolicyAcquisition {
    pub result: UnprotectResult,
    pub policy: Option<Arc<dyn UserPolicy>>,
}

impl fmt::Debug for PolicyAcquisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyAcquisition")
            .field("result", &self.result)
            .field("has_policy", &self.policy.is_some())
            .finish()
    }
}

pub trait PolicyService: Send + Sync {
    fn create_from_template(
        &self,
        template: &TemplateDescriptor,
        user_id: &str,
        auth: &dyn AuthenticationCallback,
        options: PolicyCreationOptions,
        signed_app_data: &[(String, String)],
        cancel: &AtomicBool,
    ) -> Result<Arc<dyn UserPolicy>, PolicyError>;

    fn create(
        &self,
        descriptor: &PolicyDescriptor,
        user_id: &str,
        auth: &dyn AuthenticationCallback,
        options: PolicyCreationOptions,
        cancel: &AtomicBool,
    ) -> Result<Arc<dyn UserPolicy>, PolicyError>;

    fn acquire(
        &self,
        license: &[u8],
        user_id: &str,
        auth: &dyn AuthenticationCallback,
        consent: &dyn ConsentCallback,
        options: AcquisitionOptions,
        cache: CacheFlags,
        cancel: &AtomicBool,
    ) -> Result<PolicyAcquisition, PolicyError>;
}
