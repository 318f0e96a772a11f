//! Rights-policy and crypto-provider boundary for sealdoc document
//! protection.
//!
//! The container transform engine (`sealdoc-drm`) treats license issuance and
//! the block ciphers as external collaborators; this crate defines those
//! boundaries:
//! - [`PolicyService`] / [`UserPolicy`]: license creation and acquisition
//! - [`CryptoProvider`] / [`ProtectedStream`]: block cipher transforms and
//!   the 512/4096-byte protected-stream adapter
//! - [`Aes128EcbProvider`]: the legacy cipher mode
//! - [`LocalKeyPolicyService`]: a process-local service for tests and
//!   offline development
//!
//! All calls are synchronous; cancellation is cooperative via an
//! `AtomicBool` threaded into the service calls.

mod crypto;
mod local;
mod policy;

pub use crate::crypto::{
    protected_stream_block_size, Aes128EcbProvider, CipherMode, CryptoError, CryptoProvider,
    ProtectedStream, AES_BLOCK_SIZE,
};
pub use crate::local::{
    AlwaysConsent, LocalKeyPolicyService, NeverConsent, StaticTokenAuth,
};
pub use crate::policy::{
    AcquisitionOptions, AuthenticationCallback, CacheFlags, ConsentCallback, CryptoOptions,
    PolicyAcquisition, PolicyCreationOptions, PolicyDescriptor, PolicyError, PolicyService, Right,
    TemplateDescriptor, UnprotectResult, UserContext, UserPolicy, UserRights,
};
