//! Process-local policy service for tests and offline development.
//!
//! [`LocalKeyPolicyService`] mints random AES-128 content keys and serializes
//! them into a self-contained license blob, so a protect/unprotect round trip
//! can run without a license server. The blob carries the content key in the
//! clear; do not use this service outside trusted test environments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::RngCore;

use crate::crypto::{Aes128EcbProvider, CryptoProvider};
use crate::policy::{
    AcquisitionOptions, AuthenticationCallback, CacheFlags, ConsentCallback, PolicyAcquisition,
    PolicyCreationOptions, PolicyDescriptor, PolicyError, PolicyService, TemplateDescriptor,
    UnprotectResult, UserPolicy,
};

const LICENSE_MAGIC: [u8; 8] = *b"SDLPOL\r\n";
const LICENSE_VERSION: u16 = 1;
const MAX_POLICY_NAME_LEN: u32 = 1024;

/// Policy service resolving rights from an in-process grant table.
#[derive(Default)]
pub struct LocalKeyPolicyService {
    grants: HashMap<String, UnprotectResult>,
}

impl LocalKeyPolicyService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `user_id` the given rights level for every license this service
    /// issues or resolves. Users without a grant get `NoRights`.
    pub fn grant(mut self, user_id: impl Into<String>, result: UnprotectResult) -> Self {
        self.grants.insert(user_id.into(), result);
        self
    }

    fn issue(&self, policy_name: &str) -> Arc<dyn UserPolicy> {
        let mut key = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut key);
        let license = encode_license(&key, policy_name);
        Arc::new(LocalPolicy {
            provider: Arc::new(Aes128EcbProvider::new(key)),
            license,
        })
    }
}

impl PolicyService for LocalKeyPolicyService {
    fn create_from_template(
        &self,
        template: &TemplateDescriptor,
        user_id: &str,
        auth: &dyn AuthenticationCallback,
        _options: PolicyCreationOptions,
        _signed_app_data: &[(String, String)],
        cancel: &AtomicBool,
    ) -> Result<Arc<dyn UserPolicy>, PolicyError> {
        if cancel.load(Ordering::SeqCst) {
            return Err(PolicyError::Cancelled);
        }
        auth.access_token(user_id)?;
        Ok(self.issue(&template.name))
    }

    fn create(
        &self,
        descriptor: &PolicyDescriptor,
        user_id: &str,
        auth: &dyn AuthenticationCallback,
        _options: PolicyCreationOptions,
        cancel: &AtomicBool,
    ) -> Result<Arc<dyn UserPolicy>, PolicyError> {
        if cancel.load(Ordering::SeqCst) {
            return Err(PolicyError::Cancelled);
        }
        auth.access_token(user_id)?;
        Ok(self.issue(&descriptor.name))
    }

    fn acquire(
        &self,
        license: &[u8],
        user_id: &str,
        auth: &dyn AuthenticationCallback,
        consent: &dyn ConsentCallback,
        _options: AcquisitionOptions,
        _cache: CacheFlags,
        cancel: &AtomicBool,
    ) -> Result<PolicyAcquisition, PolicyError> {
        if cancel.load(Ordering::SeqCst) {
            return Err(PolicyError::Cancelled);
        }
        auth.access_token(user_id)?;
        let (key, _policy_name) = decode_license(license)?;
        if !consent.consents(user_id) {
            return Ok(PolicyAcquisition {
                result: UnprotectResult::NoRights,
                policy: None,
            });
        }
        let result = self
            .grants
            .get(user_id)
            .copied()
            .unwrap_or(UnprotectResult::NoRights);
        if result == UnprotectResult::NoRights {
            return Ok(PolicyAcquisition {
                result,
                policy: None,
            });
        }
        Ok(PolicyAcquisition {
            result,
            policy: Some(Arc::new(LocalPolicy {
                provider: Arc::new(Aes128EcbProvider::new(key)),
                license: license.to_vec(),
            })),
        })
    }
}

struct LocalPolicy {
    provider: Arc<Aes128EcbProvider>,
    license: Vec<u8>,
}

impl UserPolicy for LocalPolicy {
    fn uses_legacy_cipher_mode(&self) -> bool {
        true
    }

    fn crypto_provider(&self) -> Arc<dyn CryptoProvider> {
        self.provider.clone()
    }

    fn serialized_license(&self) -> Vec<u8> {
        self.license.clone()
    }
}

fn encode_license(key: &[u8; 16], policy_name: &str) -> Vec<u8> {
    let name = policy_name.as_bytes();
    let mut out = Vec::with_capacity(8 + 2 + 16 + 4 + name.len());
    out.extend_from_slice(&LICENSE_MAGIC);
    out.extend_from_slice(&LICENSE_VERSION.to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(name);
    out
}

fn decode_license(blob: &[u8]) -> Result<([u8; 16], String), PolicyError> {
    if blob.len() < 8 || blob[..8] != LICENSE_MAGIC {
        return Err(PolicyError::UnknownLicense);
    }
    let rest = &blob[8..];
    if rest.len() < 2 + 16 + 4 {
        return Err(PolicyError::MalformedLicense("truncated header".into()));
    }
    let version = u16::from_le_bytes([rest[0], rest[1]]);
    if version != LICENSE_VERSION {
        return Err(PolicyError::MalformedLicense(format!(
            "unsupported license version {version}"
        )));
    }
    let mut key = [0u8; 16];
    key.copy_from_slice(&rest[2..18]);
    let name_len = u32::from_le_bytes([rest[18], rest[19], rest[20], rest[21]]);
    if name_len > MAX_POLICY_NAME_LEN {
        return Err(PolicyError::MalformedLicense(format!(
            "policy name length {name_len} out of range"
        )));
    }
    let name_bytes = rest
        .get(22..22 + name_len as usize)
        .ok_or_else(|| PolicyError::MalformedLicense("truncated policy name".into()))?;
    let name = String::from_utf8(name_bytes.to_vec())
        .map_err(|_| PolicyError::MalformedLicense("policy name is not UTF-8".into()))?;
    Ok((key, name))
}

/// Authentication callback returning a fixed token for every user.
pub struct StaticTokenAuth {
    token: String,
}

impl StaticTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AuthenticationCallback for StaticTokenAuth {
    fn access_token(&self, _user_id: &str) -> Result<String, PolicyError> {
        Ok(self.token.clone())
    }
}

/// Consent callback that always approves.
pub struct AlwaysConsent;

impl ConsentCallback for AlwaysConsent {
    fn consents(&self, _user_id: &str) -> bool {
        true
    }
}

/// Consent callback that always declines.
pub struct NeverConsent;

impl ConsentCallback for NeverConsent {
    fn consents(&self, _user_id: &str) -> bool {
        false
    }
}
