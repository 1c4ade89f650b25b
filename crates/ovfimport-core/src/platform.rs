//! Interfaces to the virtualization platform.
//!
//! The pipeline orchestrates; these traits carry the actual RPCs. Every
//! call that changes remote state returns only once the platform reports
//! the operation finished.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::import_spec::{ImportSpec, ImportSpecParams, ImportSpecResult};
use crate::manifest::{Checksum, ServerChecksum};
use crate::session::FileStatus;

/// A typed reference to a platform object, written `Type:value`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ManagedObjectRef {
    pub kind: String,
    pub value: String,
}

impl ManagedObjectRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

impl FromStr for ManagedObjectRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| Error::descriptor(format!("'{s}' is not an object reference")))?;
        if kind.is_empty() || value.is_empty() || kind.contains(char::is_whitespace) {
            return Err(Error::descriptor(format!("'{s}' is not an object reference")));
        }
        Ok(Self::new(kind, value))
    }
}

/// Resolves inventory paths to objects.
pub trait Finder: Send + Sync {
    /// Look up a network by name or inventory path.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when nothing matches; other variants for lookup
    /// failures.
    fn network(&self, path: &str) -> Result<ManagedObjectRef>;
}

/// Import spec synthesis and import negotiation.
pub trait OvfManager: Send + Sync {
    /// Ask the platform to turn a descriptor into an import spec.
    fn create_import_spec(
        &self,
        descriptor: &str,
        pool: &ManagedObjectRef,
        datastore: &ManagedObjectRef,
        params: &ImportSpecParams,
    ) -> Result<ImportSpecResult>;

    /// Start an import; returns the lease governing its uploads.
    fn import_vapp(
        &self,
        spec: &ImportSpec,
        pool: &ManagedObjectRef,
        folder: Option<&ManagedObjectRef>,
        host: Option<&ManagedObjectRef>,
    ) -> Result<ManagedObjectRef>;
}

/// Upload endpoint the platform allocated for one import file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUrl {
    /// Server-side device key, used in the lease manifest.
    pub key: String,
    /// Matches [`FileItem::device_id`](crate::import_spec::FileItem::device_id).
    pub import_key: String,
    pub url: String,
    pub ssl_thumbprint: Option<String>,
}

/// A lease that reached the ready state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    /// The entity being created.
    pub entity: ManagedObjectRef,
    pub device_urls: Vec<DeviceUrl>,
}

/// NFC lease operations.
pub trait LeaseApi: Send + Sync {
    /// Block until the lease leaves its initializing state.
    ///
    /// # Errors
    ///
    /// The lease's fault if it entered the error state.
    fn lease_wait(&self, lease: &ManagedObjectRef) -> Result<LeaseInfo>;

    /// Report overall progress and keep the lease alive.
    fn lease_progress(&self, lease: &ManagedObjectRef, percent: u8) -> Result<()>;

    /// Checksums the platform computed over received files.
    fn lease_manifest(&self, lease: &ManagedObjectRef) -> Result<Vec<ServerChecksum>>;

    fn lease_complete(&self, lease: &ManagedObjectRef) -> Result<()>;

    /// Abort the lease, optionally naming the file that caused it.
    fn lease_abort(&self, lease: &ManagedObjectRef, file: Option<&str>) -> Result<()>;
}

/// Identity of the platform endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AboutInfo {
    pub name: String,
    pub version: String,
    pub vendor: String,
}

/// Virtual machine operations used after deployment.
pub trait VmApi: Send + Sync {
    fn about(&self) -> AboutInfo;

    fn power_on(&self, vm: &ManagedObjectRef) -> Result<()>;

    fn mark_as_template(&self, vm: &ManagedObjectRef) -> Result<()>;

    /// Apply extra-config key/value entries.
    fn reconfigure(&self, vm: &ManagedObjectRef, extra_config: &[(String, String)]) -> Result<()>;

    /// Block until the guest reports an IP address.
    fn wait_for_ip(&self, vm: &ManagedObjectRef, cancel: &CancelToken) -> Result<String>;
}

/// Trust material for a transfer connection.
///
/// When the platform supplies a thumbprint or certificate, only that
/// material may be used to verify the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Trust {
    /// Default system roots.
    #[default]
    System,
    /// SHA1 thumbprint of the expected peer certificate.
    Thumbprint(String),
    /// PEM certificate of the expected peer.
    Certificate(String),
}

impl Trust {
    /// Trust from an optional thumbprint.
    pub fn from_thumbprint(thumbprint: Option<&str>) -> Self {
        match thumbprint {
            Some(t) if !t.is_empty() => Self::Thumbprint(t.to_string()),
            _ => Self::System,
        }
    }
}

/// HTTP method for an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Put,
    Post,
}

/// Parameters of one upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    pub method: Method,
    pub content_type: Option<String>,
    /// Declared up front; the body must be exactly this long.
    pub content_length: u64,
    pub headers: Vec<(String, String)>,
    pub trust: Trust,
}

impl UploadOptions {
    /// Plain `PUT` of `content_length` bytes.
    pub fn put(content_length: u64, trust: Trust) -> Self {
        Self {
            method: Method::Put,
            content_type: None,
            content_length,
            headers: Vec::new(),
            trust,
        }
    }
}

/// An opened download stream.
pub struct Download {
    pub reader: Box<dyn Read + Send>,
    pub content_length: Option<u64>,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Moves file bytes to and from transfer endpoints.
pub trait Transport: Send + Sync {
    fn upload(&self, url: &Url, body: &mut dyn Read, options: &UploadOptions) -> Result<()>;

    fn download(&self, url: &Url, trust: &Trust) -> Result<Download>;
}

/// Endpoint granted by a library session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEndpoint {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_certificate_thumbprint: Option<String>,
}

impl TransferEndpoint {
    /// The trust material to use for this endpoint.
    pub fn trust(&self) -> Trust {
        match (&self.ssl_certificate, &self.ssl_certificate_thumbprint) {
            (Some(cert), _) if !cert.is_empty() => Trust::Certificate(cert.clone()),
            (_, thumbprint) => Trust::from_thumbprint(thumbprint.as_deref()),
        }
    }
}

/// A file in a library update or download session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryFile {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<TransferEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Result of validating an update session before completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validation {
    pub has_errors: bool,
    pub missing_files: Vec<String>,
    /// `(file, message)` pairs.
    pub invalid_files: Vec<(String, String)>,
}

/// Content library update and download sessions.
pub trait LibraryApi: Send + Sync {
    fn create_update_session(&self, item_id: &str) -> Result<String>;

    /// Register a pushed file; the result carries its upload endpoint.
    fn add_file(
        &self,
        session: &str,
        name: &str,
        size: u64,
        checksum: Option<&Checksum>,
    ) -> Result<LibraryFile>;

    fn validate_update_session(&self, session: &str) -> Result<Validation>;

    fn complete_update_session(&self, session: &str) -> Result<()>;

    fn cancel_update_session(&self, session: &str) -> Result<()>;

    fn create_download_session(&self, item_id: &str) -> Result<String>;

    fn list_download_files(&self, session: &str) -> Result<Vec<LibraryFile>>;

    fn prepare_download_file(&self, session: &str, name: &str) -> Result<LibraryFile>;

    fn get_download_file(&self, session: &str, name: &str) -> Result<LibraryFile>;

    fn delete_download_session(&self, session: &str) -> Result<()>;
}

/// Everything an import plus post-deploy run needs.
pub trait Platform: Finder + OvfManager + LeaseApi + VmApi + Transport {}

impl<T> Platform for T where T: Finder + OvfManager + LeaseApi + VmApi + Transport {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_object_ref_parse() {
        let r: ManagedObjectRef = "DistributedVirtualPortgroup:dvportgroup-42".parse().unwrap();
        assert_eq!(r.kind, "DistributedVirtualPortgroup");
        assert_eq!(r.value, "dvportgroup-42");
        assert_eq!(r.to_string(), "DistributedVirtualPortgroup:dvportgroup-42");
    }

    #[test]
    fn test_managed_object_ref_rejects_names() {
        assert!("prod-net".parse::<ManagedObjectRef>().is_err());
        assert!(":network-1".parse::<ManagedObjectRef>().is_err());
        assert!("Network:".parse::<ManagedObjectRef>().is_err());
        assert!("VM Network:x".parse::<ManagedObjectRef>().is_err());
    }

    #[test]
    fn test_trust_from_thumbprint() {
        assert_eq!(Trust::from_thumbprint(None), Trust::System);
        assert_eq!(Trust::from_thumbprint(Some("")), Trust::System);
        assert_eq!(
            Trust::from_thumbprint(Some("AB:CD")),
            Trust::Thumbprint("AB:CD".to_string())
        );
    }

    #[test]
    fn test_endpoint_prefers_certificate() {
        let endpoint = TransferEndpoint {
            uri: "https://host/file".to_string(),
            ssl_certificate: Some("PEM".to_string()),
            ssl_certificate_thumbprint: Some("AB".to_string()),
        };
        assert_eq!(endpoint.trust(), Trust::Certificate("PEM".to_string()));
    }
}
