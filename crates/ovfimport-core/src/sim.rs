//! In-memory platform simulator.
//!
//! [`Simulator`] implements every platform trait against local state: a
//! network inventory, import spec synthesis from the descriptor, NFC leases
//! with thumbprint-checked upload URLs, virtual machines and content library
//! items. Faults can be injected to exercise the failure paths.
//!
//! The server computes SHA256 and the legacy SHA1 over received bytes.
//! [`Simulator::set_server_sha1`] replaces the reported SHA1 for one file.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::import_spec::{FileItem, ImportSpec, ImportSpecParams, ImportSpecResult, VAppImportSpec, VmImportSpec};
use crate::manifest::{digest, Checksum, ServerChecksum};
use crate::ovf::Envelope;
use crate::platform::{
    AboutInfo, DeviceUrl, Download, Finder, LeaseApi, LeaseInfo, LibraryApi, LibraryFile, ManagedObjectRef, Method,
    OvfManager, TransferEndpoint, Transport, Trust, UploadOptions, Validation, VmApi,
};
use crate::session::FileStatus;

/// Host serving simulated NFC lease URLs.
pub const NFC_HOST: &str = "esx.sim.local";
/// Host serving simulated content library transfers.
pub const LIBRARY_HOST: &str = "library.sim.local";
/// Thumbprint presented by every simulated endpoint.
pub const SIM_THUMBPRINT: &str = "5B:3C:0E:2A:91:7F:44:D8:6A:10:C2:B9:E3:58:0D:71:AF:26:93:4E";

/// Characters escaped in URL path segments.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Address reported by simulated guests unless changed.
pub const DEFAULT_GUEST_IP: &str = "10.0.0.42";

const WAIT_FOR_IP_POLL: Duration = Duration::from_millis(20);

/// Lifecycle of a simulated lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Initializing,
    Ready,
    Done,
    Error,
    Aborted,
}

/// One request received on a lease URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub url: String,
    pub method: Method,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub bytes: u64,
}

/// Snapshot of a lease for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseStatus {
    pub state: LeaseState,
    pub entity: ManagedObjectRef,
    /// File named by the abort, if any.
    pub aborted_file: Option<String>,
    pub uploads: Vec<UploadRecord>,
    /// Percentages reported through progress updates.
    pub progress: Vec<u8>,
    pub complete_calls: usize,
    pub abort_calls: usize,
}

/// Snapshot of a virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmStatus {
    pub name: String,
    pub annotation: String,
    pub powered_on: bool,
    pub template: bool,
    pub extra_config: BTreeMap<String, String>,
}

/// Virtual machine operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VmOp {
    PowerOn,
    MarkAsTemplate,
    Reconfigure,
    WaitForIp,
}

/// Lifecycle of a library update or download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibrarySessionState {
    Active,
    Completed,
    Cancelled,
    Deleted,
}

#[derive(Debug)]
struct Lease {
    state: LeaseState,
    entity: ManagedObjectRef,
    /// Device key, import key, file name.
    devices: Vec<(String, String, String)>,
    aborted_file: Option<String>,
    uploads: Vec<UploadRecord>,
    progress: Vec<u8>,
    checksums: BTreeMap<String, ServerChecksum>,
    complete_calls: usize,
    abort_calls: usize,
}

#[derive(Debug, Default)]
struct Vm {
    status: VmStatus,
}

#[derive(Debug)]
struct StagedFile {
    size: u64,
    checksum: Option<Checksum>,
    data: Option<Vec<u8>>,
}

#[derive(Debug)]
struct UpdateSession {
    item: String,
    state: LibrarySessionState,
    files: BTreeMap<String, StagedFile>,
}

#[derive(Debug)]
struct DownloadFile {
    status: FileStatus,
    polls_left: u32,
}

#[derive(Debug)]
struct DownloadSession {
    item: String,
    state: LibrarySessionState,
    files: BTreeMap<String, DownloadFile>,
}

#[derive(Debug, Default)]
struct Faults {
    spec_errors: Vec<String>,
    spec_warnings: Vec<String>,
    lease_wait: Option<String>,
    uploads: BTreeMap<String, String>,
    sha1: BTreeMap<String, String>,
    vm_ops: BTreeMap<VmOp, String>,
    rejected_files: BTreeMap<String, String>,
    prepare_errors: BTreeMap<String, String>,
    prepare_polls: u32,
}

#[derive(Debug)]
struct State {
    next_id: u64,
    networks: BTreeMap<String, ManagedObjectRef>,
    /// Import key to package file name, from the last specs created.
    spec_files: BTreeMap<String, String>,
    leases: BTreeMap<String, Lease>,
    vms: BTreeMap<String, Vm>,
    guest_ip: Option<String>,
    items: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    updates: BTreeMap<String, UpdateSession>,
    downloads: BTreeMap<String, DownloadSession>,
    faults: Faults,
}

impl State {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn lease(&mut self, lease: &ManagedObjectRef) -> Result<&mut Lease> {
        self.leases
            .get_mut(&lease.value)
            .ok_or_else(|| Error::not_found("lease", lease.to_string()))
    }

    fn vm(&mut self, vm: &ManagedObjectRef) -> Result<&mut Vm> {
        self.vms
            .get_mut(&vm.value)
            .ok_or_else(|| Error::not_found("virtual machine", vm.to_string()))
    }

    fn update(&mut self, session: &str) -> Result<&mut UpdateSession> {
        let update = self
            .updates
            .get_mut(session)
            .ok_or_else(|| Error::not_found("update session", session))?;
        if update.state != LibrarySessionState::Active {
            return Err(Error::session(format!("update session {session} is not active")));
        }
        Ok(update)
    }

    fn download(&mut self, session: &str) -> Result<&mut DownloadSession> {
        let download = self
            .downloads
            .get_mut(session)
            .ok_or_else(|| Error::not_found("download session", session))?;
        if download.state != LibrarySessionState::Active {
            return Err(Error::session(format!("download session {session} is not active")));
        }
        Ok(download)
    }

    fn fail(&self, op: VmOp) -> Result<()> {
        match self.faults.vm_ops.get(&op) {
            Some(message) => Err(Error::platform(message.clone())),
            None => Ok(()),
        }
    }
}

/// An in-memory platform.
#[derive(Debug)]
pub struct Simulator {
    state: Mutex<State>,
    about: AboutInfo,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    /// A simulator with a single `VM Network` network.
    pub fn new() -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(
            "VM Network".to_string(),
            ManagedObjectRef::new("Network", "network-7"),
        );
        Self {
            state: Mutex::new(State {
                next_id: 100,
                networks,
                spec_files: BTreeMap::new(),
                leases: BTreeMap::new(),
                vms: BTreeMap::new(),
                guest_ip: Some(DEFAULT_GUEST_IP.to_string()),
                items: BTreeMap::new(),
                updates: BTreeMap::new(),
                downloads: BTreeMap::new(),
                faults: Faults::default(),
            }),
            about: AboutInfo {
                name: "Platform Simulator".to_string(),
                version: "8.0.3".to_string(),
                vendor: "ovfimport".to_string(),
            },
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a distributed port group named `name` to the inventory.
    pub fn add_network(&self, name: &str) -> ManagedObjectRef {
        let mut state = self.state();
        let reference = ManagedObjectRef::new("DistributedVirtualPortgroup", state.next("dvportgroup"));
        state.networks.insert(name.to_string(), reference.clone());
        reference
    }

    /// Create a powered-off virtual machine.
    pub fn create_vm(&self, name: &str) -> ManagedObjectRef {
        let mut state = self.state();
        let value = state.next("vm");
        state.vms.insert(
            value.clone(),
            Vm {
                status: VmStatus {
                    name: name.to_string(),
                    ..VmStatus::default()
                },
            },
        );
        ManagedObjectRef::new("VirtualMachine", value)
    }

    /// Address guests report once powered on; `None` makes
    /// [`VmApi::wait_for_ip`] block until cancelled.
    pub fn set_guest_ip(&self, ip: Option<&str>) {
        self.state().guest_ip = ip.map(str::to_string);
    }

    /// Create a library item holding `files`.
    pub fn add_library_item(&self, item: &str, files: Vec<(String, Vec<u8>)>) {
        self.state()
            .items
            .insert(item.to_string(), files.into_iter().collect());
    }

    /// Append a hard error to every import spec response.
    pub fn inject_spec_error(&self, message: &str) {
        self.state().faults.spec_errors.push(message.to_string());
    }

    /// Append a warning to every import spec response.
    pub fn inject_spec_warning(&self, message: &str) {
        self.state().faults.spec_warnings.push(message.to_string());
    }

    /// Make every lease enter the error state instead of becoming ready.
    pub fn fail_lease_wait(&self, message: &str) {
        self.state().faults.lease_wait = Some(message.to_string());
    }

    /// Fail uploads of the file named `name`.
    pub fn fail_upload(&self, name: &str, message: &str) {
        self.state()
            .faults
            .uploads
            .insert(name.to_string(), message.to_string());
    }

    /// Report `sha1` as the legacy checksum of uploads of `name`.
    pub fn set_server_sha1(&self, name: &str, sha1: &str) {
        self.state()
            .faults
            .sha1
            .insert(name.to_string(), sha1.to_string());
    }

    pub fn fail_vm_op(&self, op: VmOp, message: &str) {
        self.state().faults.vm_ops.insert(op, message.to_string());
    }

    /// Answer `add_file` for `name` with an `ERROR` status.
    pub fn reject_library_file(&self, name: &str, message: &str) {
        self.state()
            .faults
            .rejected_files
            .insert(name.to_string(), message.to_string());
    }

    /// Make preparation of `name` end in the `ERROR` status.
    pub fn fail_prepare(&self, name: &str, message: &str) {
        self.state()
            .faults
            .prepare_errors
            .insert(name.to_string(), message.to_string());
    }

    /// Number of polls a download file stays in preparation.
    pub fn set_prepare_polls(&self, polls: u32) {
        self.state().faults.prepare_polls = polls;
    }

    pub fn lease_status(&self, lease: &ManagedObjectRef) -> Option<LeaseStatus> {
        self.state().leases.get(&lease.value).map(|l| LeaseStatus {
            state: l.state,
            entity: l.entity.clone(),
            aborted_file: l.aborted_file.clone(),
            uploads: l.uploads.clone(),
            progress: l.progress.clone(),
            complete_calls: l.complete_calls,
            abort_calls: l.abort_calls,
        })
    }

    /// Every lease granted so far, oldest first.
    pub fn leases(&self) -> Vec<ManagedObjectRef> {
        let state = self.state();
        let mut leases: Vec<_> = state.leases.keys().cloned().collect();
        leases.sort_by_key(|id| id_number(id));
        leases
            .into_iter()
            .map(|id| ManagedObjectRef::new("HttpNfcLease", id))
            .collect()
    }

    pub fn vm_status(&self, vm: &ManagedObjectRef) -> Option<VmStatus> {
        self.state().vms.get(&vm.value).map(|vm| vm.status.clone())
    }

    /// Contents of a committed library file.
    pub fn library_file(&self, item: &str, name: &str) -> Option<Vec<u8>> {
        self.state().items.get(item)?.get(name).cloned()
    }

    /// Every library session created so far with its state, oldest first.
    pub fn library_sessions(&self) -> Vec<(String, LibrarySessionState)> {
        let state = self.state();
        let mut sessions: Vec<_> = state
            .updates
            .iter()
            .map(|(id, s)| (id.clone(), s.state))
            .chain(state.downloads.iter().map(|(id, s)| (id.clone(), s.state)))
            .collect();
        sessions.sort_by_key(|(id, _)| id_number(id));
        sessions
    }

    fn create_spec(&self, envelope: &Envelope, params: &ImportSpecParams) -> ImportSpecResult {
        let mut state = self.state();
        let mut result = ImportSpecResult::default();
        let name = &params.entity_name;

        if !params.deployment_option.is_empty()
            && !envelope
                .deployment_options
                .iter()
                .any(|c| c.id == params.deployment_option)
        {
            result.errors.push(format!(
                "Invalid deployment configuration '{}'",
                params.deployment_option
            ));
        }

        for (key, value) in &params.property_mapping {
            let declared = envelope.virtual_system.iter().flat_map(|vs| &vs.products).find_map(|product| {
                product
                    .properties
                    .iter()
                    .find(|p| product.qualified_key(p) == *key)
            });
            match declared {
                None => result
                    .warnings
                    .push(format!("Property '{key}' is not defined in the descriptor")),
                Some(p) if p.user_configurable != Some(true) => result
                    .errors
                    .push(format!("Property '{key}' is not user configurable")),
                Some(p)
                    if p.r#type == "boolean"
                        && !value.eq_ignore_ascii_case("true")
                        && !value.eq_ignore_ascii_case("false") =>
                {
                    result
                        .errors
                        .push(format!("Invalid value '{value}' for boolean property '{key}'"))
                }
                Some(_) => {}
            }
        }

        for network in &envelope.networks {
            let mapped = params.network_mapping.iter().any(|b| b.name == network.name);
            if !mapped && !state.networks.contains_key(&network.name) {
                result
                    .errors
                    .push(format!("Network '{}' not found on the target host", network.name));
            }
        }

        result.errors.extend(state.faults.spec_errors.iter().cloned());
        result.warnings.extend(state.faults.spec_warnings.iter().cloned());
        if !result.errors.is_empty() {
            return result;
        }

        let mut devices = Vec::new();
        for (index, reference) in envelope.references.iter().enumerate() {
            let create = !envelope
                .disks
                .iter()
                .any(|d| d.file_ref.as_deref() == Some(reference.id.as_str()));
            let device_id = if create {
                format!("/{name}/file-{index}")
            } else {
                format!("/{name}/disk-{index}")
            };
            state.spec_files.insert(device_id.clone(), reference.href.clone());
            devices.push(device_id.clone());
            result.file_items.push(FileItem {
                device_id,
                path: reference.href.clone(),
                size: reference.size.unwrap_or_default(),
                create,
            });
        }

        let annotation = envelope
            .virtual_system
            .as_ref()
            .map(|vs| vs.annotations.join("\n"))
            .unwrap_or_default();
        result.spec = Some(if envelope.is_collection() {
            ImportSpec::VirtualApp(VAppImportSpec {
                name: name.clone(),
                annotation,
                devices,
                children: Vec::new(),
            })
        } else {
            ImportSpec::VirtualMachine(VmImportSpec {
                name: name.clone(),
                annotation,
                devices,
            })
        });
        result
    }

    fn upload_nfc(&self, url: &Url, data: Vec<u8>, options: &UploadOptions) -> Result<()> {
        let (lease_id, file) = nfc_target(url)?;
        let mut state = self.state();

        if let Some(message) = state.faults.uploads.get(&file) {
            return Err(Error::platform(format!("upload of {file} failed: {message}")));
        }
        let sha1 = match state.faults.sha1.get(&file) {
            Some(sha1) => sha1.clone(),
            None => hex::encode(Sha1::digest(&data)),
        };

        let lease = state.lease(&ManagedObjectRef::new("HttpNfcLease", &lease_id))?;
        if lease.state != LeaseState::Ready {
            return Err(Error::session(format!("lease {lease_id} is not ready")));
        }
        let key = lease
            .devices
            .iter()
            .find(|(_, _, name)| *name == file)
            .map(|(key, _, _)| key.clone())
            .ok_or_else(|| Error::not_found("lease device", url.as_str()))?;

        lease.uploads.push(UploadRecord {
            url: url.to_string(),
            method: options.method,
            content_type: options.content_type.clone(),
            headers: options.headers.clone(),
            bytes: data.len() as u64,
        });
        lease.checksums.insert(
            key.clone(),
            ServerChecksum {
                key,
                sha1,
                checksum: Some(hex::encode(Sha256::digest(&data))),
                checksum_type: Some("SHA256".to_string()),
                size: data.len() as u64,
            },
        );
        debug!(lease = %lease_id, file = %file, bytes = data.len(), "nfc upload received");
        Ok(())
    }

    fn upload_library(&self, url: &Url, data: Vec<u8>) -> Result<()> {
        let (session, name) = library_target(url, "update")?;
        let mut state = self.state();
        let update = state.update(&session)?;
        let staged = update
            .files
            .get_mut(&name)
            .ok_or_else(|| Error::not_found("session file", name.as_str()))?;
        staged.data = Some(data);
        Ok(())
    }
}

impl Finder for Simulator {
    fn network(&self, path: &str) -> Result<ManagedObjectRef> {
        let state = self.state();
        let name = path.rsplit('/').next().unwrap_or(path);
        state
            .networks
            .get(path)
            .or_else(|| state.networks.get(name))
            .cloned()
            .ok_or_else(|| Error::not_found("network", path))
    }
}

impl OvfManager for Simulator {
    fn create_import_spec(
        &self,
        descriptor: &str,
        _pool: &ManagedObjectRef,
        _datastore: &ManagedObjectRef,
        params: &ImportSpecParams,
    ) -> Result<ImportSpecResult> {
        let envelope = Envelope::parse(descriptor)?;
        Ok(self.create_spec(&envelope, params))
    }

    fn import_vapp(
        &self,
        spec: &ImportSpec,
        _pool: &ManagedObjectRef,
        _folder: Option<&ManagedObjectRef>,
        _host: Option<&ManagedObjectRef>,
    ) -> Result<ManagedObjectRef> {
        let mut state = self.state();

        let entity = match spec {
            ImportSpec::VirtualMachine(_) => ManagedObjectRef::new("VirtualMachine", state.next("vm")),
            ImportSpec::VirtualApp(_) => ManagedObjectRef::new("VirtualApp", state.next("resgroup-v")),
        };
        state.vms.insert(
            entity.value.clone(),
            Vm {
                status: VmStatus {
                    name: spec.name().to_string(),
                    annotation: spec.annotation().to_string(),
                    ..VmStatus::default()
                },
            },
        );

        let devices = spec
            .devices()
            .into_iter()
            .enumerate()
            .map(|(index, import_key)| {
                let file = state
                    .spec_files
                    .get(import_key)
                    .map(|path| path.rsplit('/').next().unwrap_or(path).to_string())
                    .unwrap_or_else(|| format!("device-{index}"));
                (format!("{}/{index}", entity.value), import_key.to_string(), file)
            })
            .collect();

        let id = state.next("lease");
        state.leases.insert(
            id.clone(),
            Lease {
                state: LeaseState::Initializing,
                entity,
                devices,
                aborted_file: None,
                uploads: Vec::new(),
                progress: Vec::new(),
                checksums: BTreeMap::new(),
                complete_calls: 0,
                abort_calls: 0,
            },
        );
        Ok(ManagedObjectRef::new("HttpNfcLease", id))
    }
}

impl LeaseApi for Simulator {
    fn lease_wait(&self, lease: &ManagedObjectRef) -> Result<LeaseInfo> {
        let mut state = self.state();
        let fault = state.faults.lease_wait.clone();
        let record = state.lease(lease)?;

        if let Some(message) = fault {
            record.state = LeaseState::Error;
            return Err(Error::platform(message));
        }
        if record.state != LeaseState::Initializing && record.state != LeaseState::Ready {
            return Err(Error::session(format!("lease {lease} is {:?}", record.state)));
        }
        record.state = LeaseState::Ready;

        let device_urls = record
            .devices
            .iter()
            .map(|(key, import_key, file)| DeviceUrl {
                key: key.clone(),
                import_key: import_key.clone(),
                url: sim_url(NFC_HOST, &["nfc", lease.value.as_str(), file.as_str()]),
                ssl_thumbprint: Some(SIM_THUMBPRINT.to_string()),
            })
            .collect();
        Ok(LeaseInfo {
            entity: record.entity.clone(),
            device_urls,
        })
    }

    fn lease_progress(&self, lease: &ManagedObjectRef, percent: u8) -> Result<()> {
        let mut state = self.state();
        let record = state.lease(lease)?;
        if record.state != LeaseState::Ready {
            return Err(Error::session(format!("lease {lease} is not ready")));
        }
        record.progress.push(percent);
        Ok(())
    }

    fn lease_manifest(&self, lease: &ManagedObjectRef) -> Result<Vec<ServerChecksum>> {
        let mut state = self.state();
        Ok(state.lease(lease)?.checksums.values().cloned().collect())
    }

    fn lease_complete(&self, lease: &ManagedObjectRef) -> Result<()> {
        let mut state = self.state();
        let record = state.lease(lease)?;
        record.complete_calls += 1;
        if record.state != LeaseState::Ready {
            return Err(Error::session(format!("cannot complete lease {lease} in state {:?}", record.state)));
        }
        record.state = LeaseState::Done;
        Ok(())
    }

    fn lease_abort(&self, lease: &ManagedObjectRef, file: Option<&str>) -> Result<()> {
        let mut state = self.state();
        let record = state.lease(lease)?;
        record.abort_calls += 1;
        if record.state == LeaseState::Done {
            return Err(Error::session(format!("lease {lease} is already complete")));
        }
        record.state = LeaseState::Aborted;
        record.aborted_file = file.map(str::to_string);
        Ok(())
    }
}

impl VmApi for Simulator {
    fn about(&self) -> AboutInfo {
        self.about.clone()
    }

    fn power_on(&self, vm: &ManagedObjectRef) -> Result<()> {
        let mut state = self.state();
        state.fail(VmOp::PowerOn)?;
        let record = state.vm(vm)?;
        if record.status.template {
            return Err(Error::platform("cannot power on a template"));
        }
        record.status.powered_on = true;
        Ok(())
    }

    fn mark_as_template(&self, vm: &ManagedObjectRef) -> Result<()> {
        let mut state = self.state();
        state.fail(VmOp::MarkAsTemplate)?;
        let record = state.vm(vm)?;
        if record.status.powered_on {
            return Err(Error::platform("cannot mark a powered on VM as template"));
        }
        record.status.template = true;
        Ok(())
    }

    fn reconfigure(&self, vm: &ManagedObjectRef, extra_config: &[(String, String)]) -> Result<()> {
        let mut state = self.state();
        state.fail(VmOp::Reconfigure)?;
        let record = state.vm(vm)?;
        for (key, value) in extra_config {
            record.status.extra_config.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn wait_for_ip(&self, vm: &ManagedObjectRef, cancel: &CancelToken) -> Result<String> {
        loop {
            {
                let mut state = self.state();
                state.fail(VmOp::WaitForIp)?;
                let ip = state.guest_ip.clone();
                let record = state.vm(vm)?;
                if !record.status.powered_on {
                    return Err(Error::platform(format!("{vm} is powered off")));
                }
                if let Some(ip) = ip {
                    return Ok(ip);
                }
            }
            cancel.sleep(WAIT_FOR_IP_POLL)?;
        }
    }
}

impl Transport for Simulator {
    fn upload(&self, url: &Url, body: &mut dyn Read, options: &UploadOptions) -> Result<()> {
        check_trust(url, &options.trust)?;

        let mut data = Vec::new();
        body.read_to_end(&mut data)?;
        if data.len() as u64 != options.content_length {
            return Err(Error::platform(format!(
                "{url}: declared {} bytes, sent {}",
                options.content_length,
                data.len()
            )));
        }

        match url.host_str() {
            Some(NFC_HOST) => self.upload_nfc(url, data, options),
            Some(LIBRARY_HOST) => self.upload_library(url, data),
            _ => Err(Error::not_found("endpoint", url.as_str())),
        }
    }

    fn download(&self, url: &Url, trust: &Trust) -> Result<Download> {
        check_trust(url, trust)?;
        let (session, name) = library_target(url, "download")?;

        let mut state = self.state();
        let download = state.download(&session)?;
        let status = download
            .files
            .get(&name)
            .map(|f| f.status)
            .ok_or_else(|| Error::not_found("session file", name.as_str()))?;
        if status != FileStatus::Prepared {
            return Err(Error::session(format!("{name} is not prepared")));
        }
        let item = download.item.clone();
        let data = state
            .items
            .get(&item)
            .and_then(|files| files.get(&name))
            .cloned()
            .ok_or_else(|| Error::not_found("library file", name.as_str()))?;

        Ok(Download {
            content_length: Some(data.len() as u64),
            reader: Box::new(Cursor::new(data)),
        })
    }
}

impl LibraryApi for Simulator {
    fn create_update_session(&self, item_id: &str) -> Result<String> {
        let mut state = self.state();
        if !state.items.contains_key(item_id) {
            return Err(Error::not_found("library item", item_id));
        }
        let id = state.next("update");
        state.updates.insert(
            id.clone(),
            UpdateSession {
                item: item_id.to_string(),
                state: LibrarySessionState::Active,
                files: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn add_file(&self, session: &str, name: &str, size: u64, checksum: Option<&Checksum>) -> Result<LibraryFile> {
        let mut state = self.state();
        let rejected = state.faults.rejected_files.get(name).cloned();
        let update = state.update(session)?;

        if let Some(message) = rejected {
            return Ok(LibraryFile {
                name: name.to_string(),
                size,
                status: FileStatus::Error,
                endpoint: None,
                checksum: checksum.cloned(),
                error_message: Some(message),
            });
        }

        update.files.insert(
            name.to_string(),
            StagedFile {
                size,
                checksum: checksum.cloned(),
                data: None,
            },
        );
        Ok(LibraryFile {
            name: name.to_string(),
            size,
            status: FileStatus::Ready,
            endpoint: Some(endpoint(&["update", session, name])),
            checksum: checksum.cloned(),
            error_message: None,
        })
    }

    fn validate_update_session(&self, session: &str) -> Result<Validation> {
        let mut state = self.state();
        let update = state.update(session)?;
        let mut validation = Validation::default();

        for (name, staged) in &update.files {
            let Some(data) = &staged.data else {
                validation.missing_files.push(name.clone());
                continue;
            };
            if data.len() as u64 != staged.size {
                validation.invalid_files.push((
                    name.clone(),
                    format!("expected {} bytes, received {}", staged.size, data.len()),
                ));
                continue;
            }
            if let Some(sum) = &staged.checksum {
                if let Some(actual) = digest(data.as_slice(), &sum.algorithm)? {
                    if !actual.eq_ignore_ascii_case(&sum.checksum) {
                        validation
                            .invalid_files
                            .push((name.clone(), format!("{} checksum mismatch", sum.algorithm)));
                    }
                }
            }
        }

        validation.has_errors = !validation.missing_files.is_empty() || !validation.invalid_files.is_empty();
        Ok(validation)
    }

    fn complete_update_session(&self, session: &str) -> Result<()> {
        let mut state = self.state();
        let update = state.update(session)?;
        update.state = LibrarySessionState::Completed;

        let item = update.item.clone();
        let files: Vec<(String, Vec<u8>)> = update
            .files
            .iter()
            .filter_map(|(name, staged)| staged.data.clone().map(|d| (name.clone(), d)))
            .collect();
        state.items.entry(item).or_default().extend(files);
        Ok(())
    }

    fn cancel_update_session(&self, session: &str) -> Result<()> {
        let mut state = self.state();
        state.update(session)?.state = LibrarySessionState::Cancelled;
        Ok(())
    }

    fn create_download_session(&self, item_id: &str) -> Result<String> {
        let mut state = self.state();
        let files = state
            .items
            .get(item_id)
            .ok_or_else(|| Error::not_found("library item", item_id))?
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    DownloadFile {
                        status: FileStatus::Ready,
                        polls_left: 0,
                    },
                )
            })
            .collect();
        let id = state.next("download");
        state.downloads.insert(
            id.clone(),
            DownloadSession {
                item: item_id.to_string(),
                state: LibrarySessionState::Active,
                files,
            },
        );
        Ok(id)
    }

    fn list_download_files(&self, session: &str) -> Result<Vec<LibraryFile>> {
        let mut state = self.state();
        let download = state.download(session)?;
        let item = download.item.clone();
        let statuses: Vec<(String, FileStatus)> =
            download.files.iter().map(|(n, f)| (n.clone(), f.status)).collect();

        Ok(statuses
            .into_iter()
            .map(|(name, status)| {
                let size = state
                    .items
                    .get(&item)
                    .and_then(|files| files.get(&name))
                    .map_or(0, |d| d.len() as u64);
                LibraryFile {
                    name,
                    size,
                    status,
                    endpoint: None,
                    checksum: None,
                    error_message: None,
                }
            })
            .collect())
    }

    fn prepare_download_file(&self, session: &str, name: &str) -> Result<LibraryFile> {
        let mut state = self.state();
        let polls = state.faults.prepare_polls;
        let file = state
            .download(session)?
            .files
            .get_mut(name)
            .ok_or_else(|| Error::not_found("library file", name))?;
        file.status = FileStatus::PrepareRequested;
        file.polls_left = polls;

        Ok(LibraryFile {
            name: name.to_string(),
            size: 0,
            status: FileStatus::PrepareRequested,
            endpoint: None,
            checksum: None,
            error_message: None,
        })
    }

    fn get_download_file(&self, session: &str, name: &str) -> Result<LibraryFile> {
        let mut state = self.state();
        let failure = state.faults.prepare_errors.get(name).cloned();
        let download = state.download(session)?;
        let item = download.item.clone();
        let file = download
            .files
            .get_mut(name)
            .ok_or_else(|| Error::not_found("library file", name))?;

        let mut error_message = None;
        if let Some(message) = failure {
            file.status = FileStatus::Error;
            error_message = Some(message);
        } else if file.status == FileStatus::PrepareRequested {
            if file.polls_left == 0 {
                file.status = FileStatus::Prepared;
            } else {
                file.polls_left -= 1;
            }
        }
        let status = file.status;

        let size = state
            .items
            .get(&item)
            .and_then(|files| files.get(name))
            .map_or(0, |d| d.len() as u64);
        Ok(LibraryFile {
            name: name.to_string(),
            size,
            status,
            endpoint: (status == FileStatus::Prepared).then(|| endpoint(&["download", session, name])),
            checksum: None,
            error_message,
        })
    }

    fn delete_download_session(&self, session: &str) -> Result<()> {
        let mut state = self.state();
        state
            .downloads
            .get_mut(session)
            .ok_or_else(|| Error::not_found("download session", session))?
            .state = LibrarySessionState::Deleted;
        Ok(())
    }
}

fn endpoint(segments: &[&str]) -> TransferEndpoint {
    TransferEndpoint {
        uri: sim_url(LIBRARY_HOST, segments),
        ssl_certificate: None,
        ssl_certificate_thumbprint: Some(SIM_THUMBPRINT.to_string()),
    }
}

/// Simulated endpoints only accept connections pinned to their thumbprint.
fn check_trust(url: &Url, trust: &Trust) -> Result<()> {
    match trust {
        Trust::Thumbprint(t) if t.eq_ignore_ascii_case(SIM_THUMBPRINT) => Ok(()),
        Trust::Thumbprint(t) => Err(Error::platform(format!(
            "{url}: certificate thumbprint {t} does not match the server"
        ))),
        Trust::Certificate(_) => Err(Error::platform(format!("{url}: certificate does not match the server"))),
        Trust::System => Err(Error::platform(format!(
            "{url}: certificate signed by unknown authority"
        ))),
    }
}

/// `https://{host}/{segments}` with each segment percent-encoded.
fn sim_url(host: &str, segments: &[&str]) -> String {
    let path: Vec<String> = segments
        .iter()
        .map(|s| utf8_percent_encode(s, SEGMENT).to_string())
        .collect();
    format!("https://{host}/{}", path.join("/"))
}

/// Decoded path segments of `url`.
fn segments(url: &Url) -> Option<Vec<String>> {
    url.path_segments()?
        .map(|s| percent_decode_str(s).decode_utf8().ok().map(|s| s.into_owned()))
        .collect()
}

/// `/nfc/{lease}/{file}`
fn nfc_target(url: &Url) -> Result<(String, String)> {
    match segments(url).as_deref() {
        Some([nfc, lease, file]) if nfc == "nfc" => Ok((lease.clone(), file.clone())),
        _ => Err(Error::not_found("lease device", url.as_str())),
    }
}

/// `/{kind}/{session}/{name}`
fn library_target(url: &Url, kind: &str) -> Result<(String, String)> {
    match segments(url).as_deref() {
        Some([k, session, name]) if k == kind => Ok((session.clone(), name.clone())),
        _ => Err(Error::not_found("library endpoint", url.as_str())),
    }
}

fn id_number(id: &str) -> u64 {
    id.rsplit('-').next().and_then(|n| n.parse().ok()).unwrap_or_default()
}
