//! End-to-end import tests against the simulator.

mod common;

use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

use ovfimport_core::import_spec::{ImportSpec, ImportSpecParams, ImportSpecResult, SpecBuilder};
use ovfimport_core::lease::STREAM_VMDK_CONTENT_TYPE;
use ovfimport_core::options;
use ovfimport_core::platform::{
    Download, Finder, LeaseApi, LeaseInfo, Method, OvfManager, Transport, Trust, UploadOptions,
};
use ovfimport_core::manifest::ServerChecksum;
use ovfimport_core::sim::{LeaseState, Simulator};
use ovfimport_core::{
    CancelToken, DeployReport, Deployer, DeploymentOptions, Envelope, Error, ImportConfig, Importer,
    ManagedObjectRef, NetworkMapping, Overrides, Package, Progress, Step, Target,
};
use tempfile::TempDir;
use url::Url;

fn resolved(overrides: Overrides) -> DeploymentOptions {
    let envelope = Envelope::parse(&common::descriptor()).unwrap();
    let mut options = options::resolve(&envelope, false, false);
    options.apply(&overrides);
    options
}

/// Every lease the simulator granted ended in exactly one terminal state.
fn assert_no_active_lease(sim: &Simulator) {
    for lease in sim.leases() {
        let status = sim.lease_status(&lease).unwrap();
        assert!(
            matches!(status.state, LeaseState::Done | LeaseState::Aborted),
            "{lease} left in {:?}",
            status.state
        );
        assert_eq!(status.complete_calls + status.abort_calls, 1, "{lease}");
    }
}

fn write_package(dir: &Path, manifest: &str) -> Package {
    let path = common::write_dir(dir, Some(manifest));
    Package::open(&path).unwrap()
}

#[test]
fn test_end_to_end_import_and_power_on() {
    let dir = TempDir::new().unwrap();
    let path = common::write_ova(dir.path(), true);
    let sim = Simulator::new();
    let prod = sim.add_network("prod-net");

    let options = resolved(Overrides {
        network_mapping: vec![NetworkMapping::new("VM Network", "prod-net")],
        power_on: Some(true),
        ..Overrides::default()
    });

    let envelope = Envelope::parse(&common::descriptor()).unwrap();
    let bindings = SpecBuilder::new(&sim)
        .network_map(&envelope, &options.network_mapping)
        .unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].network, prod);

    let samples = Mutex::new(Vec::new());
    let listener = |p: &Progress| samples.lock().unwrap().push(p.clone());

    let mut package = Package::open(&path).unwrap();
    let outcome = Importer::new(&sim, Target::default(), ImportConfig::verified())
        .with_listener(&listener)
        .import(&mut package, &options)
        .unwrap();

    assert_eq!(outcome.name, "test-appliance");
    assert!(outcome.verified);
    assert!(outcome.warnings.is_empty());

    let lease = sim.leases().pop().unwrap();
    let status = sim.lease_status(&lease).unwrap();
    assert_eq!(status.state, LeaseState::Done);
    assert_eq!(status.entity, outcome.entity);
    assert_eq!(status.uploads.len(), 1);
    assert_eq!(status.uploads[0].method, Method::Post);
    assert_eq!(status.uploads[0].content_type.as_deref(), Some(STREAM_VMDK_CONTENT_TYPE));
    assert_eq!(status.uploads[0].bytes, common::DISK.len() as u64);
    assert!(status.uploads[0].url.ends_with("/disk.vmdk"));

    let vm = sim.vm_status(&outcome.entity).unwrap();
    assert_eq!(vm.name, "test-appliance");
    assert_eq!(vm.annotation, "Built by CI");

    let report: DeployReport = Deployer::new(&sim, "US", CancelToken::new())
        .deploy(&outcome.entity, &options)
        .unwrap();
    assert!(report.applied(Step::PowerOn));
    assert!(sim.vm_status(&outcome.entity).unwrap().powered_on);

    let samples = samples.into_inner().unwrap();
    let last = samples.iter().rev().find(|p| p.file == "disk.vmdk").unwrap();
    assert!(last.done);
    assert_eq!(last.transferred, common::DISK.len() as u64);
}

#[test]
fn test_import_from_directory_and_gzip_archive() {
    for gzip in [false, true] {
        let dir = TempDir::new().unwrap();
        let mut package = if gzip {
            Package::open(&common::write_ova_gz(dir.path())).unwrap()
        } else {
            common::write_dir(dir.path(), Some(&common::manifest(&common::descriptor())));
            Package::open(dir.path()).unwrap()
        };

        let sim = Simulator::new();
        let outcome = Importer::new(&sim, Target::default(), ImportConfig::strict())
            .import(&mut package, &resolved(Overrides::default()))
            .unwrap();
        assert!(outcome.verified, "gzip={gzip}");
        assert_no_active_lease(&sim);
    }
}

#[test]
fn test_import_from_relative_path() {
    let dir = TempDir::new_in(".").unwrap();
    assert!(dir.path().is_relative());
    let path = common::write_dir(dir.path(), Some(&common::manifest(&common::descriptor())));

    for target in [path.as_path(), dir.path()] {
        let sim = Simulator::new();
        let outcome = Importer::new(&sim, Target::default(), ImportConfig::strict())
            .import(&mut Package::open(target).unwrap(), &resolved(Overrides::default()))
            .unwrap();
        assert!(outcome.verified, "{}", target.display());
        assert_no_active_lease(&sim);
    }
}

#[test]
fn test_disk_name_with_space() {
    let dir = TempDir::new().unwrap();
    let descriptor = common::descriptor().replace("disk.vmdk", "my disk.vmdk");
    fs::write(dir.path().join("appliance.ovf"), &descriptor).unwrap();
    fs::write(dir.path().join("my disk.vmdk"), common::DISK).unwrap();
    fs::write(
        dir.path().join("appliance.mf"),
        format!("SHA256(my disk.vmdk)= {}\n", common::sha256(common::DISK)),
    )
    .unwrap();

    let sim = Simulator::new();
    let outcome = Importer::new(&sim, Target::default(), ImportConfig::strict())
        .import(&mut Package::open(dir.path()).unwrap(), &resolved(Overrides::default()))
        .unwrap();
    assert!(outcome.verified);

    let lease = sim.leases().pop().unwrap();
    let status = sim.lease_status(&lease).unwrap();
    assert_eq!(status.state, LeaseState::Done);
    assert!(status.uploads[0].url.ends_with("/my%20disk.vmdk"), "{}", status.uploads[0].url);
}

#[test]
fn test_explicit_name_and_annotation() {
    let dir = TempDir::new().unwrap();
    let mut package = Package::open(&common::write_ova(dir.path(), false)).unwrap();
    let sim = Simulator::new();

    let options = resolved(Overrides {
        name: Some("web-01".to_string()),
        annotation: Some("deployed by tests".to_string()),
        ..Overrides::default()
    });
    let outcome = Importer::new(&sim, Target::default(), ImportConfig::default())
        .import(&mut package, &options)
        .unwrap();

    assert_eq!(outcome.name, "web-01");
    assert!(!outcome.verified);
    let vm = sim.vm_status(&outcome.entity).unwrap();
    assert_eq!(vm.name, "web-01");
    assert_eq!(vm.annotation, "deployed by tests");
}

#[test]
fn test_network_reference_fallback() {
    let dir = TempDir::new().unwrap();
    let mut package = Package::open(&common::write_ova(dir.path(), false)).unwrap();
    let sim = Simulator::new();

    let target = "DistributedVirtualPortgroup:dvportgroup-999";
    let options = resolved(Overrides {
        network_mapping: vec![NetworkMapping::new("VM Network", target)],
        ..Overrides::default()
    });

    let envelope = Envelope::parse(&common::descriptor()).unwrap();
    let bindings = SpecBuilder::new(&sim)
        .network_map(&envelope, &options.network_mapping)
        .unwrap();
    assert_eq!(bindings[0].network, ManagedObjectRef::new("DistributedVirtualPortgroup", "dvportgroup-999"));

    Importer::new(&sim, Target::default(), ImportConfig::default())
        .import(&mut package, &options)
        .unwrap();
    assert_no_active_lease(&sim);
}

#[test]
fn test_unresolvable_network_fails_before_negotiation() {
    let dir = TempDir::new().unwrap();
    let mut package = Package::open(&common::write_ova(dir.path(), false)).unwrap();
    let sim = Simulator::new();

    let options = resolved(Overrides {
        network_mapping: vec![NetworkMapping::new("VM Network", "missing-net")],
        ..Overrides::default()
    });
    let err = Importer::new(&sim, Target::default(), ImportConfig::default())
        .import(&mut package, &options)
        .unwrap_err();

    assert!(matches!(err, Error::NotFound { .. }), "got {err:?}");
    assert!(sim.leases().is_empty());
}

#[test]
fn test_unknown_mapping_name_only_warns() {
    let dir = TempDir::new().unwrap();
    let mut package = Package::open(&common::write_ova(dir.path(), false)).unwrap();
    let sim = Simulator::new();

    let options = resolved(Overrides {
        network_mapping: vec![NetworkMapping::new("Backup Network", "VM Network")],
        ..Overrides::default()
    });
    Importer::new(&sim, Target::default(), ImportConfig::default())
        .import(&mut package, &options)
        .unwrap();
}

#[test]
fn test_platform_rejection_carries_hint() {
    let dir = TempDir::new().unwrap();
    let mut package = Package::open(&common::write_ova(dir.path(), true)).unwrap();
    let sim = Simulator::new();
    sim.inject_spec_error("Host does not support network 'VM Network'");
    sim.inject_spec_error("second error is not reported");

    let err = Importer::new(&sim, Target::default(), ImportConfig::verified())
        .import(&mut package, &resolved(Overrides::default()))
        .unwrap_err();

    match &err {
        Error::ImportSpecRejected { message, hint } => {
            assert_eq!(message, "Host does not support network 'VM Network'");
            assert_eq!(hint.as_deref(), Some("specify the network with an explicit NetworkMapping"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("(hint: "));
    assert!(sim.leases().is_empty());
}

#[test]
fn test_unknown_deployment_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut package = Package::open(&common::write_ova(dir.path(), false)).unwrap();
    let sim = Simulator::new();

    let options = resolved(Overrides {
        deployment: Some("huge".to_string()),
        ..Overrides::default()
    });
    let err = Importer::new(&sim, Target::default(), ImportConfig::default())
        .import(&mut package, &options)
        .unwrap_err();
    assert!(
        matches!(&err, Error::ImportSpecRejected { hint: Some(h), .. } if h.contains("AllDeploymentOptions")),
        "got {err:?}"
    );
}

#[test]
fn test_hidden_mode_allows_locked_properties() {
    let dir = TempDir::new().unwrap();
    let sim = Simulator::new();
    let envelope = Envelope::parse(&common::descriptor()).unwrap();
    let mut options = options::resolve(&envelope, true, false);
    options.apply(&Overrides {
        property_mapping: vec![ovfimport_core::Property::new("vami.build.app", "5678")],
        ..Overrides::default()
    });

    let mut package = Package::open(&common::write_ova(dir.path(), false)).unwrap();
    let err = Importer::new(&sim, Target::default(), ImportConfig::default())
        .import(&mut package, &options)
        .unwrap_err();
    assert!(err.to_string().contains("not user configurable"), "got {err}");

    let config = ImportConfig {
        hidden: true,
        ..ImportConfig::default()
    };
    let mut package = Package::open(&common::write_ova(dir.path(), false)).unwrap();
    Importer::new(&sim, Target::default(), config)
        .import(&mut package, &options)
        .unwrap();
}

#[test]
fn test_platform_warnings_are_returned() {
    let dir = TempDir::new().unwrap();
    let mut package = Package::open(&common::write_ova(dir.path(), false)).unwrap();
    let sim = Simulator::new();
    sim.inject_spec_warning("Unsupported hardware family 'vmx-99'");

    let outcome = Importer::new(&sim, Target::default(), ImportConfig::default())
        .import(&mut package, &resolved(Overrides::default()))
        .unwrap();
    assert_eq!(outcome.warnings, vec!["Unsupported hardware family 'vmx-99'"]);
}

#[test]
fn test_checksum_mismatch_aborts_lease() {
    let dir = TempDir::new().unwrap();
    let mut package = write_package(dir.path(), "SHA1(disk.vmdk)= deadbeef\n");
    let sim = Simulator::new();
    sim.set_server_sha1("disk.vmdk", "0123456789abcdef0123456789abcdef01234567");

    let err = Importer::new(&sim, Target::default(), ImportConfig::verified())
        .import(&mut package, &resolved(Overrides::default()))
        .unwrap_err();

    match &err {
        Error::Transfer { file, source } => {
            assert_eq!(file, "disk.vmdk");
            assert!(matches!(**source, Error::ChecksumMismatch { .. }), "got {source:?}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("disk.vmdk"));

    let lease = sim.leases().pop().unwrap();
    let status = sim.lease_status(&lease).unwrap();
    assert_eq!(status.state, LeaseState::Aborted);
    assert_eq!(status.aborted_file.as_deref(), Some("disk.vmdk"));
    assert_eq!(status.complete_calls, 0);
}

#[test]
fn test_matching_sha1_passes() {
    let dir = TempDir::new().unwrap();
    let sha1 = "0123456789abcdef0123456789abcdef01234567";
    let mut package = write_package(dir.path(), &format!("SHA1(disk.vmdk)= {}\n", sha1.to_uppercase()));
    let sim = Simulator::new();
    sim.set_server_sha1("disk.vmdk", sha1);

    let outcome = Importer::new(&sim, Target::default(), ImportConfig::verified())
        .import(&mut package, &resolved(Overrides::default()))
        .unwrap();
    assert!(outcome.verified);
}

#[test]
fn test_sha1_manifest_verified_by_server() {
    let dir = TempDir::new().unwrap();
    let manifest = format!(
        "SHA1(appliance.ovf)= {}\nSHA1(disk.vmdk)= {}\n",
        common::sha1(common::descriptor().as_bytes()),
        common::sha1(common::DISK)
    );
    let mut package = write_package(dir.path(), &manifest);
    let sim = Simulator::new();

    let outcome = Importer::new(&sim, Target::default(), ImportConfig::strict())
        .import(&mut package, &resolved(Overrides::default()))
        .unwrap();
    assert!(outcome.verified);
    assert_no_active_lease(&sim);
}

#[test]
fn test_manifest_without_entry_for_uploaded_file() {
    let dir = TempDir::new().unwrap();
    let mut package = write_package(dir.path(), "SHA256(other.vmdk)= 00\n");
    let sim = Simulator::new();

    let err = Importer::new(&sim, Target::default(), ImportConfig::verified())
        .import(&mut package, &resolved(Overrides::default()))
        .unwrap_err();
    assert!(
        err.to_string().contains("missing checksum for disk.vmdk in manifest file"),
        "got {err}"
    );
    assert_no_active_lease(&sim);
}

#[test]
fn test_missing_manifest_policy() {
    let dir = TempDir::new().unwrap();
    let path = common::write_ova(dir.path(), false);
    let sim = Simulator::new();

    let err = Importer::new(&sim, Target::default(), ImportConfig::strict())
        .import(&mut Package::open(&path).unwrap(), &resolved(Overrides::default()))
        .unwrap_err();
    assert!(matches!(err, Error::Manifest { .. }), "got {err:?}");
    assert!(sim.leases().is_empty());

    let outcome = Importer::new(&sim, Target::default(), ImportConfig::verified())
        .import(&mut Package::open(&path).unwrap(), &resolved(Overrides::default()))
        .unwrap();
    assert!(!outcome.verified);
}

#[test]
fn test_upload_failure_aborts_lease() {
    let dir = TempDir::new().unwrap();
    let mut package = Package::open(&common::write_ova(dir.path(), true)).unwrap();
    let sim = Simulator::new();
    sim.fail_upload("disk.vmdk", "connection reset by peer");

    let err = Importer::new(&sim, Target::default(), ImportConfig::verified())
        .import(&mut package, &resolved(Overrides::default()))
        .unwrap_err();

    assert!(matches!(&err, Error::Transfer { file, .. } if file == "disk.vmdk"), "got {err:?}");
    assert!(err.to_string().contains("connection reset by peer"));
    assert_no_active_lease(&sim);
}

#[test]
fn test_lease_wait_failure_aborts_lease() {
    let dir = TempDir::new().unwrap();
    let mut package = Package::open(&common::write_ova(dir.path(), false)).unwrap();
    let sim = Simulator::new();
    sim.fail_lease_wait("Insufficient disk space on datastore");

    let err = Importer::new(&sim, Target::default(), ImportConfig::default())
        .import(&mut package, &resolved(Overrides::default()))
        .unwrap_err();

    assert_eq!(err.to_string(), "platform error: Insufficient disk space on datastore");
    let lease = sim.leases().pop().unwrap();
    let status = sim.lease_status(&lease).unwrap();
    assert_eq!(status.state, LeaseState::Aborted);
    assert_eq!(status.abort_calls, 1);
}

#[test]
fn test_created_files_are_put_with_overwrite() {
    let dir = TempDir::new().unwrap();
    let iso = vec![7u8; 300];
    fs::write(dir.path().join("appliance.ovf"), common::descriptor_with_iso(iso.len())).unwrap();
    fs::write(dir.path().join("disk.vmdk"), common::DISK).unwrap();
    fs::write(dir.path().join("tools.iso"), &iso).unwrap();

    let sim = Simulator::new();
    let mut package = Package::open(dir.path()).unwrap();
    Importer::new(&sim, Target::default(), ImportConfig::default())
        .import(&mut package, &resolved(Overrides::default()))
        .unwrap();

    let lease = sim.leases().pop().unwrap();
    let uploads = sim.lease_status(&lease).unwrap().uploads;
    assert_eq!(uploads.len(), 2);

    let iso_upload = uploads.iter().find(|u| u.url.ends_with("/tools.iso")).unwrap();
    assert_eq!(iso_upload.method, Method::Put);
    assert_eq!(iso_upload.content_type, None);
    assert_eq!(iso_upload.headers, vec![("Overwrite".to_string(), "t".to_string())]);
    assert_eq!(iso_upload.bytes, 300);
}

#[test]
fn test_session_invariant_across_scenarios() {
    let dir = TempDir::new().unwrap();
    let path = common::write_ova(dir.path(), true);
    let sim = Simulator::new();
    let options = resolved(Overrides::default());
    let importer = Importer::new(&sim, Target::default(), ImportConfig::verified());

    importer.import(&mut Package::open(&path).unwrap(), &options).unwrap();
    sim.set_server_sha1("disk.vmdk", "ffff");
    importer.import(&mut Package::open(&path).unwrap(), &options).unwrap();
    sim.fail_upload("disk.vmdk", "broken pipe");
    assert!(importer.import(&mut Package::open(&path).unwrap(), &options).is_err());

    assert_eq!(sim.leases().len(), 3);
    assert_no_active_lease(&sim);
}

#[test]
fn test_cancelled_before_start() {
    let dir = TempDir::new().unwrap();
    let mut package = Package::open(&common::write_ova(dir.path(), false)).unwrap();
    let sim = Simulator::new();
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = Importer::new(&sim, Target::default(), ImportConfig::default())
        .with_cancel(cancel)
        .import(&mut package, &resolved(Overrides::default()))
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(sim.leases().is_empty());
}

/// Delegates to the simulator but cancels as the first upload starts.
struct CancelOnUpload<'a> {
    sim: &'a Simulator,
    cancel: CancelToken,
}

impl Finder for CancelOnUpload<'_> {
    fn network(&self, path: &str) -> ovfimport_core::Result<ManagedObjectRef> {
        self.sim.network(path)
    }
}

impl OvfManager for CancelOnUpload<'_> {
    fn create_import_spec(
        &self,
        descriptor: &str,
        pool: &ManagedObjectRef,
        datastore: &ManagedObjectRef,
        params: &ImportSpecParams,
    ) -> ovfimport_core::Result<ImportSpecResult> {
        self.sim.create_import_spec(descriptor, pool, datastore, params)
    }

    fn import_vapp(
        &self,
        spec: &ImportSpec,
        pool: &ManagedObjectRef,
        folder: Option<&ManagedObjectRef>,
        host: Option<&ManagedObjectRef>,
    ) -> ovfimport_core::Result<ManagedObjectRef> {
        self.sim.import_vapp(spec, pool, folder, host)
    }
}

impl LeaseApi for CancelOnUpload<'_> {
    fn lease_wait(&self, lease: &ManagedObjectRef) -> ovfimport_core::Result<LeaseInfo> {
        self.sim.lease_wait(lease)
    }

    fn lease_progress(&self, lease: &ManagedObjectRef, percent: u8) -> ovfimport_core::Result<()> {
        self.sim.lease_progress(lease, percent)
    }

    fn lease_manifest(&self, lease: &ManagedObjectRef) -> ovfimport_core::Result<Vec<ServerChecksum>> {
        self.sim.lease_manifest(lease)
    }

    fn lease_complete(&self, lease: &ManagedObjectRef) -> ovfimport_core::Result<()> {
        self.sim.lease_complete(lease)
    }

    fn lease_abort(&self, lease: &ManagedObjectRef, file: Option<&str>) -> ovfimport_core::Result<()> {
        self.sim.lease_abort(lease, file)
    }
}

impl Transport for CancelOnUpload<'_> {
    fn upload(&self, url: &Url, body: &mut dyn Read, options: &UploadOptions) -> ovfimport_core::Result<()> {
        self.cancel.cancel();
        self.sim.upload(url, body, options)
    }

    fn download(&self, url: &Url, trust: &Trust) -> ovfimport_core::Result<Download> {
        self.sim.download(url, trust)
    }
}

#[test]
fn test_cancelled_mid_upload_aborts_lease() {
    let dir = TempDir::new().unwrap();
    let mut package = Package::open(&common::write_ova(dir.path(), true)).unwrap();
    let sim = Simulator::new();
    let cancel = CancelToken::new();
    let platform = CancelOnUpload {
        sim: &sim,
        cancel: cancel.clone(),
    };

    let err = Importer::new(&platform, Target::default(), ImportConfig::verified())
        .with_cancel(cancel)
        .import(&mut package, &resolved(Overrides::default()))
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled), "got {err:?}");
    let lease = sim.leases().pop().unwrap();
    let status = sim.lease_status(&lease).unwrap();
    assert_eq!(status.state, LeaseState::Aborted);
    assert!(status.uploads.is_empty());
}
