//! End-to-end package import.
//!
//! Reads the descriptor, builds the import spec against live inventory,
//! negotiates the lease and uploads every required file:
//!
//! ```text
//! descriptor -> name -> network map -> import spec -> manifest -> lease -> upload -> complete
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ovfimport_core::{DeploymentOptions, ImportConfig, Importer, Package, Target};
//! use ovfimport_core::sim::Simulator;
//! use std::path::Path;
//!
//! let platform = Simulator::new();
//! let mut package = Package::open(Path::new("/path/to/appliance.ova")).unwrap();
//! let importer = Importer::new(&platform, Target::default(), ImportConfig::verified());
//! let outcome = importer.import(&mut package, &DeploymentOptions::default()).unwrap();
//! println!("created {}", outcome.entity);
//! ```

use std::borrow::Cow;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::ImportConfig;
use crate::error::{Error, Result};
use crate::import_spec::{ImportSpecParams, SpecBuilder};
use crate::lease::LeaseUploader;
use crate::manifest::{Manifest, ManifestPolicy};
use crate::options::DeploymentOptions;
use crate::ovf::{make_properties_configurable, Envelope};
use crate::package::{manifest_name, Package};
use crate::platform::{Finder, LeaseApi, ManagedObjectRef, OvfManager, Transport};
use crate::progress::{NoProgress, ProgressListener};

/// Where imported entities are placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub pool: ManagedObjectRef,
    pub datastore: ManagedObjectRef,
    pub folder: Option<ManagedObjectRef>,
    pub host: Option<ManagedObjectRef>,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            pool: ManagedObjectRef::new("ResourcePool", "resgroup-1"),
            datastore: ManagedObjectRef::new("Datastore", "datastore-1"),
            folder: None,
            host: None,
        }
    }
}

/// Result of a successful import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    /// The created virtual machine or virtual app.
    pub entity: ManagedObjectRef,
    pub name: String,
    /// Non-fatal platform warnings.
    pub warnings: Vec<String>,
    /// Whether uploads were checked against the manifest.
    pub verified: bool,
}

static NO_PROGRESS: NoProgress = NoProgress;

/// Imports packages into one placement target.
pub struct Importer<'a, P: ?Sized> {
    platform: &'a P,
    target: Target,
    config: ImportConfig,
    listener: &'a dyn ProgressListener,
    cancel: CancelToken,
}

impl<'a, P> Importer<'a, P>
where
    P: Finder + OvfManager + LeaseApi + Transport + ?Sized,
{
    pub fn new(platform: &'a P, target: Target, config: ImportConfig) -> Self {
        Self {
            platform,
            target,
            config,
            listener: &NO_PROGRESS,
            cancel: CancelToken::new(),
        }
    }

    /// Report upload progress to `listener`.
    pub fn with_listener(mut self, listener: &'a dyn ProgressListener) -> Self {
        self.listener = listener;
        self
    }

    /// Stop when `cancel` is triggered.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Read the manifest next to `descriptor`.
    ///
    /// A missing manifest is an error under [`ManifestPolicy::Require`];
    /// under [`ManifestPolicy::Warn`] it is logged and `None` returned.
    pub fn read_manifest(&self, package: &mut Package, descriptor: &str) -> Result<Option<Manifest>> {
        let name = manifest_name(descriptor);
        match package.archive().open(&name) {
            Ok(member) => Ok(Some(Manifest::parse(member)?)),
            Err(e) if e.is_member_not_found() => match self.config.manifest_policy {
                ManifestPolicy::Require => Err(Error::manifest(format!(
                    "failed to read manifest {name:?}: not found in package"
                ))),
                ManifestPolicy::Warn => {
                    warn!(manifest = %name, "manifest not found, skipping checksum verification");
                    Ok(None)
                }
            },
            Err(e) => Err(Error::manifest(format!("failed to read manifest {name:?}: {e}"))),
        }
    }

    /// Import `package` with `options`.
    ///
    /// # Errors
    ///
    /// Descriptor and import spec errors are returned before any lease is
    /// negotiated. Transfer errors abort the lease first.
    pub fn import(&self, package: &mut Package, options: &DeploymentOptions) -> Result<ImportOutcome> {
        self.cancel.check()?;

        let descriptor = package.read_descriptor()?;
        let envelope = Envelope::parse(&descriptor.text)
            .map_err(|e| Error::descriptor(format!("failed to parse ovf: {e}")))?;

        let name = self.entity_name(&envelope, options);
        let text: Cow<'_, str> = if self.config.hidden && envelope.virtual_system.is_some() {
            make_properties_configurable(&descriptor.text)
        } else {
            Cow::Borrowed(descriptor.text.as_str())
        };
        info!(descriptor = %descriptor.name, name = %name, "importing package");

        let builder = SpecBuilder::new(self.platform);
        let networks = builder.network_map(&envelope, &options.network_mapping)?;
        let params = ImportSpecParams::new(options, &name, &self.config.locale, networks);

        let mut created = builder.create_spec(&text, &self.target.pool, &self.target.datastore, &params)?;
        if !options.annotation.is_empty() {
            created.spec.set_annotation(&options.annotation);
        }
        debug!(files = created.file_items.len(), "import spec created");

        let manifest = if self.config.verify_manifest {
            self.read_manifest(package, &descriptor.name)?
        } else {
            None
        };

        self.cancel.check()?;
        let lease = self.platform.import_vapp(
            &created.spec,
            &self.target.pool,
            self.target.folder.as_ref(),
            self.target.host.as_ref(),
        )?;
        debug!(lease = %lease, "import negotiated");

        let uploader = LeaseUploader::new(self.platform, &self.config, self.listener, &self.cancel);
        let entity = uploader.run(&lease, &created.file_items, package.archive(), manifest.as_ref())?;

        Ok(ImportOutcome {
            entity,
            name,
            warnings: created.warnings,
            verified: manifest.is_some(),
        })
    }

    /// Explicit name, else the virtual system's name or id, else the
    /// configured default.
    fn entity_name(&self, envelope: &Envelope, options: &DeploymentOptions) -> String {
        if let Some(name) = &options.name {
            return name.clone();
        }
        envelope
            .virtual_system
            .as_ref()
            .map(|vs| vs.name.clone().unwrap_or_else(|| vs.id.clone()))
            .unwrap_or_else(|| self.config.default_name.clone())
    }
}
