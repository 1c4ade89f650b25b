//! Import spec construction.
//!
//! Maps the operator's network choices onto live inventory, then asks the
//! platform to synthesize the low-level import spec. Platform errors are
//! fatal, warnings are only logged.

use std::fmt;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::options::{DeploymentOptions, DiskProvisioning, IpAllocationPolicy, IpProtocol, NetworkMapping};
use crate::ovf::Envelope;
use crate::platform::{Finder, ManagedObjectRef, OvfManager};

/// A descriptor network bound to a platform network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBinding {
    pub name: String,
    pub network: ManagedObjectRef,
}

/// Parameters of an import spec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpecParams {
    pub entity_name: String,
    pub locale: String,
    pub deployment_option: String,
    pub disk_provisioning: DiskProvisioning,
    pub ip_allocation_policy: IpAllocationPolicy,
    pub ip_protocol: IpProtocol,
    /// `(key, value)` property overrides.
    pub property_mapping: Vec<(String, String)>,
    pub network_mapping: Vec<NetworkBinding>,
}

impl ImportSpecParams {
    /// Build request parameters from resolved options.
    pub fn new(
        options: &DeploymentOptions,
        entity_name: impl Into<String>,
        locale: impl Into<String>,
        network_mapping: Vec<NetworkBinding>,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            locale: locale.into(),
            deployment_option: options.deployment.clone(),
            disk_provisioning: options.disk_provisioning,
            ip_allocation_policy: options.ip_allocation_policy,
            ip_protocol: options.ip_protocol,
            property_mapping: options
                .property_mapping
                .iter()
                .map(|p| (p.key.clone(), p.value.clone()))
                .collect(),
            network_mapping,
        }
    }
}

/// Import spec for a single virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmImportSpec {
    pub name: String,
    pub annotation: String,
    /// Import keys of the file-backed devices.
    pub devices: Vec<String>,
}

/// Import spec for a multi-VM application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VAppImportSpec {
    pub name: String,
    pub annotation: String,
    pub devices: Vec<String>,
    pub children: Vec<ImportSpec>,
}

/// The platform-synthesized import spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportSpec {
    VirtualMachine(VmImportSpec),
    VirtualApp(VAppImportSpec),
}

impl ImportSpec {
    pub fn name(&self) -> &str {
        match self {
            ImportSpec::VirtualMachine(vm) => &vm.name,
            ImportSpec::VirtualApp(vapp) => &vapp.name,
        }
    }

    pub fn annotation(&self) -> &str {
        match self {
            ImportSpec::VirtualMachine(vm) => &vm.annotation,
            ImportSpec::VirtualApp(vapp) => &vapp.annotation,
        }
    }

    /// Set the annotation on the entity-level config of either shape.
    pub fn set_annotation(&mut self, annotation: impl Into<String>) {
        match self {
            ImportSpec::VirtualMachine(vm) => vm.annotation = annotation.into(),
            ImportSpec::VirtualApp(vapp) => vapp.annotation = annotation.into(),
        }
    }

    /// Import keys of every file-backed device, children included.
    pub fn devices(&self) -> Vec<&str> {
        match self {
            ImportSpec::VirtualMachine(vm) => vm.devices.iter().map(String::as_str).collect(),
            ImportSpec::VirtualApp(vapp) => {
                let mut devices: Vec<&str> = vapp.devices.iter().map(String::as_str).collect();
                for child in &vapp.children {
                    devices.extend(child.devices());
                }
                devices
            }
        }
    }
}

/// A file the platform requires to be uploaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileItem {
    /// Matches a lease device URL's import key.
    pub device_id: String,
    /// Package member name.
    pub path: String,
    pub size: u64,
    /// Created as a plain file instead of streamed into a disk.
    pub create: bool,
}

/// Raw platform response to an import spec request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSpecResult {
    pub spec: Option<ImportSpec>,
    pub file_items: Vec<FileItem>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// An accepted import spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSpec {
    pub spec: ImportSpec,
    pub file_items: Vec<FileItem>,
    pub warnings: Vec<String>,
}

/// A mapping whose source name is not declared by the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNetwork {
    pub name: String,
    pub declared: Vec<String>,
}

impl fmt::Display for UnknownNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid NetworkMapping.Name={:?}, valid names={:?}",
            self.name, self.declared
        )
    }
}

/// Check that a mapping's source name is declared by the descriptor.
pub fn validate_network(
    envelope: &Envelope,
    mapping: &NetworkMapping,
) -> std::result::Result<(), UnknownNetwork> {
    if envelope.networks.iter().any(|n| n.name == mapping.name) {
        return Ok(());
    }
    Err(UnknownNetwork {
        name: mapping.name.clone(),
        declared: envelope.networks.iter().map(|n| n.name.clone()).collect(),
    })
}

/// Reconfiguration hint for a platform rejection message.
pub fn hint_for(message: &str) -> Option<&'static str> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("network") {
        Some("specify the network with an explicit NetworkMapping")
    } else if lower.contains("deployment") || lower.contains("configuration") {
        Some("choose a Deployment listed in AllDeploymentOptions")
    } else if lower.contains("property") {
        Some("override it with a PropertyMapping (use hidden mode for non-configurable properties)")
    } else if lower.contains("provision") {
        Some("choose a DiskProvisioning from AllDiskProvisioningOptions")
    } else {
        None
    }
}

/// Builds import specs against a platform.
pub struct SpecBuilder<'a, P: ?Sized> {
    platform: &'a P,
}

impl<'a, P> SpecBuilder<'a, P>
where
    P: Finder + OvfManager + ?Sized,
{
    pub fn new(platform: &'a P) -> Self {
        Self { platform }
    }

    /// Resolve every mapping with a non-empty target.
    ///
    /// A target unknown to the finder is accepted when it parses as a
    /// `Type:value` object reference; otherwise the lookup error stands.
    /// Mappings for networks the descriptor does not declare only warn.
    pub fn network_map(
        &self,
        envelope: &Envelope,
        mappings: &[NetworkMapping],
    ) -> Result<Vec<NetworkBinding>> {
        let mut bindings = Vec::new();

        for mapping in mappings {
            if mapping.network.is_empty() {
                continue;
            }
            if let Err(unknown) = validate_network(envelope, mapping) {
                warn!("{unknown}");
            }

            let network = match self.platform.network(&mapping.network) {
                Ok(found) => found,
                Err(Error::NotFound { kind, path }) => match mapping.network.parse() {
                    Ok(reference) => {
                        debug!(network = %mapping.network, "using raw object reference");
                        reference
                    }
                    Err(_) => return Err(Error::NotFound { kind, path }),
                },
                Err(e) => return Err(e),
            };

            bindings.push(NetworkBinding {
                name: mapping.name.clone(),
                network,
            });
        }

        Ok(bindings)
    }

    /// Ask the platform for an import spec.
    ///
    /// # Errors
    ///
    /// [`Error::ImportSpecRejected`] with the first platform error message
    /// and, when one applies, a reconfiguration hint.
    pub fn create_spec(
        &self,
        descriptor: &str,
        pool: &ManagedObjectRef,
        datastore: &ManagedObjectRef,
        params: &ImportSpecParams,
    ) -> Result<CreatedSpec> {
        let result = self
            .platform
            .create_import_spec(descriptor, pool, datastore, params)?;

        if let Some(first) = result.errors.first() {
            return Err(Error::ImportSpecRejected {
                message: first.clone(),
                hint: hint_for(first).map(str::to_string),
            });
        }
        for warning in &result.warnings {
            warn!("Warning: {warning}");
        }

        let spec = result
            .spec
            .ok_or_else(|| Error::platform("import spec response has neither spec nor errors"))?;

        Ok(CreatedSpec {
            spec,
            file_items: result.file_items,
            warnings: result.warnings,
        })
    }
}
