//! Deployment options.
//!
//! [`DeploymentOptions`] is the JSON document exchanged between producing
//! options from a package ([`resolve`]) and applying them during import.
//! Output uses the document's field names (`DiskProvisioning`,
//! `IPAllocationPolicy`, `PropertyMapping`, ...). Input also accepts the
//! camelCase spelling of each field, and an empty choice string selects the
//! default.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use serde::de::IntoDeserializer;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::ovf::{Envelope, PropertyDecl};

/// Disk provisioning modes accepted by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiskProvisioning {
    MonolithicSparse,
    MonolithicFlat,
    TwoGbMaxExtentSparse,
    TwoGbMaxExtentFlat,
    Thin,
    Thick,
    SeSparse,
    EagerZeroedThick,
    Sparse,
    #[default]
    Flat,
}

impl DiskProvisioning {
    pub const ALL: [DiskProvisioning; 10] = [
        DiskProvisioning::MonolithicSparse,
        DiskProvisioning::MonolithicFlat,
        DiskProvisioning::TwoGbMaxExtentSparse,
        DiskProvisioning::TwoGbMaxExtentFlat,
        DiskProvisioning::Thin,
        DiskProvisioning::Thick,
        DiskProvisioning::SeSparse,
        DiskProvisioning::EagerZeroedThick,
        DiskProvisioning::Sparse,
        DiskProvisioning::Flat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskProvisioning::MonolithicSparse => "monolithicSparse",
            DiskProvisioning::MonolithicFlat => "monolithicFlat",
            DiskProvisioning::TwoGbMaxExtentSparse => "twoGbMaxExtentSparse",
            DiskProvisioning::TwoGbMaxExtentFlat => "twoGbMaxExtentFlat",
            DiskProvisioning::Thin => "thin",
            DiskProvisioning::Thick => "thick",
            DiskProvisioning::SeSparse => "seSparse",
            DiskProvisioning::EagerZeroedThick => "eagerZeroedThick",
            DiskProvisioning::Sparse => "sparse",
            DiskProvisioning::Flat => "flat",
        }
    }
}

impl fmt::Display for DiskProvisioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How guest IP addresses are allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IpAllocationPolicy {
    #[default]
    DhcpPolicy,
    TransientPolicy,
    FixedPolicy,
    FixedAllocatedPolicy,
}

impl IpAllocationPolicy {
    pub const ALL: [IpAllocationPolicy; 4] = [
        IpAllocationPolicy::DhcpPolicy,
        IpAllocationPolicy::TransientPolicy,
        IpAllocationPolicy::FixedPolicy,
        IpAllocationPolicy::FixedAllocatedPolicy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IpAllocationPolicy::DhcpPolicy => "dhcpPolicy",
            IpAllocationPolicy::TransientPolicy => "transientPolicy",
            IpAllocationPolicy::FixedPolicy => "fixedPolicy",
            IpAllocationPolicy::FixedAllocatedPolicy => "fixedAllocatedPolicy",
        }
    }
}

impl fmt::Display for IpAllocationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IP protocol the guest is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpProtocol {
    #[default]
    #[serde(rename = "IPv4")]
    Ipv4,
    #[serde(rename = "IPv6")]
    Ipv6,
}

impl IpProtocol {
    pub const ALL: [IpProtocol; 2] = [IpProtocol::Ipv4, IpProtocol::Ipv6];

    pub fn as_str(&self) -> &'static str {
        match self {
            IpProtocol::Ipv4 => "IPv4",
            IpProtocol::Ipv6 => "IPv6",
        }
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A property key/value pair. Input accepts `Key`/`key` and `Value`/`value`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    #[serde(rename = "Key", alias = "key")]
    pub key: String,
    #[serde(rename = "Value", alias = "value", default)]
    pub value: String,
    /// Property schema, attached in verbose mode.
    #[serde(rename = "Spec", alias = "spec", default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PropertyDecl>,
}

impl Property {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            spec: None,
        }
    }
}

/// Maps a descriptor network name to a platform network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMapping {
    #[serde(rename = "Name", alias = "name")]
    pub name: String,
    /// Inventory name, path, or `Type:value` reference; empty leaves the
    /// choice to the platform.
    #[serde(rename = "Network", alias = "network", default)]
    pub network: String,
}

impl NetworkMapping {
    pub fn new(name: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network: network.into(),
        }
    }
}

/// The deployment options document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeploymentOptions {
    #[serde(alias = "allDeploymentOptions", default, skip_serializing_if = "Vec::is_empty")]
    pub all_deployment_options: Vec<String>,
    #[serde(alias = "deployment", default, skip_serializing_if = "String::is_empty")]
    pub deployment: String,

    #[serde(alias = "allDiskProvisioningOptions", default, skip_serializing_if = "Vec::is_empty")]
    pub all_disk_provisioning_options: Vec<DiskProvisioning>,
    #[serde(alias = "diskProvisioning", default, deserialize_with = "empty_as_default")]
    pub disk_provisioning: DiskProvisioning,

    #[serde(
        rename = "AllIPAllocationPolicyOptions",
        alias = "allIPAllocationPolicyOptions",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub all_ip_allocation_policy_options: Vec<IpAllocationPolicy>,
    #[serde(
        rename = "IPAllocationPolicy",
        alias = "ipAllocationPolicy",
        default,
        deserialize_with = "empty_as_default"
    )]
    pub ip_allocation_policy: IpAllocationPolicy,

    #[serde(
        rename = "AllIPProtocolOptions",
        alias = "allIPProtocolOptions",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub all_ip_protocol_options: Vec<IpProtocol>,
    #[serde(rename = "IPProtocol", alias = "ipProtocol", default, deserialize_with = "empty_as_default")]
    pub ip_protocol: IpProtocol,

    #[serde(alias = "propertyMapping", default, skip_serializing_if = "Vec::is_empty")]
    pub property_mapping: Vec<Property>,

    #[serde(alias = "networkMapping", default, skip_serializing_if = "Vec::is_empty")]
    pub network_mapping: Vec<NetworkMapping>,

    #[serde(alias = "annotation", default, skip_serializing_if = "String::is_empty")]
    pub annotation: String,

    #[serde(alias = "markAsTemplate", default)]
    pub mark_as_template: bool,
    #[serde(alias = "powerOn", default)]
    pub power_on: bool,
    #[serde(alias = "injectOvfEnv", default)]
    pub inject_ovf_env: bool,
    #[serde(rename = "WaitForIP", alias = "waitForIP", default)]
    pub wait_for_ip: bool,
    #[serde(alias = "name", default)]
    pub name: Option<String>,
}

/// Decode a choice, reading `null` and `""` as the default.
fn empty_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(value) if !value.is_empty() => T::deserialize(value.into_deserializer()),
        _ => Ok(T::default()),
    }
}

/// Explicit user input layered over resolved options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub name: Option<String>,
    pub deployment: Option<String>,
    pub annotation: Option<String>,
    pub disk_provisioning: Option<DiskProvisioning>,
    pub network_mapping: Vec<NetworkMapping>,
    pub property_mapping: Vec<Property>,
    pub power_on: Option<bool>,
    pub mark_as_template: Option<bool>,
    pub inject_ovf_env: Option<bool>,
    pub wait_for_ip: Option<bool>,
}

impl DeploymentOptions {
    /// Decode an options document.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Decode an options document from a file, or from stdin when `path`
    /// is `-`.
    pub fn from_path(path: &Path) -> Result<Self> {
        if path == Path::new("-") {
            return Self::from_reader(io::stdin().lock());
        }
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        Self::from_reader(BufReader::new(file))
    }

    /// Encode as indented JSON.
    pub fn to_writer_pretty<W: Write>(&self, writer: W) -> Result<()> {
        Ok(serde_json::to_writer_pretty(writer, self)?)
    }

    /// Layer explicit overrides on top; explicit values always win.
    ///
    /// Mappings merge last-write-wins, keyed by property key and network
    /// name respectively.
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(name) = &overrides.name {
            self.name = Some(name.clone());
        }
        if let Some(deployment) = &overrides.deployment {
            self.deployment = deployment.clone();
        }
        if let Some(annotation) = &overrides.annotation {
            self.annotation = annotation.clone();
        }
        if let Some(provisioning) = overrides.disk_provisioning {
            self.disk_provisioning = provisioning;
        }
        if let Some(v) = overrides.power_on {
            self.power_on = v;
        }
        if let Some(v) = overrides.mark_as_template {
            self.mark_as_template = v;
        }
        if let Some(v) = overrides.inject_ovf_env {
            self.inject_ovf_env = v;
        }
        if let Some(v) = overrides.wait_for_ip {
            self.wait_for_ip = v;
        }

        for mapping in &overrides.network_mapping {
            match self.network_mapping.iter_mut().find(|m| m.name == mapping.name) {
                Some(existing) => existing.network = mapping.network.clone(),
                None => self.network_mapping.push(mapping.clone()),
            }
        }

        for property in &overrides.property_mapping {
            match self.property_mapping.iter_mut().find(|p| p.key == property.key) {
                Some(existing) => existing.value = property.value.clone(),
                None => self.property_mapping.push(property.clone()),
            }
        }
    }

    /// Advisory notes about flags that will have no effect.
    pub fn validate(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.mark_as_template {
            if self.power_on {
                notes.push("PowerOn is ignored when MarkAsTemplate is set".to_string());
            }
            if self.wait_for_ip {
                notes.push("WaitForIP is ignored when MarkAsTemplate is set".to_string());
            }
        } else if self.wait_for_ip && !self.power_on {
            notes.push("WaitForIP has no effect without PowerOn".to_string());
        }
        if self.inject_ovf_env && self.mark_as_template {
            notes.push("InjectOvfEnv on a template only takes effect on its clones".to_string());
        }
        notes
    }
}

/// Produce deployment options from a parsed descriptor.
///
/// Every choice gets its descriptor default: flat provisioning, DHCP, IPv4,
/// the default deployment configuration, concatenated annotations, one empty
/// network mapping per declared network, and the property mapping from
/// [`property_mapping`]. `verbose` adds the legal values of each choice.
pub fn resolve(envelope: &Envelope, hidden: bool, verbose: bool) -> DeploymentOptions {
    let deployments = deployment_ids(envelope);

    let mut options = DeploymentOptions {
        deployment: deployments.first().cloned().unwrap_or_default(),
        property_mapping: property_mapping(envelope, hidden, verbose),
        network_mapping: envelope
            .networks
            .iter()
            .map(|n| NetworkMapping::new(&n.name, ""))
            .collect(),
        annotation: envelope
            .virtual_system
            .as_ref()
            .map(|vs| vs.annotations.concat())
            .unwrap_or_default(),
        ..DeploymentOptions::default()
    };

    if verbose {
        options.all_deployment_options = deployments;
        options.all_disk_provisioning_options = DiskProvisioning::ALL.to_vec();
        options.all_ip_allocation_policy_options = IpAllocationPolicy::ALL.to_vec();
        options.all_ip_protocol_options = IpProtocol::ALL.to_vec();
    }

    options
}

/// Deployment configuration ids, default first.
fn deployment_ids(envelope: &Envelope) -> Vec<String> {
    let defaults = envelope.deployment_options.iter().filter(|c| c.default);
    let others = envelope.deployment_options.iter().filter(|c| !c.default);
    defaults.chain(others).map(|c| c.id.clone()).collect()
}

/// One entry per configurable property (or every declared property when
/// `hidden`), keyed by its qualified key and set to its default value.
///
/// Properties that do not state `userConfigurable` at all are left out.
/// Boolean defaults are written `True`/`False`, the only casing the
/// platform's property validator accepts.
pub fn property_mapping(envelope: &Envelope, hidden: bool, verbose: bool) -> Vec<Property> {
    let Some(vs) = &envelope.virtual_system else {
        return Vec::new();
    };

    let mut mapping = Vec::new();
    for product in &vs.products {
        for property in &product.properties {
            let Some(configurable) = property.user_configurable else {
                continue;
            };
            if !configurable && !hidden {
                continue;
            }

            let mut value = property.default.clone().unwrap_or_default();
            if property.r#type == "boolean" {
                value = title_case(&value);
            }

            mapping.push(Property {
                key: product.qualified_key(property),
                value,
                spec: verbose.then(|| property.clone()),
            });
        }
    }
    mapping
}

fn title_case(value: &str) -> String {
    let lower = value.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovf::{DeploymentConfiguration, NetworkDecl, ProductSection, VirtualSystem};

    fn prop(key: &str, kind: &str, configurable: Option<bool>, default: &str) -> PropertyDecl {
        PropertyDecl {
            key: key.to_string(),
            r#type: kind.to_string(),
            user_configurable: configurable,
            default: Some(default.to_string()),
            ..PropertyDecl::default()
        }
    }

    fn envelope() -> Envelope {
        Envelope {
            networks: vec![
                NetworkDecl {
                    name: "VM Network".to_string(),
                    description: String::new(),
                },
                NetworkDecl {
                    name: "Storage".to_string(),
                    description: String::new(),
                },
            ],
            deployment_options: vec![
                DeploymentConfiguration {
                    id: "small".to_string(),
                    ..Default::default()
                },
                DeploymentConfiguration {
                    id: "large".to_string(),
                    default: true,
                    ..Default::default()
                },
            ],
            virtual_system: Some(VirtualSystem {
                id: "vm".to_string(),
                name: None,
                annotations: vec!["first ".to_string(), "second".to_string()],
                products: vec![ProductSection {
                    class: Some("vami".to_string()),
                    instance: Some("app".to_string()),
                    properties: vec![
                        prop("hostname", "string", Some(true), "box"),
                        prop("ssh", "boolean", Some(true), "false"),
                        prop("secret", "string", Some(false), "x"),
                        prop("implicit", "string", None, "y"),
                    ],
                    ..ProductSection::default()
                }],
            }),
            ..Envelope::default()
        }
    }

    #[test]
    fn test_resolve_defaults() {
        let options = resolve(&envelope(), false, false);
        assert_eq!(options.disk_provisioning, DiskProvisioning::Flat);
        assert_eq!(options.ip_allocation_policy, IpAllocationPolicy::DhcpPolicy);
        assert_eq!(options.ip_protocol, IpProtocol::Ipv4);
        assert_eq!(options.deployment, "large");
        assert_eq!(options.annotation, "first second");
        assert_eq!(options.network_mapping.len(), 2);
        assert!(options.network_mapping.iter().all(|m| m.network.is_empty()));
        assert!(options.all_deployment_options.is_empty());
        assert!(!options.power_on);
        assert!(options.name.is_none());
    }

    #[test]
    fn test_property_mapping_visibility_and_casing() {
        let mapping = property_mapping(&envelope(), false, false);
        let keys: Vec<&str> = mapping.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["vami.hostname.app", "vami.ssh.app"]);
        assert_eq!(mapping[1].value, "False");
        assert!(mapping[0].spec.is_none());

        let hidden = property_mapping(&envelope(), true, true);
        let keys: Vec<&str> = hidden.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["vami.hostname.app", "vami.ssh.app", "vami.secret.app"]);
        assert!(hidden[0].spec.is_some());
    }

    #[test]
    fn test_verbose_lists_choices() {
        let options = resolve(&envelope(), false, true);
        assert_eq!(options.all_deployment_options, vec!["large", "small"]);
        assert_eq!(options.all_disk_provisioning_options.len(), 10);
        assert_eq!(options.all_ip_protocol_options, IpProtocol::ALL.to_vec());
    }

    #[test]
    fn test_empty_envelope() {
        let options = resolve(&Envelope::default(), false, false);
        assert!(options.deployment.is_empty());
        assert!(options.property_mapping.is_empty());
        assert!(options.network_mapping.is_empty());
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("true"), "True");
        assert_eq!(title_case("FALSE"), "False");
        assert_eq!(title_case(""), "");
    }

    #[test]
    fn test_json_field_names() {
        let mut options = resolve(&envelope(), false, false);
        options.wait_for_ip = true;
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["DiskProvisioning"], "flat");
        assert_eq!(json["IPAllocationPolicy"], "dhcpPolicy");
        assert_eq!(json["IPProtocol"], "IPv4");
        assert_eq!(json["WaitForIP"], true);
        assert_eq!(json["PropertyMapping"][0]["Key"], "vami.hostname.app");
        assert_eq!(json["NetworkMapping"][0]["Name"], "VM Network");
        assert!(json["Name"].is_null());
        assert!(json.get("AllDeploymentOptions").is_none());
    }

    #[test]
    fn test_apply_overrides() {
        let mut options = resolve(&envelope(), false, false);
        options.apply(&Overrides {
            name: Some("web-01".to_string()),
            power_on: Some(true),
            network_mapping: vec![
                NetworkMapping::new("VM Network", "dev-net"),
                NetworkMapping::new("VM Network", "prod-net"),
                NetworkMapping::new("Backup", "backup-net"),
            ],
            property_mapping: vec![Property::new("vami.hostname.app", "web-01")],
            ..Overrides::default()
        });

        assert_eq!(options.name.as_deref(), Some("web-01"));
        assert!(options.power_on);
        assert_eq!(options.network_mapping.len(), 3);
        assert_eq!(options.network_mapping[0].network, "prod-net");
        assert_eq!(options.network_mapping[2].name, "Backup");
        assert_eq!(options.property_mapping[0].value, "web-01");
        assert_eq!(options.property_mapping.len(), 2);
    }

    #[test]
    fn test_validate_notes() {
        let options = DeploymentOptions {
            mark_as_template: true,
            power_on: true,
            ..DeploymentOptions::default()
        };
        assert_eq!(options.validate().len(), 1);

        let options = DeploymentOptions {
            wait_for_ip: true,
            ..DeploymentOptions::default()
        };
        assert_eq!(options.validate(), vec!["WaitForIP has no effect without PowerOn"]);
        assert!(DeploymentOptions::default().validate().is_empty());
    }
}
