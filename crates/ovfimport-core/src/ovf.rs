//! OVF descriptor reading and OVF environment generation.
//!
//! Only the parts of the DMTF envelope that the import pipeline consumes are
//! modelled here: file references, disks, networks, deployment options, the
//! top-level virtual system with its product properties, and whether the
//! package describes a multi-VM collection instead.

use std::borrow::Cow;

use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// OVF environment namespace.
pub const OVF_ENV_NAMESPACE: &str = "http://schemas.dmtf.org/ovf/environment/1";

/// VMware extension namespace for the OVF environment.
pub const VMW_ENV_NAMESPACE: &str = "http://www.vmware.com/schema/ovfenv";

/// A file listed in the `References` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileReference {
    /// Reference id used by `Disk fileRef` and hardware items.
    pub id: String,
    /// Path of the member, relative to the descriptor.
    pub href: String,
    /// Declared size in bytes, if present.
    pub size: Option<u64>,
    /// Declared compression (e.g. `gzip`), if present.
    pub compression: Option<String>,
}

/// A virtual disk declared in the `DiskSection`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskDecl {
    pub disk_id: String,
    pub file_ref: Option<String>,
    pub capacity: String,
    pub capacity_allocation_units: Option<String>,
}

impl DiskDecl {
    /// Disk capacity in bytes, honoring `byte * 2^N` allocation units.
    pub fn capacity_bytes(&self) -> u64 {
        let base: u64 = self.capacity.trim().parse().unwrap_or(0);
        let Some(units) = self.capacity_allocation_units.as_deref() else {
            return base;
        };

        let fields: Vec<&str> = units.split_whitespace().collect();
        if fields.len() == 3 && fields[0] == "byte" && fields[1] == "*" {
            let mut parts = fields[2].splitn(2, '^');
            let x: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1);
            let multiplier = match parts.next().and_then(|s| s.parse::<u32>().ok()) {
                Some(exp) => x.saturating_pow(exp),
                None => x,
            };
            return base.saturating_mul(multiplier);
        }
        base
    }
}

/// A logical network declared in the `NetworkSection`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkDecl {
    pub name: String,
    pub description: String,
}

/// One entry of the `DeploymentOptionSection`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentConfiguration {
    pub id: String,
    pub default: bool,
    pub label: String,
    pub description: String,
}

/// A per-configuration value override of a property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PropertyValue {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
}

/// A property declared in a `ProductSection`.
///
/// This is also the schema attached to verbose deployment options, hence
/// the serde derives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PropertyDecl {
    pub key: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifiers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_configurable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<PropertyValue>,
}

/// A `ProductSection` of the virtual system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductSection {
    pub class: Option<String>,
    pub instance: Option<String>,
    pub product: String,
    pub vendor: String,
    pub version: String,
    pub properties: Vec<PropertyDecl>,
}

impl ProductSection {
    /// Fully qualified property key: `[class.]key[.instance]`.
    pub fn qualified_key(&self, property: &PropertyDecl) -> String {
        let mut key = property.key.clone();
        if let Some(class) = &self.class {
            key = format!("{class}.{key}");
        }
        if let Some(instance) = &self.instance {
            key = format!("{key}.{instance}");
        }
        key
    }
}

/// The top-level `VirtualSystem` of a single-VM package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualSystem {
    pub id: String,
    pub name: Option<String>,
    pub annotations: Vec<String>,
    pub products: Vec<ProductSection>,
}

/// The parsed package descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub references: Vec<FileReference>,
    pub disks: Vec<DiskDecl>,
    pub networks: Vec<NetworkDecl>,
    pub deployment_options: Vec<DeploymentConfiguration>,
    pub virtual_system: Option<VirtualSystem>,
    /// Id of the top-level `VirtualSystemCollection`, for multi-VM packages.
    pub collection: Option<String>,
}

impl Envelope {
    /// Parse an OVF descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Descriptor`] if the document is not well-formed XML
    /// or its root element is not an OVF `Envelope`.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut builder = EnvelopeBuilder::default();
        let mut path: Vec<String> = Vec::new();

        loop {
            let event = reader.read_event().map_err(|e| {
                Error::descriptor(format!(
                    "malformed XML at byte {}: {e}",
                    reader.buffer_position()
                ))
            })?;

            match event {
                Event::Start(e) => {
                    let name = local_name(&e);
                    builder.start(&path, &name, &e)?;
                    path.push(name);
                }
                Event::Empty(e) => {
                    let name = local_name(&e);
                    builder.start(&path, &name, &e)?;
                }
                Event::End(_) => {
                    path.pop();
                }
                Event::Text(t) => {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::descriptor(format!("invalid text: {e}")))?;
                    builder.text(&path, &text);
                }
                Event::CData(t) => {
                    let text = String::from_utf8_lossy(&t);
                    builder.text(&path, &text);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !builder.saw_root {
            return Err(Error::descriptor("document has no Envelope element"));
        }
        Ok(builder.envelope)
    }

    /// Declared network names, in document order.
    pub fn network_names(&self) -> Vec<&str> {
        self.networks.iter().map(|n| n.name.as_str()).collect()
    }

    /// Returns true if the package describes a multi-VM application.
    pub fn is_collection(&self) -> bool {
        self.collection.is_some()
    }

    /// Look up a file reference by id.
    pub fn reference(&self, id: &str) -> Option<&FileReference> {
        self.references.iter().find(|r| r.id == id)
    }
}

/// Rewrite non-configurable properties as configurable.
///
/// Used in hidden mode so the platform accepts overrides of properties the
/// package author locked down.
pub fn make_properties_configurable(descriptor: &str) -> Cow<'_, str> {
    const LOCKED: &str = r#"userConfigurable="false""#;
    if descriptor.contains(LOCKED) {
        Cow::Owned(descriptor.replace(LOCKED, r#"userConfigurable="true""#))
    } else {
        Cow::Borrowed(descriptor)
    }
}

#[derive(Default)]
struct EnvelopeBuilder {
    envelope: Envelope,
    saw_root: bool,
}

impl EnvelopeBuilder {
    fn start(&mut self, path: &[String], name: &str, e: &BytesStart<'_>) -> Result<()> {
        if path.is_empty() {
            if name != "Envelope" {
                return Err(Error::descriptor(format!(
                    "root element is <{name}>, expected an OVF Envelope"
                )));
            }
            self.saw_root = true;
            return Ok(());
        }

        let parent = parent(path);
        let env = &mut self.envelope;
        match (parent.as_slice(), name) {
            (["Envelope", "References"], "File") => env.references.push(FileReference {
                id: attr(e, "id")?.unwrap_or_default(),
                href: attr(e, "href")?.unwrap_or_default(),
                size: attr(e, "size")?.and_then(|s| s.trim().parse().ok()),
                compression: attr(e, "compression")?,
            }),
            (["Envelope", "DiskSection"], "Disk") => env.disks.push(DiskDecl {
                disk_id: attr(e, "diskId")?.unwrap_or_default(),
                file_ref: attr(e, "fileRef")?,
                capacity: attr(e, "capacity")?.unwrap_or_default(),
                capacity_allocation_units: attr(e, "capacityAllocationUnits")?,
            }),
            (["Envelope", "NetworkSection"], "Network") => env.networks.push(NetworkDecl {
                name: attr(e, "name")?.unwrap_or_default(),
                description: String::new(),
            }),
            (["Envelope", "DeploymentOptionSection"], "Configuration") => {
                env.deployment_options.push(DeploymentConfiguration {
                    id: attr(e, "id")?.unwrap_or_default(),
                    default: attr(e, "default")?.is_some_and(|v| parse_bool(&v)),
                    ..Default::default()
                })
            }
            (["Envelope"], "VirtualSystem") => {
                env.virtual_system = Some(VirtualSystem {
                    id: attr(e, "id")?.unwrap_or_default(),
                    ..Default::default()
                })
            }
            (["Envelope"], "VirtualSystemCollection") => {
                env.collection = Some(attr(e, "id")?.unwrap_or_default());
            }
            (["Envelope", "VirtualSystem"], "ProductSection") => {
                if let Some(vs) = env.virtual_system.as_mut() {
                    vs.products.push(ProductSection {
                        class: attr(e, "class")?,
                        instance: attr(e, "instance")?,
                        ..Default::default()
                    });
                }
            }
            (["Envelope", "VirtualSystem", "ProductSection"], "Property") => {
                let property = PropertyDecl {
                    key: attr(e, "key")?.unwrap_or_default(),
                    r#type: attr(e, "type")?.unwrap_or_default(),
                    qualifiers: attr(e, "qualifiers")?,
                    user_configurable: attr(e, "userConfigurable")?.map(|v| parse_bool(&v)),
                    default: attr(e, "value")?,
                    password: attr(e, "password")?.map(|v| parse_bool(&v)),
                    ..Default::default()
                };
                if let Some(product) = current_product(env) {
                    product.properties.push(property);
                }
            }
            (["Envelope", "VirtualSystem", "ProductSection", "Property"], "Value") => {
                let value = PropertyValue {
                    value: attr(e, "value")?.unwrap_or_default(),
                    configuration: attr(e, "configuration")?,
                };
                if let Some(property) = current_property(env) {
                    property.values.push(value);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, path: &[String], text: &str) {
        let env = &mut self.envelope;
        let path: Vec<&str> = path.iter().map(String::as_str).collect();
        match path.as_slice() {
            ["Envelope", "NetworkSection", "Network", "Description"] => {
                if let Some(n) = env.networks.last_mut() {
                    n.description.push_str(text);
                }
            }
            ["Envelope", "DeploymentOptionSection", "Configuration", field] => {
                if let Some(c) = env.deployment_options.last_mut() {
                    match *field {
                        "Label" => c.label.push_str(text),
                        "Description" => c.description.push_str(text),
                        _ => {}
                    }
                }
            }
            ["Envelope", "VirtualSystem", "Name"] => {
                if let Some(vs) = env.virtual_system.as_mut() {
                    vs.name.get_or_insert_with(String::new).push_str(text);
                }
            }
            ["Envelope", "VirtualSystem", "AnnotationSection", "Annotation"] => {
                if let Some(vs) = env.virtual_system.as_mut() {
                    vs.annotations.push(text.to_string());
                }
            }
            ["Envelope", "VirtualSystem", "ProductSection", field] => {
                if let Some(product) = current_product(env) {
                    match *field {
                        "Product" => product.product.push_str(text),
                        "Vendor" => product.vendor.push_str(text),
                        "Version" => product.version.push_str(text),
                        _ => {}
                    }
                }
            }
            ["Envelope", "VirtualSystem", "ProductSection", "Property", field] => {
                if let Some(property) = current_property(env) {
                    match *field {
                        "Label" => property.label.get_or_insert_with(String::new).push_str(text),
                        "Description" => property
                            .description
                            .get_or_insert_with(String::new)
                            .push_str(text),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
}

fn parent(path: &[String]) -> Vec<&str> {
    path.iter().map(String::as_str).collect()
}

fn current_product(env: &mut Envelope) -> Option<&mut ProductSection> {
    env.virtual_system.as_mut()?.products.last_mut()
}

fn current_property(env: &mut Envelope) -> Option<&mut PropertyDecl> {
    current_product(env)?.properties.last_mut()
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Read an attribute by local name, ignoring its namespace prefix.
fn attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    for attribute in e.attributes() {
        let attribute: Attribute<'_> =
            attribute.map_err(|err| Error::descriptor(format!("invalid attribute: {err}")))?;
        if attribute.key.local_name().as_ref() == name.as_bytes() {
            let value = attribute
                .unescape_value()
                .map_err(|err| Error::descriptor(format!("invalid attribute value: {err}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn xml_err(e: impl std::fmt::Display) -> Error {
    Error::descriptor(format!("cannot write environment: {e}"))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1")
}

/// Identity of the platform the VM was deployed on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformSection {
    pub kind: String,
    pub version: String,
    pub vendor: String,
    pub locale: String,
}

/// The OVF environment document handed to the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OvfEnvironment {
    /// Platform-assigned VM identifier.
    pub esx_id: String,
    pub platform: PlatformSection,
    /// Resolved property key/value pairs.
    pub properties: Vec<(String, String)>,
}

impl OvfEnvironment {
    /// Serialize the environment as an XML document.
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 3);

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;

        let root = BytesStart::new("Environment").with_attributes([
            ("xmlns", OVF_ENV_NAMESPACE),
            ("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"),
            ("xmlns:oe", OVF_ENV_NAMESPACE),
            ("xmlns:ve", VMW_ENV_NAMESPACE),
            ("oe:id", ""),
            ("ve:esxId", self.esx_id.as_str()),
        ]);
        writer.write_event(Event::Start(root)).map_err(xml_err)?;

        writer
            .write_event(Event::Start(BytesStart::new("PlatformSection")))
            .map_err(xml_err)?;
        for (tag, value) in [
            ("Kind", &self.platform.kind),
            ("Version", &self.platform.version),
            ("Vendor", &self.platform.vendor),
            ("Locale", &self.platform.locale),
        ] {
            writer
                .write_event(Event::Start(BytesStart::new(tag)))
                .map_err(xml_err)?;
            writer
                .write_event(Event::Text(BytesText::new(value)))
                .map_err(xml_err)?;
            writer
                .write_event(Event::End(BytesEnd::new(tag)))
                .map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("PlatformSection")))
            .map_err(xml_err)?;

        writer
            .write_event(Event::Start(BytesStart::new("PropertySection")))
            .map_err(xml_err)?;
        for (key, value) in &self.properties {
            let property = BytesStart::new("Property")
                .with_attributes([("oe:key", key.as_str()), ("oe:value", value.as_str())]);
            writer.write_event(Event::Empty(property)).map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("PropertySection")))
            .map_err(xml_err)?;

        writer
            .write_event(Event::End(BytesEnd::new("Environment")))
            .map_err(xml_err)?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| Error::descriptor(format!("environment is not UTF-8: {e}")))
    }
}
