//! Package fixtures shared by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Disk payload used by every fixture.
pub const DISK: &[u8] = b"streamOptimized disk payload used by the import tests";

/// A single-VM appliance with one network, one disk and three properties.
pub fn descriptor() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1" xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1">
  <References>
    <File ovf:id="file1" ovf:href="disk.vmdk" ovf:size="{size}"/>
  </References>
  <DiskSection>
    <Info>Virtual disk information</Info>
    <Disk ovf:diskId="vmdisk1" ovf:fileRef="file1" ovf:capacity="1" ovf:capacityAllocationUnits="byte * 2^30"/>
  </DiskSection>
  <NetworkSection>
    <Info>The list of logical networks</Info>
    <Network ovf:name="VM Network">
      <Description>The VM Network network</Description>
    </Network>
  </NetworkSection>
  <DeploymentOptionSection>
    <Configuration ovf:id="small"><Label>Small</Label></Configuration>
    <Configuration ovf:id="medium" ovf:default="true"><Label>Medium</Label></Configuration>
  </DeploymentOptionSection>
  <VirtualSystem ovf:id="appliance">
    <Name>test-appliance</Name>
    <AnnotationSection><Annotation>Built by CI</Annotation></AnnotationSection>
    <ProductSection ovf:class="vami" ovf:instance="app">
      <Product>Appliance</Product>
      <Vendor>Example</Vendor>
      <Property ovf:key="ip0" ovf:type="string" ovf:userConfigurable="true" ovf:value="10.0.0.5"/>
      <Property ovf:key="ssh" ovf:type="boolean" ovf:userConfigurable="true" ovf:value="false"/>
      <Property ovf:key="build" ovf:type="string" ovf:userConfigurable="false" ovf:value="1234"/>
    </ProductSection>
  </VirtualSystem>
</Envelope>
"#,
        size = DISK.len()
    )
}

/// Same appliance plus an ISO image the platform creates as a plain file.
pub fn descriptor_with_iso(iso_len: usize) -> String {
    descriptor().replace(
        r#"<File ovf:id="file1""#,
        &format!(r#"<File ovf:id="file2" ovf:href="tools.iso" ovf:size="{iso_len}"/>
    <File ovf:id="file1""#),
    )
}

pub fn sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn sha1(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Manifest covering the descriptor and the disk.
pub fn manifest(descriptor: &str) -> String {
    format!(
        "SHA256(appliance.ovf)= {}\nSHA256(disk.vmdk)= {}\n",
        sha256(descriptor.as_bytes()),
        sha256(DISK)
    )
}

/// Write the appliance as loose files into `dir`; returns the descriptor path.
pub fn write_dir(dir: &Path, manifest: Option<&str>) -> PathBuf {
    let descriptor = descriptor();
    let path = dir.join("appliance.ovf");
    fs::write(&path, &descriptor).unwrap();
    fs::write(dir.join("disk.vmdk"), DISK).unwrap();
    if let Some(manifest) = manifest {
        fs::write(dir.join("appliance.mf"), manifest).unwrap();
    }
    path
}

/// Build a TAR holding `members` in order.
pub fn tar_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Write the appliance as an OVA (descriptor first, then manifest, then disk).
pub fn write_ova(dir: &Path, with_manifest: bool) -> PathBuf {
    let descriptor = descriptor();
    let manifest = manifest(&descriptor);
    let mut members: Vec<(&str, &[u8])> = vec![("appliance.ovf", descriptor.as_bytes())];
    if with_manifest {
        members.push(("appliance.mf", manifest.as_bytes()));
    }
    members.push(("disk.vmdk", DISK));

    let path = dir.join("appliance.ova");
    fs::write(&path, tar_bytes(&members)).unwrap();
    path
}

/// Write the appliance as a gzip-compressed OVA.
pub fn write_ova_gz(dir: &Path) -> PathBuf {
    let descriptor = descriptor();
    let manifest = manifest(&descriptor);
    let tar = tar_bytes(&[
        ("appliance.ovf", descriptor.as_bytes()),
        ("appliance.mf", manifest.as_bytes()),
        ("disk.vmdk", DISK),
    ]);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    let path = dir.join("appliance.ova.gz");
    fs::write(&path, encoder.finish().unwrap()).unwrap();
    path
}
