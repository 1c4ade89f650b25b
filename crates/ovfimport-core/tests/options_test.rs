//! Deployment options resolution and JSON interchange tests.

mod common;

use ovfimport_core::options::{self, DiskProvisioning, IpAllocationPolicy, IpProtocol};
use ovfimport_core::{DeploymentOptions, Envelope, NetworkMapping, Overrides, Property};

fn envelope() -> Envelope {
    Envelope::parse(&common::descriptor()).unwrap()
}

#[test]
fn test_resolve_defaults() {
    let options = options::resolve(&envelope(), false, false);

    assert_eq!(options.deployment, "medium");
    assert_eq!(options.disk_provisioning, DiskProvisioning::Flat);
    assert_eq!(options.ip_allocation_policy, IpAllocationPolicy::DhcpPolicy);
    assert_eq!(options.ip_protocol, IpProtocol::Ipv4);
    assert_eq!(options.annotation, "Built by CI");
    assert_eq!(options.network_mapping, vec![NetworkMapping::new("VM Network", "")]);
    assert_eq!(
        options.property_mapping,
        vec![
            Property::new("vami.ip0.app", "10.0.0.5"),
            Property::new("vami.ssh.app", "False"),
        ]
    );
    assert!(options.all_deployment_options.is_empty());
    assert_eq!(options.name, None);
}

#[test]
fn test_resolve_hidden_and_verbose() {
    let options = options::resolve(&envelope(), true, true);

    assert_eq!(options.all_deployment_options, vec!["medium", "small"]);
    assert_eq!(options.all_disk_provisioning_options.len(), DiskProvisioning::ALL.len());
    assert_eq!(options.all_ip_protocol_options, vec![IpProtocol::Ipv4, IpProtocol::Ipv6]);

    let build = options
        .property_mapping
        .iter()
        .find(|p| p.key == "vami.build.app")
        .expect("hidden property is listed");
    assert_eq!(build.value, "1234");
    assert_eq!(build.spec.as_ref().map(|s| s.user_configurable), Some(Some(false)));
}

#[test]
fn test_resolve_is_idempotent() {
    let overrides = Overrides {
        name: Some("web-01".to_string()),
        network_mapping: vec![NetworkMapping::new("VM Network", "prod-net")],
        property_mapping: vec![Property::new("vami.ip0.app", "192.168.1.10")],
        power_on: Some(true),
        ..Overrides::default()
    };

    let run = || {
        let mut options = options::resolve(&envelope(), false, false);
        options.apply(&overrides);
        options
    };
    assert_eq!(run(), run());
}

#[test]
fn test_apply_merges_last_write_wins() {
    let mut options = options::resolve(&envelope(), false, false);
    options.apply(&Overrides {
        deployment: Some("small".to_string()),
        disk_provisioning: Some(DiskProvisioning::Thin),
        network_mapping: vec![
            NetworkMapping::new("VM Network", "first"),
            NetworkMapping::new("VM Network", "prod-net"),
        ],
        property_mapping: vec![Property::new("vami.ip0.app", "192.168.1.10")],
        ..Overrides::default()
    });

    assert_eq!(options.deployment, "small");
    assert_eq!(options.disk_provisioning, DiskProvisioning::Thin);
    assert_eq!(options.network_mapping, vec![NetworkMapping::new("VM Network", "prod-net")]);
    assert_eq!(options.property_mapping[0], Property::new("vami.ip0.app", "192.168.1.10"));
    assert_eq!(options.property_mapping.len(), 2);
}

#[test]
fn test_json_round_trip() {
    let mut options = options::resolve(&envelope(), false, true);
    options.name = Some("web-01".to_string());
    options.power_on = true;
    options.wait_for_ip = true;

    let mut json = Vec::new();
    options.to_writer_pretty(&mut json).unwrap();
    let decoded = DeploymentOptions::from_reader(json.as_slice()).unwrap();
    assert_eq!(decoded, options);
}

#[test]
fn test_json_field_names() {
    let options = DeploymentOptions {
        ip_allocation_policy: IpAllocationPolicy::FixedPolicy,
        wait_for_ip: true,
        ..DeploymentOptions::default()
    };
    let value: serde_json::Value = serde_json::to_value(&options).unwrap();

    assert_eq!(value["DiskProvisioning"], "flat");
    assert_eq!(value["IPAllocationPolicy"], "fixedPolicy");
    assert_eq!(value["IPProtocol"], "IPv4");
    assert_eq!(value["WaitForIP"], true);
    assert!(value["Name"].is_null());
    assert!(value.get("PropertyMapping").is_none());
}

#[test]
fn test_property_keys_in_either_case() {
    let json = r#"{
        "PropertyMapping": [
            {"Key": "upper", "Value": "1"},
            {"key": "lower", "value": "2"}
        ],
        "NetworkMapping": [{"Name": "VM Network", "Network": "prod-net"}],
        "PowerOn": true
    }"#;

    let options = DeploymentOptions::from_reader(json.as_bytes()).unwrap();
    assert_eq!(
        options.property_mapping,
        vec![Property::new("upper", "1"), Property::new("lower", "2")]
    );
    assert!(options.property_mapping.iter().all(|p| !p.key.is_empty()));
    assert_eq!(options.network_mapping[0].network, "prod-net");
    assert!(options.power_on);

    let mut json = Vec::new();
    options.to_writer_pretty(&mut json).unwrap();
    let text = String::from_utf8(json).unwrap();
    assert!(text.contains(r#""Key": "lower""#));
}

#[test]
fn test_camel_case_fields_and_empty_choices() {
    let json = r#"{
        "deployment": "small",
        "diskProvisioning": "",
        "ipAllocationPolicy": "fixedPolicy",
        "IPProtocol": "",
        "networkMapping": [{"name": "VM Network", "network": "prod-net"}],
        "powerOn": true,
        "waitForIP": true,
        "name": "web-01"
    }"#;

    let options = DeploymentOptions::from_reader(json.as_bytes()).unwrap();
    assert_eq!(options.deployment, "small");
    assert_eq!(options.disk_provisioning, DiskProvisioning::Flat);
    assert_eq!(options.ip_allocation_policy, IpAllocationPolicy::FixedPolicy);
    assert_eq!(options.ip_protocol, IpProtocol::Ipv4);
    assert_eq!(options.network_mapping, vec![NetworkMapping::new("VM Network", "prod-net")]);
    assert!(options.power_on);
    assert!(options.wait_for_ip);
    assert_eq!(options.name.as_deref(), Some("web-01"));

    let nulls = r#"{"DiskProvisioning": null, "IPAllocationPolicy": null}"#;
    let options = DeploymentOptions::from_reader(nulls.as_bytes()).unwrap();
    assert_eq!(options, DeploymentOptions::default());
}

#[test]
fn test_invalid_document_is_an_options_error() {
    let err = DeploymentOptions::from_reader(r#"{"DiskProvisioning": "sideways"}"#.as_bytes()).unwrap_err();
    assert!(matches!(err, ovfimport_core::Error::Options { .. }), "got {err:?}");
}

#[test]
fn test_validate_notes() {
    let options = DeploymentOptions {
        mark_as_template: true,
        power_on: true,
        ..DeploymentOptions::default()
    };
    assert_eq!(options.validate(), vec!["PowerOn is ignored when MarkAsTemplate is set"]);
    assert!(DeploymentOptions::default().validate().is_empty());
}
