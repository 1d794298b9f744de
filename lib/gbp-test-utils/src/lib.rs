// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common fixtures for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

// Let's make our lives easier and pub use a bunch of stuff.
pub use gbp_agent::cfg::AgentConfig;
pub use gbp_agent::engine::FlowManager;
pub use gbp_agent::engine::stats_key;
pub use gbp_agent::engine::consts::*;
pub use gbp_agent::model::BridgeDomain;
pub use gbp_agent::model::Classifier;
pub use gbp_agent::model::Contract;
pub use gbp_agent::model::ContractRule;
pub use gbp_agent::model::Endpoint;
pub use gbp_agent::model::EndpointGroup;
pub use gbp_agent::model::FloodDomain;
pub use gbp_agent::model::IpMapping;
pub use gbp_agent::model::L3ExternalNetwork;
pub use gbp_agent::model::PolicySnapshot;
pub use gbp_agent::model::PolicyStore;
pub use gbp_agent::model::RoutingDomain;
pub use gbp_agent::model::Service;
pub use gbp_agent::model::ServiceMapping;
pub use gbp_agent::model::Subnet;
pub use gbp_api::ClassId;
pub use gbp_api::Direction;
pub use gbp_api::EncapType;
pub use gbp_api::FloodScope;
pub use gbp_api::MacAddr;
pub use gbp_api::ServiceMode;
pub use gbp_api::ServiceProto;
pub use gbp_api::Uri;
pub use gbp_flow::engine::FlowEntry;
pub use gbp_flow::engine::MockSwitch;
pub use gbp_flow::engine::SwitchConnection;
pub use gbp_flow::engine::flow::Action;
pub use gbp_flow::engine::flow::IpPrefix;
pub use gbp_flow::engine::table_state::EditKind;
pub use gbp_flow::engine::table_state::FlowEdit;
use slog::Logger;
use slog::o;
use std::collections::BTreeMap;
use std::path::PathBuf;
pub use uuid::Uuid;

/// Fail the test unless every edit in `$edits` is a modification.
#[macro_export]
macro_rules! expect_only_mods {
    ($edits:expr) => {
        let edits = &$edits;
        assert!(!edits.is_empty(), "expected modifications, got nothing");
        for e in edits.iter() {
            assert_eq!(
                e.kind(),
                $crate::EditKind::Mod,
                "expected only modifications, got {e:?}"
            );
        }
    };
}

pub const EP1: Uuid = Uuid::from_u128(0x0101);
pub const EP2: Uuid = Uuid::from_u128(0x0102);

pub const EP1_MAC: &str = "aa:bb:cc:dd:ee:ff";
pub const EP2_MAC: &str = "aa:bb:cc:dd:ee:01";
pub const EP1_IP4: &str = "10.20.44.2";
pub const EP1_IP6: &str = "2001:db8::2";
pub const EP2_IP4: &str = "10.20.45.3";

pub const WEB_VNID: u32 = 0xA0A;
pub const DB_VNID: u32 = 0xA0B;
pub const NAT_VNID: u32 = 0x4242;

pub const FLOAT_IP4: &str = "5.5.5.5";
pub const FLOAT_IP6: &str = "fdf1:9f86:d1af:6cc9::5";

pub const TUN_IFACE: &str = "br0_vxlan0";
pub const TUN_PORT: u32 = 2048;

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

pub fn uri(s: &str) -> Uri {
    Uri::from(s)
}

pub fn vxlan_cfg() -> AgentConfig {
    AgentConfig {
        encap_type: Some(EncapType::Vxlan),
        encap_iface: TUN_IFACE.to_string(),
        tunnel_remote_ip: "10.11.12.13".parse().unwrap(),
        ..Default::default()
    }
}

pub fn vlan_cfg() -> AgentConfig {
    AgentConfig {
        encap_type: Some(EncapType::Vlan),
        encap_iface: TUN_IFACE.to_string(),
        ..Default::default()
    }
}

fn group(vnid: u32, domains: &str, subnets: &[&str]) -> EndpointGroup {
    EndpointGroup {
        vnid: Some(vnid),
        bridge_domain: Some(uri(&format!("/bd/{domains}"))),
        flood_domain: Some(uri(&format!("/fd/{domains}"))),
        routing_domain: Some(uri("/rd/1")),
        subnets: subnets.iter().map(|s| uri(s)).collect(),
        ..Default::default()
    }
}

fn subnet(addr: &str, len: u8, router: &str) -> Subnet {
    Subnet {
        address: addr.parse().unwrap(),
        prefix_len: len,
        virtual_router_ip: Some(router.parse().unwrap()),
    }
}

/// Two groups, `web` and `db`, each in its own bridge and flood domain
/// and sharing one routing domain, with one endpoint each.
pub fn base_policy() -> PolicySnapshot {
    let mut snap = PolicySnapshot::default();
    for d in ["1", "2"] {
        snap.bridge_domains.insert(uri(&format!("/bd/{d}")), BridgeDomain::default());
        snap.flood_domains.insert(uri(&format!("/fd/{d}")), FloodDomain::default());
    }
    snap.routing_domains.insert(uri("/rd/1"), RoutingDomain::default());
    snap.subnets.insert(uri("/subnet/web4"), subnet("10.20.44.0", 24, "10.20.44.1"));
    snap.subnets.insert(uri("/subnet/web6"), subnet("2001:db8::", 64, "2001:db8::1"));
    snap.subnets.insert(uri("/subnet/db4"), subnet("10.20.45.0", 24, "10.20.45.1"));

    snap.endpoint_groups
        .insert(uri("/epg/web"), group(WEB_VNID, "1", &["/subnet/web4", "/subnet/web6"]));
    snap.endpoint_groups.insert(uri("/epg/db"), group(DB_VNID, "2", &["/subnet/db4"]));

    snap.endpoints.insert(
        EP1,
        Endpoint {
            mac: Some(EP1_MAC.parse().unwrap()),
            ips: vec![EP1_IP4.parse().unwrap(), EP1_IP6.parse().unwrap()],
            interface: Some("veth0".to_string()),
            egroup: Some(uri("/epg/web")),
            ..Default::default()
        },
    );
    snap.endpoints.insert(
        EP2,
        Endpoint {
            mac: Some(EP2_MAC.parse().unwrap()),
            ips: vec![EP2_IP4.parse().unwrap()],
            interface: Some("veth1".to_string()),
            egroup: Some(uri("/epg/db")),
            ..Default::default()
        },
    );
    snap
}

/// [`base_policy`] plus an external network whose NAT group holds
/// floating IPs for the `web` endpoint.
pub fn nat_policy() -> PolicySnapshot {
    let mut snap = base_policy();
    snap.bridge_domains.insert(uri("/bd/nat"), BridgeDomain::default());
    snap.flood_domains.insert(uri("/fd/nat"), FloodDomain::default());
    snap.endpoint_groups.insert(uri("/epg/nat"), group(NAT_VNID, "nat", &[]));
    snap.external_networks.insert(
        uri("/ext/1"),
        L3ExternalNetwork {
            nat_epg: Some(uri("/epg/nat")),
            subnets: vec!["5.5.5.0/24".parse().unwrap()],
        },
    );
    if let Some(rd) = snap.routing_domains.get_mut(&uri("/rd/1")) {
        rd.external_networks.push(uri("/ext/1"));
    }
    if let Some(ep) = snap.endpoints.get_mut(&EP1) {
        ep.ip_mappings = vec![
            IpMapping {
                mapped_ip: EP1_IP4.parse().unwrap(),
                floating_ip: Some(FLOAT_IP4.parse().unwrap()),
                egroup: uri("/epg/nat"),
                next_hop_if: None,
                next_hop_mac: None,
            },
            IpMapping {
                mapped_ip: EP1_IP6.parse().unwrap(),
                floating_ip: Some(FLOAT_IP6.parse().unwrap()),
                egroup: uri("/epg/nat"),
                next_hop_if: None,
                next_hop_mac: None,
            },
        ];
    }
    snap
}

/// [`base_policy`] with `db` providing a contract `web` consumes: TCP
/// to port 80, TCP established traffic back, and a catch-all deny.
pub fn contract_policy() -> PolicySnapshot {
    let mut snap = base_policy();
    let mut cls = BTreeMap::new();
    cls.insert(
        uri("/cls/http"),
        Classifier {
            eth_type: Some(0x0800),
            proto: Some(6),
            d_from_port: Some(80),
            ..Default::default()
        },
    );
    cls.insert(
        uri("/cls/established"),
        Classifier {
            eth_type: Some(0x0800),
            proto: Some(6),
            tcp_flags: vec![gbp_agent::model::TcpFlag::Established],
            ..Default::default()
        },
    );
    cls.insert(uri("/cls/any"), Classifier::default());
    snap.classifiers = cls;

    snap.contracts.insert(
        uri("/contract/web-db"),
        Contract {
            providers: vec![uri("/epg/db")],
            consumers: vec![uri("/epg/web")],
            intra: vec![],
            rules: vec![
                ContractRule {
                    direction: Direction::In,
                    allow: true,
                    classifier: uri("/cls/http"),
                },
                ContractRule {
                    direction: Direction::Out,
                    allow: true,
                    classifier: uri("/cls/established"),
                },
                ContractRule {
                    direction: Direction::Bidirectional,
                    allow: false,
                    classifier: uri("/cls/any"),
                },
            ],
        },
    );
    snap
}

/// A started manager over a mock switch with every scope computed and
/// the endpoint ports present.
pub fn manager(cfg: AgentConfig, snap: PolicySnapshot) -> FlowManager<MockSwitch> {
    let mut m = FlowManager::new(&test_logger(), cfg, PolicyStore::from(snap), MockSwitch::new())
        .unwrap();
    m.start();
    m.port_status_update(TUN_IFACE, Some(TUN_PORT));
    m.port_status_update("veth0", Some(10));
    m.port_status_update("veth1", Some(11));
    m.resync_all();
    m
}

/// The switch contents, sorted for comparison.
pub fn switch_flows(m: &FlowManager<MockSwitch>) -> Vec<FlowEntry> {
    let mut flows = m.switch().conn().flows();
    flows.sort_by(|a, b| (a.table, a.key()).cmp(&(b.table, b.key())));
    flows
}

/// Drop the edits recorded so far.
pub fn clear_log(m: &mut FlowManager<MockSwitch>) {
    m.switch_mut().conn_mut().take_flow_log();
    m.switch_mut().conn_mut().take_group_log();
}

pub fn take_flow_log(m: &mut FlowManager<MockSwitch>) -> Vec<FlowEdit> {
    m.switch_mut().conn_mut().take_flow_log()
}

/// A scratch directory unique to the calling test.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gbp-test-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
