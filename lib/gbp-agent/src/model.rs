// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The policy objects flows are synthesized from.
//!
//! The agent only ever reads policy. A [`PolicySnapshot`] is an
//! immutable view of every object, indexed by URI (or UUID for
//! endpoints and services). References between objects are held as
//! URIs and resolved on lookup, so a reference to an absent object is
//! simply an unresolved handle.

use gbp_api::AddressResMode;
use gbp_api::BcastFloodMode;
use gbp_api::Direction;
use gbp_api::EnforcementMode;
use gbp_api::IntraGroupPolicy;
use gbp_api::InventoryMode;
use gbp_api::MacAddr;
use gbp_api::ServiceMode;
use gbp_api::ServiceProto;
use gbp_api::UnknownFloodMode;
use gbp_api::Uri;
use gbp_flow::dynamic::Dynamic;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;
use uuid::Uuid;

/// The live policy, swapped wholesale when it changes.
pub type PolicyStore = Dynamic<PolicySnapshot>;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read {path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },

    #[error("malformed policy {path}: {err}")]
    Json { path: PathBuf, err: serde_json::Error },
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EndpointGroup {
    /// The group's VNID, assigned by the policy server. A group
    /// without one has no forwarding information.
    pub vnid: Option<u32>,
    pub bridge_domain: Option<Uri>,
    pub flood_domain: Option<Uri>,
    pub routing_domain: Option<Uri>,
    pub intra_policy: IntraGroupPolicy,
    pub subnets: Vec<Uri>,
    /// The multicast tunnel destination for the group's broadcast
    /// traffic. Kept as text so an invalid address can be reported.
    pub multicast_ip: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BridgeDomain {
    pub routing_enabled: bool,
}

impl Default for BridgeDomain {
    fn default() -> Self {
        Self { routing_enabled: true }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FloodDomain {
    pub arp_mode: AddressResMode,
    pub nd_mode: AddressResMode,
    pub unknown_flood_mode: UnknownFloodMode,
    pub bcast_flood_mode: BcastFloodMode,
    pub flood_context: Option<Uri>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FloodContext {
    pub multicast_ip: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RoutingDomain {
    pub enforcement: EnforcementMode,
    pub internal_subnets: Vec<IpNetwork>,
    pub external_networks: Vec<Uri>,
}

/// Routing domain settings pushed by the local configuration rather
/// than the policy server.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RdConfig {
    pub internal_subnets: Vec<IpNetwork>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Subnet {
    pub address: IpAddr,
    pub prefix_len: u8,
    #[serde(default)]
    pub virtual_router_ip: Option<IpAddr>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct L3ExternalNetwork {
    pub nat_epg: Option<Uri>,
    pub subnets: Vec<IpNetwork>,
}

/// An external segment reached on a VLAN of the physical uplink.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocalExternalDomain {
    pub encap_vlan: u16,
    pub routing_domain: Uri,
    #[serde(default)]
    pub subnets: Vec<IpNetwork>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PlatformConfig {
    pub uri: Uri,
    pub multicast_group_ip: Option<String>,
    pub inventory_mode: InventoryMode,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VirtualIp {
    pub mac: MacAddr,
    pub ip: IpNetwork,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct IpMapping {
    pub mapped_ip: IpAddr,
    #[serde(default)]
    pub floating_ip: Option<IpAddr>,
    /// The group the floating IP lives in.
    pub egroup: Uri,
    #[serde(default)]
    pub next_hop_if: Option<String>,
    #[serde(default)]
    pub next_hop_mac: Option<MacAddr>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DhcpV4Config {
    pub server_ip: Option<Ipv4Addr>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DhcpV6Config {}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Endpoint {
    pub mac: Option<MacAddr>,
    pub ips: Vec<IpAddr>,
    pub interface: Option<String>,
    pub egroup: Option<Uri>,
    pub promiscuous: bool,
    pub discovery_proxy: bool,
    pub virtual_ips: Vec<VirtualIp>,
    pub ip_mappings: Vec<IpMapping>,
    pub dhcp_v4: Option<DhcpV4Config>,
    pub dhcp_v6: Option<DhcpV6Config>,
    /// Addresses service return traffic is delivered to, when they
    /// differ from `ips`.
    pub anycast_return_ips: Vec<IpAddr>,
}

impl Endpoint {
    /// The endpoint's addresses, followed by the link-local address
    /// derived from its MAC when that is not already one of them.
    pub fn effective_ips(&self) -> Vec<IpAddr> {
        let mut ips = self.ips.clone();
        if let Some(mac) = self.mac {
            let ll = IpAddr::V6(mac.to_link_local());
            if !ips.contains(&ll) {
                ips.push(ll);
            }
        }
        ips
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContractRule {
    pub direction: Direction,
    #[serde(default = "default_allow")]
    pub allow: bool,
    pub classifier: Uri,
}

fn default_allow() -> bool {
    true
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Contract {
    pub providers: Vec<Uri>,
    pub consumers: Vec<Uri>,
    pub intra: Vec<Uri>,
    /// Rules in decreasing order of precedence.
    pub rules: Vec<ContractRule>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TcpFlag {
    Fin,
    Syn,
    Rst,
    Ack,
    /// Shorthand for "ACK or RST set".
    Established,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Classifier {
    pub eth_type: Option<u16>,
    pub proto: Option<u8>,
    pub arp_op: Option<u16>,
    pub s_from_port: Option<u16>,
    pub s_to_port: Option<u16>,
    pub d_from_port: Option<u16>,
    pub d_to_port: Option<u16>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
    pub tcp_flags: Vec<TcpFlag>,
    pub src_subnets: Vec<IpNetwork>,
    pub dst_subnets: Vec<IpNetwork>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceMapping {
    pub service_ip: IpAddr,
    #[serde(default)]
    pub service_proto: Option<ServiceProto>,
    #[serde(default)]
    pub service_port: Option<u16>,
    #[serde(default)]
    pub gateway_ip: Option<IpAddr>,
    #[serde(default)]
    pub next_hop_ips: Vec<IpAddr>,
    #[serde(default)]
    pub next_hop_port: Option<u16>,
    #[serde(default)]
    pub conntrack: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Service {
    /// The routing domain the service lives in.
    pub domain: Option<Uri>,
    pub mode: ServiceMode,
    pub interface_name: Option<String>,
    pub iface_vlan: Option<u16>,
    pub iface_ip: Option<IpAddr>,
    pub mac: Option<MacAddr>,
    pub mappings: Vec<ServiceMapping>,
    /// Name, namespace and scope, used only for reporting.
    pub attributes: BTreeMap<String, String>,
}

/// An endpoint on a remote site, reached through a dedicated tunnel
/// destination.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteEndpoint {
    pub mac: MacAddr,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    pub egroup: Uri,
    pub tunnel_ip: Ipv4Addr,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VlanRange {
    pub start: u16,
    pub end: u16,
}

impl VlanRange {
    pub fn contains(&self, vid: u16) -> bool {
        let (lo, hi) = if self.start <= self.end {
            (self.start, self.end)
        } else {
            (self.end, self.start)
        };
        lo <= vid && vid <= hi
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LearningBridgeIface {
    pub interface: Option<String>,
    pub trunk_vlans: Vec<VlanRange>,
}

/// Every policy object the agent knows about.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PolicySnapshot {
    pub endpoint_groups: BTreeMap<Uri, EndpointGroup>,
    pub bridge_domains: BTreeMap<Uri, BridgeDomain>,
    pub flood_domains: BTreeMap<Uri, FloodDomain>,
    pub flood_contexts: BTreeMap<Uri, FloodContext>,
    pub routing_domains: BTreeMap<Uri, RoutingDomain>,
    pub rd_configs: BTreeMap<Uri, RdConfig>,
    pub subnets: BTreeMap<Uri, Subnet>,
    pub external_networks: BTreeMap<Uri, L3ExternalNetwork>,
    pub local_external_domains: BTreeMap<Uri, LocalExternalDomain>,
    pub contracts: BTreeMap<Uri, Contract>,
    pub classifiers: BTreeMap<Uri, Classifier>,
    pub endpoints: BTreeMap<Uuid, Endpoint>,
    pub services: BTreeMap<Uuid, Service>,
    pub remote_endpoints: BTreeMap<String, RemoteEndpoint>,
    pub learning_bridge_ifaces: BTreeMap<Uuid, LearningBridgeIface>,
    pub platform: Option<PlatformConfig>,
}

impl PolicySnapshot {
    pub fn from_json_file(path: &Path) -> Result<Self, PolicyError> {
        let data = std::fs::read_to_string(path)
            .map_err(|err| PolicyError::Io { path: path.to_path_buf(), err })?;
        serde_json::from_str(&data)
            .map_err(|err| PolicyError::Json { path: path.to_path_buf(), err })
    }

    pub fn group(&self, uri: &Uri) -> Option<&EndpointGroup> {
        self.endpoint_groups.get(uri)
    }

    pub fn group_fd(&self, epg: &Uri) -> Option<(&Uri, &FloodDomain)> {
        let uri = self.group(epg)?.flood_domain.as_ref()?;
        self.flood_domains.get(uri).map(|fd| (uri, fd))
    }

    pub fn group_bd(&self, epg: &Uri) -> Option<(&Uri, &BridgeDomain)> {
        let uri = self.group(epg)?.bridge_domain.as_ref()?;
        self.bridge_domains.get(uri).map(|bd| (uri, bd))
    }

    pub fn group_rd(&self, epg: &Uri) -> Option<(&Uri, &RoutingDomain)> {
        let uri = self.group(epg)?.routing_domain.as_ref()?;
        self.routing_domains.get(uri).map(|rd| (uri, rd))
    }

    /// Routing is on for a group unless its bridge domain turns it
    /// off.
    pub fn routing_enabled(&self, epg: &Uri) -> bool {
        self.group_bd(epg).is_none_or(|(_, bd)| bd.routing_enabled)
    }

    pub fn group_subnets(&self, epg: &Uri) -> Vec<(&Uri, &Subnet)> {
        let Some(g) = self.group(epg) else {
            return vec![];
        };
        g.subnets
            .iter()
            .filter_map(|u| self.subnets.get(u).map(|s| (u, s)))
            .collect()
    }

    /// Groups whose forwarding depends on the given domain or subnet.
    pub fn groups_referencing(&self, uri: &Uri) -> Vec<Uri> {
        self.endpoint_groups
            .iter()
            .filter(|(_, g)| {
                g.bridge_domain.as_ref() == Some(uri)
                    || g.flood_domain.as_ref() == Some(uri)
                    || g.routing_domain.as_ref() == Some(uri)
                    || g.subnets.contains(uri)
            })
            .map(|(u, _)| u.clone())
            .collect()
    }

    /// Groups whose flood domain points at the given flood context.
    pub fn groups_in_flood_context(&self, fc: &Uri) -> Vec<Uri> {
        self.endpoint_groups
            .iter()
            .filter(|(u, _)| {
                self.group_fd(u)
                    .is_some_and(|(_, fd)| fd.flood_context.as_ref() == Some(fc))
            })
            .map(|(u, _)| u.clone())
            .collect()
    }

    pub fn endpoints_in_group(&self, epg: &Uri) -> Vec<Uuid> {
        self.endpoints
            .iter()
            .filter(|(_, ep)| ep.egroup.as_ref() == Some(epg))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Endpoints attached to `iface`, directly or as the next hop of
    /// one of their IP mappings.
    pub fn endpoints_by_iface(&self, iface: &str) -> Vec<Uuid> {
        self.endpoints
            .iter()
            .filter(|(_, ep)| {
                ep.interface.as_deref() == Some(iface)
                    || ep
                        .ip_mappings
                        .iter()
                        .any(|m| m.next_hop_if.as_deref() == Some(iface))
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Endpoints with an IP mapping into a group in routing domain
    /// `rd`.
    pub fn endpoints_mapped_into(&self, rd: &Uri) -> BTreeSet<Uuid> {
        self.endpoints
            .iter()
            .filter(|(_, ep)| {
                ep.ip_mappings.iter().any(|m| {
                    self.group(&m.egroup)
                        .and_then(|g| g.routing_domain.as_ref())
                        == Some(rd)
                })
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn services_by_iface(&self, iface: &str) -> Vec<Uuid> {
        self.services
            .iter()
            .filter(|(_, s)| s.interface_name.as_deref() == Some(iface))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn services_in_domain(&self, rd: &Uri) -> Vec<Uuid> {
        self.services
            .iter()
            .filter(|(_, s)| s.domain.as_ref() == Some(rd))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Contracts the group provides, consumes, or is intra to.
    pub fn contracts_for_group(&self, epg: &Uri) -> Vec<Uri> {
        self.contracts
            .iter()
            .filter(|(_, c)| {
                c.providers.contains(epg)
                    || c.consumers.contains(epg)
                    || c.intra.contains(epg)
            })
            .map(|(u, _)| u.clone())
            .collect()
    }

    pub fn remote_endpoints_in_group(&self, epg: &Uri) -> Vec<String> {
        self.remote_endpoints
            .iter()
            .filter(|(_, rep)| &rep.egroup == epg)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// The routing domain an external network belongs to.
    pub fn ext_net_rd(&self, ext: &Uri) -> Option<&Uri> {
        if !self.external_networks.contains_key(ext) {
            return None;
        }
        self.routing_domains
            .iter()
            .find(|(_, rd)| rd.external_networks.contains(ext))
            .map(|(u, _)| u)
    }

    /// Learning bridge interfaces trunked on `iface`.
    pub fn lb_ifaces_by_iface(&self, iface: &str) -> Vec<Uuid> {
        self.learning_bridge_ifaces
            .iter()
            .filter(|(_, lb)| lb.interface.as_deref() == Some(iface))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn inventory_mode(&self) -> InventoryMode {
        self.platform.as_ref().map(|p| p.inventory_mode).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const POLICY: &str = r#"{
        "endpoint-groups": {
            "/epg/web": {
                "vnid": 2570,
                "bridge-domain": "/bd/1",
                "flood-domain": "/fd/1",
                "routing-domain": "/rd/1",
                "subnets": ["/subnet/1"]
            }
        },
        "bridge-domains": { "/bd/1": {} },
        "flood-domains": { "/fd/1": { "arp-mode": "flood" } },
        "routing-domains": {
            "/rd/1": { "external-networks": ["/ext/1"] }
        },
        "subnets": {
            "/subnet/1": {
                "address": "10.20.44.0",
                "prefix-len": 24,
                "virtual-router-ip": "10.20.44.1"
            }
        },
        "external-networks": {
            "/ext/1": { "subnets": ["5.5.5.0/24"] }
        },
        "endpoints": {
            "00000000-0000-0000-0000-000000000001": {
                "mac": "aa:bb:cc:dd:ee:ff",
                "ips": ["10.20.44.2"],
                "interface": "veth0",
                "egroup": "/epg/web"
            }
        }
    }"#;

    #[test]
    fn parse_and_resolve() {
        let snap: PolicySnapshot = serde_json::from_str(POLICY).unwrap();
        let web = Uri::from("/epg/web");
        assert_eq!(snap.group(&web).unwrap().vnid, Some(0xA0A));
        assert_eq!(snap.group_fd(&web).unwrap().1.arp_mode, AddressResMode::Flood);
        assert!(snap.routing_enabled(&web));
        assert_eq!(snap.group_subnets(&web).len(), 1);
        assert_eq!(snap.endpoints_in_group(&web).len(), 1);
        assert_eq!(snap.endpoints_by_iface("veth0").len(), 1);
        assert_eq!(
            snap.ext_net_rd(&Uri::from("/ext/1")),
            Some(&Uri::from("/rd/1"))
        );
        assert_eq!(snap.groups_referencing(&Uri::from("/bd/1")), vec![web]);
    }

    #[test]
    fn link_local_is_derived() {
        let ep = Endpoint {
            mac: Some("00:00:00:00:80:00".parse().unwrap()),
            ips: vec!["10.20.44.2".parse().unwrap()],
            ..Default::default()
        };
        let ips = ep.effective_ips();
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[1], "fe80::200:ff:fe00:8000".parse::<IpAddr>().unwrap());

        let no_mac = Endpoint::default();
        assert!(no_mac.effective_ips().is_empty());
    }

    #[test]
    fn vlan_range() {
        let r = VlanRange { start: 20, end: 10 };
        assert!(r.contains(10));
        assert!(r.contains(20));
        assert!(!r.contains(21));
    }
}
