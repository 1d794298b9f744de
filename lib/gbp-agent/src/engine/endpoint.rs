// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Local endpoint flows.
//!
//! A local endpoint is attached to a switch port. The flows it owns,
//! all keyed by its UUID, cover:
//!
//! * port security (SEC): which source MAC and IP addresses the port
//!   may use, including virtual IPs and DHCP requests for the virtual
//!   DHCP server;
//! * source classification (SRC) into the endpoint's group;
//! * delivery, both bridged (BR) and routed by the virtual router
//!   (RT), with ARP and ND answered on its behalf when its flood
//!   domain asks for it;
//! * its IP mappings (see the `nat` module);
//! * delivery of anycast service return traffic (SVD);
//! * hairpinning routed traffic back out its own port (OUT).
//!
//! An endpoint with a port and a flood scope is also a member of that
//! scope's flood group.

use super::FlowManager;
use super::common::Discovery;
use super::common::PipelineEnv;
use super::common::SourceRegs;
use super::common::action_dest_ep;
use super::common::action_source;
use super::common::match_dest_arp;
use super::common::match_dest_nd;
use super::common::match_fd;
use super::common::nd;
use super::common::proxy_discovery;
use super::consts::*;
use super::flood::FloodMember;
use super::flood::floods_unknown;
use crate::model::Endpoint;
use gbp_api::AddressResMode;
use gbp_api::MacAddr;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::FlowEntry;
use gbp_flow::engine::PortMapper;
use gbp_flow::engine::SwitchConnection;
use gbp_flow::engine::TableId;
use gbp_flow::engine::flow::ETH_TYPE_IPV4;
use gbp_flow::engine::flow::ETH_TYPE_IPV6;
use gbp_flow::engine::flow::IP_PROTO_UDP;
use gbp_flow::engine::flow::IpPrefix;
use slog::debug;
use std::net::IpAddr;
use uuid::Uuid;

/// The flows of one endpoint, by table.
#[derive(Debug, Default)]
pub(super) struct EndpointFlows {
    pub sec: Vec<FlowEntry>,
    pub src: Vec<FlowEntry>,
    pub br: Vec<FlowEntry>,
    pub rt: Vec<FlowEntry>,
    pub lrn: Vec<FlowEntry>,
    pub svd: Vec<FlowEntry>,
    pub out: Vec<FlowEntry>,
}

impl EndpointFlows {
    const TABLES: [TableId; 7] = [
        SEC_TABLE,
        SRC_TABLE,
        BRIDGE_TABLE,
        ROUTE_TABLE,
        LEARN_TABLE,
        SVD_TABLE,
        OUT_TABLE,
    ];

    fn into_tables(self) -> [(TableId, Vec<FlowEntry>); 7] {
        [
            (SEC_TABLE, self.sec),
            (SRC_TABLE, self.src),
            (BRIDGE_TABLE, self.br),
            (ROUTE_TABLE, self.rt),
            (LEARN_TABLE, self.lrn),
            (SVD_TABLE, self.svd),
            (OUT_TABLE, self.out),
        ]
    }
}

fn dhcp_v4_request(port: u32, mac: MacAddr) -> FlowEntry {
    FlowBuilder::new()
        .priority(35)
        .cookie(cookie::DHCP_V4)
        .in_port(port)
        .eth_src(mac)
        .eth_type(ETH_TYPE_IPV4)
        .ip_proto(IP_PROTO_UDP)
        .tp_src(68)
        .tp_dst(67)
        .controller()
        .build()
}

fn dhcp_v6_request(port: u32, mac: MacAddr) -> FlowEntry {
    FlowBuilder::new()
        .priority(35)
        .cookie(cookie::DHCP_V6)
        .in_port(port)
        .eth_src(mac)
        .eth_type(ETH_TYPE_IPV6)
        .ip_proto(IP_PROTO_UDP)
        .tp_src(546)
        .tp_dst(547)
        .controller()
        .build()
}

/// Admit neighbor discovery (ARP for IPv4, NA for IPv6) claiming
/// `target` from `mac` on `port`.
fn match_discovery_claim(
    fb: &mut FlowBuilder,
    port: u32,
    mac: MacAddr,
    target: IpPrefix,
) -> &mut FlowBuilder {
    fb.in_port(port).eth_src(mac);
    if target.is_ipv4() {
        fb.arp_spa(target)
    } else {
        nd(fb, ND_NEIGHBOR_ADVERT).nd_target(target)
    }
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => false,
        IpAddr::V6(v6) => v6.is_unicast_link_local(),
    }
}

impl<C: SwitchConnection> FlowManager<C> {
    pub(super) fn update_endpoint(&mut self, uuid: Uuid) {
        let snap = self.policy.load();
        let env = self.env();
        let obj = uuid.to_string();

        let Some(ep) = snap.endpoints.get(&uuid) else {
            debug!(self.log, "cleaning up endpoint"; "uuid" => %uuid);
            for t in EndpointFlows::TABLES {
                self.switch.clear_flows(&obj, t);
            }
            self.remove_endpoint_from_flood_group(uuid);
            self.refresh_service_stats(None);
            return;
        };

        let port = ep.interface.as_deref().and_then(|i| self.ports.find_port(i));
        let fwd = ep
            .egroup
            .as_ref()
            .and_then(|g| self.fwd_info(&snap, g).map(|f| (g, f)));
        let ips = ep.effective_ips();
        let mut flows = EndpointFlows::default();

        // DHCP requests go to the virtual DHCP server. Its address is
        // answered for this endpoint only, and never across the uplink.
        if let (Some(port), true, Some(mac)) = (port, env.virtual_dhcp, ep.mac) {
            let local = PipelineEnv { tun_port: None, ..env };
            if let Some(v4) = &ep.dhcp_v4 {
                flows.sec.push(dhcp_v4_request(port, mac));
                if let Some((_, fwd)) = &fwd {
                    let d = Discovery {
                        ip: IpAddr::V4(v4.server_ip.unwrap_or(LINK_LOCAL_DHCP)),
                        mac: env.dhcp_mac,
                        vnid: fwd.vnid,
                        bd: fwd.bd_id,
                        rd: fwd.rd_id,
                        router: false,
                        src_mac: Some(mac),
                    };
                    proxy_discovery(&local, &mut flows.br, 51, &d);
                }
            }
            if ep.dhcp_v6.is_some() {
                flows.sec.push(dhcp_v6_request(port, mac));
                if let Some((_, fwd)) = &fwd {
                    let d = Discovery {
                        ip: IpAddr::V6(env.dhcp_mac.to_link_local()),
                        mac: env.dhcp_mac,
                        vnid: fwd.vnid,
                        bd: fwd.bd_id,
                        rd: fwd.rd_id,
                        router: true,
                        src_mac: Some(mac),
                    };
                    proxy_discovery(&local, &mut flows.br, 51, &d);
                }
            }
            for vip in ep.virtual_ips.iter().filter(|v| v.mac != mac) {
                if vip.ip.is_ipv4() && ep.dhcp_v4.is_some() {
                    flows.sec.push(dhcp_v4_request(port, vip.mac));
                }
                if vip.ip.is_ipv6() && ep.dhcp_v6.is_some() {
                    flows.sec.push(dhcp_v6_request(port, vip.mac));
                }
            }
        }

        if let Some((epg, fwd)) = &fwd {
            let regs = SourceRegs::from(fwd);
            let fd = snap.group_fd(epg).map(|(_, fd)| fd);

            if let Some(port) = port {
                self.port_security(ep, port, &ips, &mut flows);
            }

            // Source classification.
            if let Some(port) = port {
                if let Some(mac) = ep.mac {
                    let mut fb = FlowBuilder::new();
                    fb.priority(140).in_port(port).eth_src(mac);
                    action_source(&mut fb, regs, SVR_TABLE, None, false);
                    flows.src.push(fb.build());

                    if fwd.fgrp.is_some() && fd.is_some_and(floods_unknown) {
                        let mut fb = FlowBuilder::new();
                        fb.priority(101).cookie(cookie::PROACTIVE_LEARN);
                        match_fd(&mut fb, fwd.fgrp_id, true, Some(mac))
                            .load_reg(REG_OUTPORT, port)
                            .output(port)
                            .controller();
                        flows.lrn.push(fb.build());
                    }
                }
                if ep.promiscuous {
                    let mut fb = FlowBuilder::new();
                    fb.priority(138).in_port(port);
                    action_source(&mut fb, regs, SVR_TABLE, None, false);
                    flows.src.push(fb.build());
                }
            }

            // Bridged delivery.
            if let (Some(port), Some(mac)) = (port, ep.mac)
                && fwd.bd_id != 0
            {
                flows.br.push(
                    FlowBuilder::new()
                        .priority(10)
                        .eth_dst(mac)
                        .reg(REG_BD, fwd.bd_id)
                        .load_reg(REG_DEPG, fwd.vnid)
                        .load_reg(REG_OUTPORT, port)
                        .go(POL_TABLE)
                        .build(),
                );
            }

            // Routed delivery and address resolution.
            if let Some(port) = port
                && fwd.rd_id != 0
                && fwd.bd_id != 0
            {
                if let Some(mac) = ep.mac
                    && env.virtual_router
                    && snap.routing_enabled(epg)
                {
                    let arp_mode = fd.map(|fd| fd.arp_mode).unwrap_or_default();
                    let nd_mode = fd.map(|fd| fd.nd_mode).unwrap_or_default();

                    for ip in &ips {
                        if ep.discovery_proxy {
                            let d = Discovery {
                                ip: *ip,
                                mac,
                                vnid: fwd.vnid,
                                bd: fwd.bd_id,
                                rd: fwd.rd_id,
                                router: false,
                                src_mac: None,
                            };
                            proxy_discovery(&env, &mut flows.br, 20, &d);
                        } else {
                            let mode = if ip.is_ipv4() { arp_mode } else { nd_mode };
                            if mode != AddressResMode::Flood {
                                let mut fb = FlowBuilder::new();
                                fb.priority(20);
                                match ip {
                                    IpAddr::V4(v4) => {
                                        match_dest_arp(&mut fb, *v4, fwd.bd_id, fwd.rd_id);
                                    }
                                    IpAddr::V6(v6) => {
                                        match_dest_nd(
                                            &mut fb,
                                            Some(*v6),
                                            fwd.bd_id,
                                            fwd.rd_id,
                                            ND_NEIGHBOR_SOLICIT,
                                        );
                                    }
                                }
                                if mode == AddressResMode::Unicast {
                                    action_dest_ep(&mut fb, fwd.vnid, port, mac);
                                }
                                flows.br.push(fb.build());
                            }
                        }

                        if is_link_local(ip) {
                            continue;
                        }
                        flows.rt.push(
                            FlowBuilder::new()
                                .priority(500)
                                .reg(REG_RD, fwd.rd_id)
                                .eth_dst(env.router_mac)
                                .ip_dst(*ip)
                                .load_reg(REG_DEPG, fwd.vnid)
                                .load_reg(REG_OUTPORT, port)
                                .set_eth_src(env.router_mac)
                                .set_eth_dst(mac)
                                .dec_ttl()
                                .write_metadata(meta::ROUTED, meta::ROUTED)
                                .go(POL_TABLE)
                                .build(),
                        );
                    }

                    self.ip_mapping_flows(&snap, &env, ep, mac, port, fwd, &mut flows);
                }

                // Anycast service return traffic, delivered straight to
                // the port.
                if let Some(mac) = ep.mac {
                    let ret = if ep.anycast_return_ips.is_empty() {
                        &ips
                    } else {
                        &ep.anycast_return_ips
                    };
                    for ip in ret {
                        flows.svd.push(
                            FlowBuilder::new()
                                .priority(50)
                                .reg(REG_RD, fwd.rd_id)
                                .ip_dst(*ip)
                                .set_eth_src(env.router_mac)
                                .set_eth_dst(mac)
                                .dec_ttl()
                                .output(port)
                                .build(),
                        );
                        let d = Discovery {
                            ip: *ip,
                            mac,
                            vnid: 0,
                            bd: 0,
                            rd: fwd.rd_id,
                            router: false,
                            src_mac: None,
                        };
                        proxy_discovery(&env, &mut flows.svd, 51, &d);
                    }
                }
            }

            // Routed traffic going back out the port it came in on.
            if let Some(port) = port {
                for m in [meta::ROUTED, meta::ROUTED | meta::out::REV_NAT] {
                    flows.out.push(
                        FlowBuilder::new()
                            .priority(2)
                            .in_port(port)
                            .metadata(m, meta::ROUTED | meta::out::MASK)
                            .reg(REG_OUTPORT, port)
                            .output_in_port()
                            .build(),
                    );
                }
            }
        }

        for (t, entries) in flows.into_tables() {
            self.switch.write_flow(&obj, t, entries);
        }

        let scope = fwd.as_ref().and_then(|(_, f)| f.fgrp.clone());
        match (scope, port) {
            (Some(fgrp), Some(port)) => {
                let member = FloodMember { port, promiscuous: ep.promiscuous };
                self.update_endpoint_flood_group(uuid, &fgrp, member);
            }
            _ => self.remove_endpoint_from_flood_group(uuid),
        }

        let rd = fwd.and_then(|(_, f)| f.rd);
        self.refresh_service_stats(rd.as_ref());
    }

    /// Admit the endpoint's own addresses on its port. A promiscuous
    /// endpoint may send anything.
    fn port_security(&self, ep: &Endpoint, port: u32, ips: &[IpAddr], flows: &mut EndpointFlows) {
        if ep.promiscuous {
            flows.sec.push(FlowBuilder::new().priority(50).in_port(port).go(SRC_TABLE).build());
        } else if let Some(mac) = ep.mac {
            flows.sec.push(
                FlowBuilder::new().priority(20).in_port(port).eth_src(mac).go(SRC_TABLE).build(),
            );
            for ip in ips {
                flows.sec.push(
                    FlowBuilder::new()
                        .priority(30)
                        .in_port(port)
                        .eth_src(mac)
                        .ip_src(*ip)
                        .go(SRC_TABLE)
                        .build(),
                );
                let mut fb = FlowBuilder::new();
                fb.priority(40);
                match_discovery_claim(&mut fb, port, mac, IpPrefix::host(*ip));
                flows.sec.push(fb.go(SRC_TABLE).build());
            }
        }

        // A virtual IP may be claimed with its own MAC. The controller
        // learns which address within the range is in use.
        for vip in &ep.virtual_ips {
            let range = IpPrefix::from(vip.ip);
            for ip in ips.iter().filter(|ip| range.contains(**ip)) {
                let mut fb = FlowBuilder::new();
                fb.priority(61);
                match_discovery_claim(&mut fb, port, vip.mac, IpPrefix::host(*ip));
                flows.sec.push(fb.go(SRC_TABLE).build());
            }

            let mut fb = FlowBuilder::new();
            let ck = if range.is_ipv4() { cookie::VIRTUAL_IP_V4 } else { cookie::VIRTUAL_IP_V6 };
            fb.priority(60).cookie(ck);
            match_discovery_claim(&mut fb, port, vip.mac, range);
            flows.sec.push(fb.controller().go(SRC_TABLE).build());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg::AgentConfig;
    use crate::model::BridgeDomain;
    use crate::model::DhcpV4Config;
    use crate::model::EndpointGroup;
    use crate::model::FloodDomain;
    use crate::model::PolicySnapshot;
    use crate::model::PolicyStore;
    use crate::model::RoutingDomain;
    use crate::model::VirtualIp;
    use gbp_api::Uri;
    use gbp_flow::engine::MockSwitch;
    use gbp_flow::engine::flow::Action;
    use gbp_flow::engine::flow::ETH_TYPE_ARP;
    use slog::Logger;
    use slog::o;

    const EP: Uuid = Uuid::from_u128(1);

    fn policy() -> PolicySnapshot {
        let mut snap = PolicySnapshot::default();
        snap.bridge_domains.insert(Uri::from("/bd/1"), BridgeDomain::default());
        snap.flood_domains.insert(Uri::from("/fd/1"), FloodDomain::default());
        snap.routing_domains.insert(Uri::from("/rd/1"), RoutingDomain::default());
        snap.endpoint_groups.insert(
            Uri::from("/epg/1"),
            EndpointGroup {
                vnid: Some(0xA0A),
                bridge_domain: Some(Uri::from("/bd/1")),
                flood_domain: Some(Uri::from("/fd/1")),
                routing_domain: Some(Uri::from("/rd/1")),
                ..Default::default()
            },
        );
        snap.endpoints.insert(
            EP,
            Endpoint {
                mac: Some("aa:bb:cc:dd:ee:ff".parse().unwrap()),
                ips: vec!["10.20.44.2".parse().unwrap()],
                interface: Some("veth0".to_string()),
                egroup: Some(Uri::from("/epg/1")),
                ..Default::default()
            },
        );
        snap
    }

    fn mgr(snap: PolicySnapshot, cfg: AgentConfig) -> FlowManager<MockSwitch> {
        let log = Logger::root(slog::Discard, o!());
        let mut m =
            FlowManager::new(&log, cfg, PolicyStore::from(snap), MockSwitch::new())
                .unwrap();
        m.start();
        m
    }

    fn flows(m: &FlowManager<MockSwitch>, t: TableId) -> Vec<FlowEntry> {
        m.switch().flows_for(&EP.to_string(), t)
    }

    #[test]
    fn no_port_no_flows() {
        let mut m = mgr(policy(), AgentConfig::default());
        m.endpoint_updated(EP);
        assert!(flows(&m, SEC_TABLE).is_empty());
        assert!(flows(&m, SRC_TABLE).is_empty());
        // The port appears.
        m.port_status_update("veth0", Some(10));
        assert!(!flows(&m, SEC_TABLE).is_empty());
        assert_eq!(m.flood_group_members(&Uri::from("/fd/1")), vec![EP]);
    }

    #[test]
    fn local_endpoint() {
        let mut m = mgr(policy(), AgentConfig::default());
        m.port_status_update("veth0", Some(10));

        // Non-IP, then per address (IPv4 and the derived link-local):
        // IP source and address resolution.
        let sec = flows(&m, SEC_TABLE);
        assert_eq!(sec.len(), 5);
        assert!(sec.iter().any(|f| f.priority == 40
            && f.matches.eth_type == Some(ETH_TYPE_ARP)
            && f.matches.arp_spa == Some(IpPrefix::host("10.20.44.2".parse().unwrap()))));

        let src = flows(&m, SRC_TABLE);
        assert_eq!(src.len(), 1);
        assert_eq!(src[0].priority, 140);
        assert!(src[0].actions.contains(&Action::LoadReg { reg: REG_SEPG, value: 0xA0A }));

        let br = flows(&m, BRIDGE_TABLE);
        let bridged = br.iter().find(|f| f.priority == 10).unwrap();
        assert!(bridged.actions.contains(&Action::LoadReg { reg: REG_OUTPORT, value: 10 }));
        // Unicast resolution for both addresses.
        assert_eq!(br.iter().filter(|f| f.priority == 20).count(), 2);

        // The link-local address is not routed.
        let rt = flows(&m, ROUTE_TABLE);
        assert_eq!(rt.len(), 1);
        assert!(rt[0].actions.contains(&Action::DecTtl));

        assert_eq!(flows(&m, OUT_TABLE).len(), 2);
    }

    #[test]
    fn flood_mode_resolution_is_not_answered() {
        let mut snap = policy();
        snap.flood_domains.get_mut(&Uri::from("/fd/1")).unwrap().arp_mode =
            AddressResMode::Flood;
        let mut m = mgr(snap, AgentConfig::default());
        m.port_status_update("veth0", Some(10));
        let br = flows(&m, BRIDGE_TABLE);
        assert!(br.iter().all(|f| f.matches.eth_type != Some(ETH_TYPE_ARP)));
    }

    #[test]
    fn virtual_dhcp() {
        let mut snap = policy();
        let ep = snap.endpoints.get_mut(&EP).unwrap();
        ep.dhcp_v4 = Some(DhcpV4Config::default());
        ep.virtual_ips.push(VirtualIp {
            mac: "00:00:5e:00:01:01".parse().unwrap(),
            ip: "10.20.44.0/24".parse().unwrap(),
        });
        let mut cfg = AgentConfig::default();
        cfg.virtual_dhcp.enabled = true;
        let mut m = mgr(snap, cfg);
        m.port_status_update("veth0", Some(10));

        let sec = flows(&m, SEC_TABLE);
        let dhcp: Vec<_> = sec.iter().filter(|f| f.cookie == cookie::DHCP_V4).collect();
        assert_eq!(dhcp.len(), 2);
        assert!(sec.iter().any(|f| f.priority == 60 && f.cookie == cookie::VIRTUAL_IP_V4));
        assert!(sec.iter().any(|f| f.priority == 61));

        // The DHCP server address is answered, but never for the
        // uplink.
        let br = flows(&m, BRIDGE_TABLE);
        let server = IpPrefix::host(IpAddr::V4(LINK_LOCAL_DHCP));
        let proxy: Vec<_> = br.iter().filter(|f| f.matches.arp_tpa == Some(server)).collect();
        assert_eq!(proxy.len(), 1);
        assert_eq!(proxy[0].priority, 51);
    }

    #[test]
    fn removed_endpoint_leaves_nothing() {
        let mut m = mgr(policy(), AgentConfig::default());
        m.port_status_update("veth0", Some(10));
        m.policy().update(|p| {
            p.endpoints.clear();
        });
        m.endpoint_updated(EP);
        for t in EndpointFlows::TABLES {
            assert!(flows(&m, t).is_empty());
        }
        assert!(m.flood_group_members(&Uri::from("/fd/1")).is_empty());
    }

    #[test]
    fn promiscuous_endpoint() {
        let mut snap = policy();
        snap.endpoints.get_mut(&EP).unwrap().promiscuous = true;
        let mut m = mgr(snap, AgentConfig::default());
        m.port_status_update("veth0", Some(10));
        let sec = flows(&m, SEC_TABLE);
        assert_eq!(sec.len(), 1);
        assert_eq!(sec[0].priority, 50);
        assert_eq!(flows(&m, SRC_TABLE).len(), 2);
    }

    #[test]
    fn anycast_return_covers_link_local() {
        let svd_dsts = |m: &FlowManager<MockSwitch>| -> Vec<IpPrefix> {
            flows(m, SVD_TABLE)
                .iter()
                .filter(|f| f.priority == 50)
                .filter_map(|f| f.matches.ip_dst)
                .collect()
        };

        let snap = policy();
        let mac = snap.endpoints[&EP].mac.unwrap();
        let mut m = mgr(snap, AgentConfig::default());
        m.port_status_update("veth0", Some(10));
        let dsts = svd_dsts(&m);
        assert_eq!(dsts.len(), 2);
        assert!(dsts.contains(&IpPrefix::host("10.20.44.2".parse().unwrap())));
        assert!(dsts.contains(&IpPrefix::host(IpAddr::V6(mac.to_link_local()))));

        // Explicit return addresses replace the endpoint's own.
        m.policy().update(|p| {
            p.endpoints.get_mut(&EP).unwrap().anycast_return_ips =
                vec!["10.20.44.99".parse().unwrap()];
        });
        m.endpoint_updated(EP);
        assert_eq!(
            svd_dsts(&m),
            vec![IpPrefix::host("10.20.44.99".parse().unwrap())]
        );
    }
}
