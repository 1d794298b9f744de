// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Service flows.
//!
//! Traffic to a service address is intercepted in the bridge table and
//! either handed straight to the local anycast endpoint or spread over
//! the service's next hops with a multipath hash. The next hop table
//! rewrites the destination for the chosen link. Return traffic is
//! rewritten back to the service address in the service reverse table
//! (load balanced services) or on admission from the service interface
//! (anycast services).
//!
//! Load balanced services also carry per-flow counters in the stats
//! table. Their cookies are allocated from a stable string key, so a
//! consumer of flow-removed messages can tell which service and which
//! address a counter belongs to.

use super::FlowManager;
use super::common::Discovery;
use super::common::PipelineEnv;
use super::common::proxy_discovery;
use super::consts::*;
use crate::model::PolicySnapshot;
use crate::model::Service;
use crate::model::ServiceMapping;
use gbp_api::EncapType;
use gbp_api::MacAddr;
use gbp_api::ServiceMode;
use gbp_api::Uri;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::FlowEntry;
use gbp_flow::engine::PortMapper;
use gbp_flow::engine::SwitchConnection;
use gbp_flow::engine::TableId;
use gbp_flow::engine::flow::Conntrack;
use gbp_flow::engine::flow::Field;
use gbp_flow::engine::flow::FlowFlags;
use gbp_flow::engine::flow::IpPrefix;
use slog::debug;
use slog::error;
use slog::warn;
use std::net::IpAddr;
use uuid::Uuid;

const SERVICE_TABLES: [TableId; 5] =
    [SEC_TABLE, BRIDGE_TABLE, SVR_TABLE, SVD_TABLE, SVH_TABLE];

/// The hash basis of the next hop selection.
const MULTIPATH_BASIS: u16 = 1024;

fn stats_obj(uuid: Uuid) -> String {
    format!("stats:{uuid}")
}

/// The key a stats cookie is allocated under.
pub fn stats_key(dir: &str, kind: &str, svc: Uuid, ip: IpAddr) -> String {
    format!("{dir}:{kind}:{svc}:{ip}")
}

/// The service a stats key belongs to.
pub(super) fn stats_key_service(key: &str) -> Option<Uuid> {
    key.splitn(4, ':').nth(2)?.parse().ok()
}

/// Match the protocol and port of a service mapping. Forward traffic
/// matches the service port and, when `rewrite` is set and the next hop
/// listens elsewhere, is rewritten to the next hop port. Reverse
/// traffic matches the next hop port and is rewritten back.
fn match_service_proto(fb: &mut FlowBuilder, sm: &ServiceMapping, forward: bool, rewrite: bool) {
    let Some(proto) = sm.service_proto else {
        return;
    };
    fb.ip_proto(proto.ip_proto());

    let Some(svc_port) = sm.service_port else {
        return;
    };
    let nh_port = sm.next_hop_port.unwrap_or(svc_port);
    let rewrite = rewrite && nh_port != svc_port;

    if forward {
        fb.tp_dst(svc_port);
        if rewrite {
            fb.set_l4_dst(nh_port);
        }
    } else {
        fb.tp_src(nh_port);
        if rewrite {
            fb.set_l4_src(svc_port);
        }
    }
}

#[derive(Debug, Default)]
struct ServiceFlows {
    sec: Vec<FlowEntry>,
    br: Vec<FlowEntry>,
    svr: Vec<FlowEntry>,
    svd: Vec<FlowEntry>,
    svh: Vec<FlowEntry>,
}

/// What a service resolved to: its routing domain and its MAC.
struct Resolved<'a> {
    svc: &'a Service,
    rd_id: u32,
    mac: MacAddr,
    port: Option<u32>,
    ct_mark: u32,
}

impl<C: SwitchConnection> FlowManager<C> {
    pub(super) fn update_service(&mut self, uuid: Uuid) {
        let snap = self.policy.load();
        let env = self.env();
        let obj = uuid.to_string();

        let Some(svc) = snap.services.get(&uuid).filter(|s| s.domain.is_some()) else {
            debug!(self.log, "cleaning up service"; "uuid" => %uuid);
            for t in SERVICE_TABLES {
                self.switch.clear_flows(&obj, t);
            }
            self.switch.clear_flows(&stats_obj(uuid), STATS_TABLE);
            self.ids.erase(ns::SERVICE, &obj);
            return;
        };
        debug!(self.log, "updating service"; "uuid" => %uuid, "mode" => %svc.mode);

        let mut flows = ServiceFlows::default();
        if let Some(rd) = svc.domain.as_ref().filter(|rd| snap.routing_domains.contains_key(*rd)) {
            let mut ct_mark = self.ids.get_id(ns::SERVICE, &obj);
            if svc.interface_name.is_some() {
                ct_mark |= 1 << 31;
            }
            let r = Resolved {
                svc,
                rd_id: self.id(ns::ROUTING_DOMAIN, rd),
                mac: svc.mac.unwrap_or(env.router_mac),
                port: svc.interface_name.as_deref().and_then(|n| self.ports.find_port(n)),
                ct_mark,
            };

            for sm in &svc.mappings {
                let zone = if env.conntrack && sm.conntrack { self.ct_zone(rd) } else { None };
                self.service_mapping_flows(&env, &r, sm, zone, &mut flows);
            }
            if svc.mode == ServiceMode::LoadBalancer
                && let Some(port) = r.port
            {
                service_iface_flows(&env, &r, port, &mut flows);
            }
        }

        self.switch.write_flow(&obj, SEC_TABLE, flows.sec);
        self.switch.write_flow(&obj, BRIDGE_TABLE, flows.br);
        self.switch.write_flow(&obj, SVR_TABLE, flows.svr);
        self.switch.write_flow(&obj, SVH_TABLE, flows.svh);
        self.switch.write_flow(&obj, SVD_TABLE, flows.svd);

        self.update_service_stats(&snap, uuid);
    }

    /// The conntrack zone of a routing domain. Zones are 16 bits wide.
    fn ct_zone(&self, rd: &Uri) -> Option<u16> {
        let id = self.id(ns::CT_ZONE, rd);
        match u16::try_from(id) {
            Ok(zone) => Some(zone),
            Err(_) => {
                error!(self.log, "could not allocate a conntrack zone"; "rd" => %rd, "id" => id);
                None
            }
        }
    }

    fn service_mapping_flows(
        &self,
        env: &PipelineEnv,
        r: &Resolved,
        sm: &ServiceMapping,
        zone: Option<u16>,
        flows: &mut ServiceFlows,
    ) {
        let svc = r.svc;
        let svc_ip = sm.service_ip;
        let anycast = svc.mode == ServiceMode::Anycast;
        let lb = svc.mode == ServiceMode::LoadBalancer;

        let next_hops: Vec<IpAddr> = sm
            .next_hop_ips
            .iter()
            .filter(|nh| {
                let ok = nh.is_ipv4() == svc_ip.is_ipv4();
                if !ok {
                    warn!(self.log, "ignoring service next hop across address families";
                        "service_ip" => %svc_ip, "next_hop" => %nh);
                }
                ok
            })
            .copied()
            .collect();

        // Traffic to the service is intercepted while bridging, so it
        // works with flood domains that learn MAC addresses too.
        let mut fb = FlowBuilder::new();
        fb.priority(50).reg(REG_RD, r.rd_id);
        match_service_proto(&mut fb, sm, true, false);
        if lb && svc.mac.is_some() {
            fb.eth_dst(r.mac);
        }
        fb.ip_dst(svc_ip);
        if anycast && env.encap == Some(EncapType::Vlan) {
            fb.pop_vlan();
        }
        fb.set_eth_src(env.router_mac);
        if !next_hops.is_empty() {
            let max_link = u16::try_from(next_hops.len() - 1).unwrap_or(u16::MAX);
            fb.set_eth_dst(if anycast { r.mac } else { env.router_mac })
                .multipath(MULTIPATH_BASIS, max_link, 32, REG_OUTPORT)
                .go(SVH_TABLE);
        } else if anycast && let Some(port) = r.port {
            fb.set_eth_dst(r.mac).dec_ttl().output(port);
        }
        flows.br.push(fb.build());

        for (link, nh) in next_hops.iter().enumerate() {
            // The first link also catches anything the hash did not
            // resolve, so there is never a window without a match.
            let mut fb = FlowBuilder::new();
            fb.reg(REG_RD, r.rd_id);
            match_service_proto(&mut fb, sm, true, true);
            fb.ip_dst(svc_ip);
            if link == 0 {
                fb.priority(99);
            } else {
                fb.priority(100).reg(REG_OUTPORT, link as u32);
            }
            fb.set_ip_dst(*nh).dec_ttl();
            if lb {
                if let Some(zone) = zone {
                    let from_iface = if svc.interface_name.is_some() {
                        meta::FROM_SERVICE_INTERFACE
                    } else {
                        0
                    };
                    fb.metadata(from_iface, meta::FROM_SERVICE_INTERFACE).conntrack(Conntrack {
                        commit: true,
                        zone,
                        table: None,
                        mark: Some(r.ct_mark),
                    });
                }
                fb.write_metadata(meta::ROUTED, meta::ROUTED).go(ROUTE_TABLE);
            } else if let Some(port) = r.port {
                fb.output(port);
            }
            flows.svh.push(fb.build());

            if !lb {
                continue;
            }

            // Return traffic of a load balanced service follows the
            // normal pipeline once rewritten.
            if let Some(zone) = zone {
                let mut fb = FlowBuilder::new();
                fb.priority(100).reg(REG_RD, r.rd_id);
                match_service_proto(&mut fb, sm, false, false);
                fb.ct_state(0, ct::TRACKED).ip_src(*nh);
                if env.encap == Some(EncapType::Vlan) {
                    fb.push_vlan().mv(Field::Reg(REG_SEPG), Field::VlanVid);
                }
                fb.conntrack(Conntrack { commit: false, zone, table: Some(SRC_TABLE), mark: None });
                flows.svr.push(fb.build());
            }

            let mut fb = FlowBuilder::new();
            fb.priority(100).reg(REG_RD, r.rd_id);
            match_service_proto(&mut fb, sm, false, true);
            fb.ip_src(*nh).set_eth_src(r.mac).set_ip_src(svc_ip).dec_ttl();
            if zone.is_some() {
                fb.ct_state(
                    ct::TRACKED | ct::ESTABLISHED,
                    ct::TRACKED | ct::ESTABLISHED | ct::INVALID | ct::NEW,
                )
                .ct_mark(r.ct_mark);
            }
            if svc.interface_name.is_none() {
                fb.write_metadata(meta::ROUTED, meta::ROUTED).go(BRIDGE_TABLE);
            } else if let Some(port) = r.port {
                if let Some(vlan) = svc.iface_vlan {
                    fb.push_vlan().set_vlan_vid(vlan);
                }
                fb.set_eth_dst(env.router_mac).output(port);
            }
            flows.svr.push(fb.build());
        }

        let Some(port) = r.port.filter(|_| anycast) else {
            return;
        };

        // Traffic from the interface of an anycast service is taken
        // out of normal processing on admission, since no policy could
        // allow it otherwise.
        let sources: Vec<Option<IpAddr>> = if next_hops.is_empty() {
            vec![None]
        } else {
            next_hops.iter().copied().map(Some).collect()
        };
        for nh in sources {
            let mut fb = FlowBuilder::new();
            fb.priority(100).in_port(port).eth_src(r.mac).load_reg(REG_RD, r.rd_id);
            match nh {
                Some(nh) => {
                    fb.ip_src(nh)
                        .set_ip_src(svc_ip)
                        .dec_ttl()
                        .write_metadata(meta::ROUTED, meta::ROUTED);
                }
                None => {
                    fb.ip_src(svc_ip);
                }
            }
            flows.sec.push(fb.go(SVD_TABLE).build());

            // IPv6 neighbor discovery passes as regular IP.
            if svc_ip.is_ipv4() {
                flows.sec.push(
                    FlowBuilder::new()
                        .priority(100)
                        .in_port(port)
                        .eth_src(r.mac)
                        .arp_spa(IpPrefix::host(nh.unwrap_or(svc_ip)))
                        .load_reg(REG_RD, r.rd_id)
                        .go(SVD_TABLE)
                        .build(),
                );
            }
        }

        let d = Discovery {
            ip: svc_ip,
            mac: r.mac,
            vnid: 0,
            bd: 0,
            rd: r.rd_id,
            router: false,
            src_mac: None,
        };
        proxy_discovery(env, &mut flows.br, 51, &d);

        if let Some(gw) = sm.gateway_ip {
            let d = Discovery {
                ip: gw,
                mac: env.router_mac,
                vnid: 0,
                bd: 0,
                rd: r.rd_id,
                router: true,
                src_mac: Some(r.mac),
            };
            proxy_discovery(env, &mut flows.svd, 31, &d);
        }
    }

    // ================================================================
    // Stats
    // ================================================================

    /// Recompute the counters of the load balanced services in `rd`,
    /// or of every service when `None`, after their set of local
    /// endpoints may have changed.
    pub(super) fn refresh_service_stats(&mut self, rd: Option<&Uri>) {
        let snap = self.policy.load();
        let services: Vec<Uuid> = snap
            .services
            .iter()
            .filter(|(_, s)| s.mode == ServiceMode::LoadBalancer)
            .filter(|(_, s)| rd.is_none_or(|rd| s.domain.as_ref() == Some(rd)))
            .map(|(u, _)| *u)
            .collect();
        for uuid in services {
            self.update_service_stats(&snap, uuid);
        }
    }

    /// Addresses of the endpoints with a mapped port in routing domain
    /// `rd`.
    fn local_endpoint_ips(&self, snap: &PolicySnapshot, rd: &Uri) -> Vec<IpAddr> {
        snap.endpoints
            .values()
            .filter(|ep| {
                ep.interface.as_deref().and_then(|i| self.ports.find_port(i)).is_some()
                    && ep
                        .egroup
                        .as_ref()
                        .and_then(|g| snap.group_rd(g))
                        .is_some_and(|(u, _)| u == rd)
            })
            .flat_map(|ep| ep.ips.iter().copied())
            .collect()
    }

    fn stats_flow(&self, key: String, prio: u16, rd_id: u32) -> FlowBuilder {
        let cookie = u64::from(self.ids.get_id(ns::SVC_STATS, &key));
        let mut fb = FlowBuilder::new();
        fb.priority(prio)
            .cookie(cookie)
            .flags(FlowFlags::SEND_FLOW_REM)
            .reg(REG_RD, rd_id);
        fb
    }

    fn update_service_stats(&mut self, snap: &PolicySnapshot, uuid: Uuid) {
        let obj = stats_obj(uuid);
        let svc = snap.services.get(&uuid);
        let rd = svc
            .filter(|s| s.mode == ServiceMode::LoadBalancer)
            .and_then(|s| s.domain.as_ref())
            .filter(|rd| snap.routing_domains.contains_key(*rd));
        let (Some(svc), Some(rd)) = (svc, rd) else {
            self.switch.clear_flows(&obj, STATS_TABLE);
            return;
        };

        let rd_id = self.id(ns::ROUTING_DOMAIN, rd);
        let ep_ips = self.local_endpoint_ips(snap, rd);
        let mut stats = vec![];

        for sm in &svc.mappings {
            let svc_ip = sm.service_ip;
            let same_family = |ip: &&IpAddr| ip.is_ipv4() == svc_ip.is_ipv4();

            stats.push(
                self.stats_flow(stats_key("ingress", "any-svc", uuid, svc_ip), 10, rd_id)
                    .ip_src(svc_ip)
                    .go(OUT_TABLE)
                    .build(),
            );

            for ep_ip in ep_ips.iter().filter(same_family) {
                stats.push(
                    self.stats_flow(stats_key("ingress", "ep-svc", uuid, *ep_ip), 30, rd_id)
                        .ip_src(svc_ip)
                        .ip_dst(*ep_ip)
                        .go(OUT_TABLE)
                        .build(),
                );
            }

            for nh in sm.next_hop_ips.iter().filter(same_family) {
                stats.push(
                    self.stats_flow(stats_key("egress", "svc-nh", uuid, *nh), 20, rd_id)
                        .ip_dst(*nh)
                        .go(OUT_TABLE)
                        .build(),
                );
                for ep_ip in ep_ips.iter().filter(same_family) {
                    stats.push(
                        self.stats_flow(stats_key("egress", "ep-svc", uuid, *ep_ip), 30, rd_id)
                            .ip_src(*ep_ip)
                            .ip_dst(*nh)
                            .go(OUT_TABLE)
                            .build(),
                    );
                }
            }
        }

        self.switch.write_flow(&obj, STATS_TABLE, stats);
    }
}

/// Admission from the interface of a load balanced service. Its
/// traffic was already allowed by a service policy, so it bypasses
/// contracts but still uses the forwarding pipeline.
fn service_iface_flows(env: &PipelineEnv, r: &Resolved, port: u32, flows: &mut ServiceFlows) {
    let svc = r.svc;
    let vnid = svc.iface_vlan.map_or(0, u32::from);

    let mut fb = FlowBuilder::new();
    fb.priority(90).in_port(port);
    if let Some(vlan) = svc.iface_vlan {
        fb.vlan(vlan).pop_vlan();
    }
    let flags = meta::POLICY_APPLIED | meta::FROM_SERVICE_INTERFACE;
    fb.load_reg(REG_SEPG, vnid)
        .load_reg(REG_RD, r.rd_id)
        .write_metadata(flags, flags)
        .go(BRIDGE_TABLE);
    flows.sec.push(fb.build());

    // The interface address is answered back out the interface, tagged
    // like the request was.
    if let Some(ip) = svc.iface_ip {
        let local = PipelineEnv {
            tun_port: Some(port),
            encap: svc.iface_vlan.map(|_| EncapType::Vlan),
            ..*env
        };
        let d = Discovery { ip, mac: r.mac, vnid, bd: 0, rd: r.rd_id, router: false, src_mac: None };
        proxy_discovery(&local, &mut flows.br, 51, &d);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg::AgentConfig;
    use crate::model::Endpoint;
    use crate::model::EndpointGroup;
    use crate::model::PolicyStore;
    use crate::model::RoutingDomain;
    use gbp_api::ServiceProto;
    use gbp_flow::engine::MockSwitch;
    use gbp_flow::engine::flow::Action;
    use slog::Logger;
    use slog::o;

    const SVC: Uuid = Uuid::from_u128(0x5);
    const EP: Uuid = Uuid::from_u128(0x1);

    fn mapping() -> ServiceMapping {
        ServiceMapping {
            service_ip: "169.254.169.254".parse().unwrap(),
            service_proto: Some(ServiceProto::Tcp),
            service_port: Some(80),
            gateway_ip: Some("169.254.1.1".parse().unwrap()),
            next_hop_ips: vec!["10.20.44.3".parse().unwrap(), "10.20.44.4".parse().unwrap()],
            next_hop_port: Some(8080),
            conntrack: true,
        }
    }

    fn policy(mode: ServiceMode) -> PolicySnapshot {
        let mut snap = PolicySnapshot::default();
        snap.routing_domains.insert(Uri::from("/rd/1"), RoutingDomain::default());
        snap.endpoint_groups.insert(
            Uri::from("/epg/1"),
            EndpointGroup {
                vnid: Some(0xA0A),
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
        snap.services.insert(
            SVC,
            Service {
                domain: Some(Uri::from("/rd/1")),
                mode,
                interface_name: Some("svc-br".to_string()),
                mac: Some("ed:84:da:ef:16:96".parse().unwrap()),
                mappings: vec![mapping()],
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
        m.port_status_update("svc-br", Some(17));
        m
    }

    fn flows(m: &FlowManager<MockSwitch>, t: TableId) -> Vec<FlowEntry> {
        m.switch().flows_for(&SVC.to_string(), t)
    }

    #[test]
    fn stats_key_round_trip() {
        let k = stats_key("egress", "svc-nh", SVC, "2001:db8::1".parse().unwrap());
        assert_eq!(stats_key_service(&k), Some(SVC));
        assert_eq!(stats_key_service("garbage"), None);
    }

    #[test]
    fn anycast_service() {
        let m = mgr(policy(ServiceMode::Anycast), AgentConfig::default());

        let br = flows(&m, BRIDGE_TABLE);
        let dest = br.iter().find(|f| f.priority == 50).unwrap();
        assert!(dest.actions.contains(&Action::Multipath {
            basis: MULTIPATH_BASIS,
            max_link: 1,
            arg: 32,
            reg: REG_OUTPORT,
        }));
        assert_eq!(dest.actions.last(), Some(&Action::GotoTable(SVH_TABLE)));
        // The service address is answered.
        assert!(br.iter().any(|f| f.priority == 51));

        let svh = flows(&m, SVH_TABLE);
        assert_eq!(svh.len(), 2);
        let first = svh.iter().find(|f| f.priority == 99).unwrap();
        assert_eq!(first.actions[0], Action::SetL4Dst(8080));
        assert_eq!(first.actions.last(), Some(&Action::Output(17)));

        // One IP and one ARP admission per next hop.
        assert_eq!(flows(&m, SEC_TABLE).len(), 4);
        // The gateway is answered for the service only.
        let svd = flows(&m, SVD_TABLE);
        assert!(svd.iter().all(|f| f.priority == 31 && f.matches.eth_src.is_some()));
        assert!(flows(&m, SVR_TABLE).is_empty());
        assert!(m.switch().flows_for(&stats_obj(SVC), STATS_TABLE).is_empty());
    }

    #[test]
    fn load_balanced_with_conntrack() {
        let cfg = AgentConfig { conntrack_enabled: true, ..Default::default() };
        let m = mgr(policy(ServiceMode::LoadBalancer), cfg);

        let ct_mark = m.ids().get_id_no_alloc(ns::SERVICE, &SVC.to_string()).unwrap() | 1 << 31;
        let zone = m.ids().get_id_no_alloc(ns::CT_ZONE, "/rd/1").unwrap() as u16;

        let svh = flows(&m, SVH_TABLE);
        assert!(svh.iter().all(|f| f.actions.contains(&Action::Conntrack(Conntrack {
            commit: true,
            zone,
            table: None,
            mark: Some(ct_mark),
        }))));
        assert!(svh.iter().all(|f| f.actions.last() == Some(&Action::GotoTable(ROUTE_TABLE))));

        // Per next hop: the untracked recirculation and the rewrite.
        let svr = flows(&m, SVR_TABLE);
        assert_eq!(svr.len(), 4);
        let rev = svr.iter().find(|f| f.matches.ct_mark == Some(ct_mark)).unwrap();
        assert!(rev.actions.contains(&Action::SetL4Src(80)));
        assert_eq!(rev.actions.last(), Some(&Action::Output(17)));

        // Interface admission bypasses policy.
        let sec = flows(&m, SEC_TABLE);
        assert_eq!(sec.len(), 1);
        assert_eq!(sec[0].priority, 90);
    }

    #[test]
    fn stats_follow_local_endpoints() {
        let mut m = mgr(policy(ServiceMode::LoadBalancer), AgentConfig::default());
        let stats = m.switch().flows_for(&stats_obj(SVC), STATS_TABLE);
        // any-svc and one per next hop, no local endpoint yet.
        assert_eq!(stats.len(), 3);

        m.port_status_update("veth0", Some(10));
        let stats = m.switch().flows_for(&stats_obj(SVC), STATS_TABLE);
        assert_eq!(stats.len(), 6);
        assert!(stats.iter().all(|f| f.flags.contains(FlowFlags::SEND_FLOW_REM)));

        let key = stats_key("ingress", "ep-svc", SVC, "10.20.44.2".parse().unwrap());
        let ck = m.ids().get_id_no_alloc(ns::SVC_STATS, &key).unwrap();
        assert!(stats.iter().any(|f| f.cookie == u64::from(ck) && f.priority == 30));
    }

    #[test]
    fn removed_service() {
        let mut m = mgr(policy(ServiceMode::LoadBalancer), AgentConfig::default());
        assert!(!flows(&m, BRIDGE_TABLE).is_empty());
        m.policy().update(|p| {
            p.services.clear();
        });
        m.service_updated(SVC);
        for t in SERVICE_TABLES {
            assert!(flows(&m, t).is_empty());
        }
        assert!(m.switch().flows_for(&stats_obj(SVC), STATS_TABLE).is_empty());
        assert!(m.ids().get_id_no_alloc(ns::SERVICE, &SVC.to_string()).is_none());
    }
}
