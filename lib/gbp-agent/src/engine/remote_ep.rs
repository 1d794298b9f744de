// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Remote endpoints: peers on another site, reached through their own
//! tunnel destination rather than the EPG's.
//!
//! The destination is carried in `reg7` and picked up by the output
//! table's remote tunnel entry, so these flows only exist on an IP
//! overlay.

use super::FlowManager;
use super::common::Discovery;
use super::common::proxy_discovery;
use super::consts::*;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::SwitchConnection;
use slog::debug;

fn remote_obj(key: &str) -> String {
    format!("remote:{key}")
}

impl<C: SwitchConnection> FlowManager<C> {
    pub(super) fn update_remote_endpoint(&mut self, key: &str) {
        let snap = self.policy.load();
        let env = self.env();
        let obj = remote_obj(key);

        let rep = snap.remote_endpoints.get(key);
        let fwd = rep.and_then(|r| self.fwd_info(&snap, &r.egroup));
        let (Some(rep), Some(fwd), true) = (rep, fwd, env.is_ip_overlay()) else {
            debug!(self.log, "cleaning up remote endpoint"; "key" => key);
            for t in [BRIDGE_TABLE, ROUTE_TABLE] {
                self.switch.clear_flows(&obj, t);
            }
            return;
        };
        debug!(self.log, "updating remote endpoint";
            "key" => key, "tunnel" => %rep.tunnel_ip);

        let tun_dst = u32::from(rep.tunnel_ip);
        let (mut br, mut rt) = (vec![], vec![]);

        if fwd.bd_id != 0 {
            br.push(
                FlowBuilder::new()
                    .priority(15)
                    .reg(REG_BD, fwd.bd_id)
                    .eth_dst(rep.mac)
                    .load_reg(REG_DEPG, fwd.vnid)
                    .load_reg(REG_OUTPORT, tun_dst)
                    .write_metadata(meta::out::REMOTE_TUNNEL, meta::out::MASK)
                    .go(POL_TABLE)
                    .build(),
            );
        }

        let routed = fwd.rd_id != 0 && snap.routing_enabled(&rep.egroup);
        for ip in &rep.ips {
            if routed {
                rt.push(
                    FlowBuilder::new()
                        .priority(490)
                        .reg(REG_RD, fwd.rd_id)
                        .ip_dst(*ip)
                        .set_eth_src(env.router_mac)
                        .set_eth_dst(rep.mac)
                        .dec_ttl()
                        .load_reg(REG_DEPG, fwd.vnid)
                        .load_reg(REG_OUTPORT, tun_dst)
                        .write_metadata(
                            meta::out::REMOTE_TUNNEL | meta::ROUTED,
                            meta::out::MASK | meta::ROUTED,
                        )
                        .go(POL_TABLE)
                        .build(),
                );
            }

            let d = Discovery {
                ip: *ip,
                mac: rep.mac,
                vnid: fwd.vnid,
                bd: fwd.bd_id,
                rd: fwd.rd_id,
                router: false,
                src_mac: None,
            };
            proxy_discovery(&env, &mut br, 20, &d);
        }

        self.switch.write_flow(&obj, BRIDGE_TABLE, br);
        self.switch.write_flow(&obj, ROUTE_TABLE, rt);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg::AgentConfig;
    use crate::model::BridgeDomain;
    use crate::model::EndpointGroup;
    use crate::model::PolicySnapshot;
    use crate::model::PolicyStore;
    use crate::model::RemoteEndpoint;
    use crate::model::RoutingDomain;
    use gbp_api::EncapType;
    use gbp_api::Uri;
    use gbp_flow::engine::MockSwitch;
    use gbp_flow::engine::flow::Action;
    use slog::Logger;
    use slog::o;

    fn policy() -> PolicySnapshot {
        let mut snap = PolicySnapshot::default();
        snap.bridge_domains.insert(Uri::from("/bd/1"), BridgeDomain::default());
        snap.routing_domains.insert(Uri::from("/rd/1"), RoutingDomain::default());
        snap.endpoint_groups.insert(
            Uri::from("/epg/1"),
            EndpointGroup {
                vnid: Some(0xA0A),
                bridge_domain: Some(Uri::from("/bd/1")),
                routing_domain: Some(Uri::from("/rd/1")),
                ..Default::default()
            },
        );
        snap.remote_endpoints.insert(
            "site2-ep1".to_string(),
            RemoteEndpoint {
                mac: "00:00:00:00:80:00".parse().unwrap(),
                ips: vec!["10.20.45.31".parse().unwrap(), "2001:db8::31".parse().unwrap()],
                egroup: Uri::from("/epg/1"),
                tunnel_ip: "192.168.1.9".parse().unwrap(),
            },
        );
        snap
    }

    fn mgr(encap: EncapType) -> FlowManager<MockSwitch> {
        let log = Logger::root(slog::Discard, o!());
        let cfg = AgentConfig {
            encap_type: Some(encap),
            encap_iface: "uplink".to_string(),
            ..Default::default()
        };
        let mut m =
            FlowManager::new(&log, cfg, PolicyStore::from(policy()), MockSwitch::new())
                .unwrap();
        m.start();
        m.port_status_update("uplink", Some(2));
        m
    }

    #[test]
    fn remote_tunnel_redirects() {
        let m = mgr(EncapType::Vxlan);
        let obj = remote_obj("site2-ep1");

        let br = m.switch().flows_for(&obj, BRIDGE_TABLE);
        let dest = br.iter().find(|f| f.priority == 15).unwrap();
        assert!(dest.actions.contains(&Action::LoadReg {
            reg: REG_OUTPORT,
            value: u32::from(std::net::Ipv4Addr::new(192, 168, 1, 9)),
        }));
        // ARP on both sides of the tunnel, ND to the controller.
        assert_eq!(br.iter().filter(|f| f.priority >= 20).count(), 3);

        let rt = m.switch().flows_for(&obj, ROUTE_TABLE);
        assert_eq!(rt.len(), 2);
        assert!(rt.iter().all(|f| f.actions.contains(&Action::WriteMetadata {
            value: meta::out::REMOTE_TUNNEL | meta::ROUTED,
            mask: meta::out::MASK | meta::ROUTED,
        })));
    }

    #[test]
    fn vlan_uplink_has_no_remote_flows() {
        let m = mgr(EncapType::Vlan);
        let obj = remote_obj("site2-ep1");
        assert!(m.switch().flows_for(&obj, BRIDGE_TABLE).is_empty());
        assert!(m.switch().flows_for(&obj, ROUTE_TABLE).is_empty());
    }

    #[test]
    fn removed_remote_endpoint() {
        let mut m = mgr(EncapType::Vxlan);
        m.policy().update(|p| {
            p.remote_endpoints.clear();
        });
        m.remote_endpoint_updated("site2-ep1");
        let obj = remote_obj("site2-ep1");
        assert!(m.switch().flows_for(&obj, BRIDGE_TABLE).is_empty());
        assert!(m.switch().flows_for(&obj, ROUTE_TABLE).is_empty());
    }
}
