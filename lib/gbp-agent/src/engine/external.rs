// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Local external domains: external segments reached on a VLAN of the
//! physical uplink, routed within one routing domain.
//!
//! A domain takes part in contracts like a group, under a private
//! VNID.

use super::FlowManager;
use super::common::match_subnet;
use super::consts::*;
use gbp_api::Uri;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::SwitchConnection;
use gbp_flow::engine::flow::IpPrefix;
use slog::debug;

const LED_TABLES: [gbp_flow::engine::TableId; 3] = [SRC_TABLE, ROUTE_TABLE, OUT_TABLE];

impl<C: SwitchConnection> FlowManager<C> {
    /// Local external domains get private VNIDs.
    pub fn led_vnid(&self, uri: &Uri) -> u32 {
        self.id(ns::LOCAL_EXT_DOMAIN, uri) | PRIVATE_VNID
    }

    pub(super) fn update_local_external_domain(&mut self, uri: &Uri) {
        let snap = self.policy.load();
        let env = self.env();
        let obj = uri.as_str();

        let Some(led) = snap.local_external_domains.get(uri) else {
            debug!(self.log, "cleaning up local external domain"; "uri" => %uri);
            for t in LED_TABLES {
                self.switch.clear_flows(obj, t);
            }
            self.ids.erase(ns::LOCAL_EXT_DOMAIN, obj);
            for c in snap.contracts_for_group(uri) {
                self.update_contract(&c);
            }
            return;
        };

        let rd = snap.routing_domains.contains_key(&led.routing_domain).then_some(&led.routing_domain);
        let (Some(rd), Some(uplink)) = (rd, env.uplink_port) else {
            for t in LED_TABLES {
                self.switch.clear_flows(obj, t);
            }
            return;
        };
        debug!(self.log, "updating local external domain";
            "uri" => %uri, "vlan" => led.encap_vlan, "uplink" => uplink);

        let vnid = self.led_vnid(uri);
        let rd_id = self.id(ns::ROUTING_DOMAIN, rd);

        let src = vec![
            FlowBuilder::new()
                .priority(149)
                .in_port(uplink)
                .vlan(led.encap_vlan)
                .pop_vlan()
                .load_reg(REG_SEPG, vnid)
                .load_reg(REG_RD, rd_id)
                .go(SVR_TABLE)
                .build(),
        ];

        let mut rt = vec![];
        for net in &led.subnets {
            let mut fb = FlowBuilder::new();
            match_subnet(&mut fb, rd_id, 150, IpPrefix::from(*net), false)
                .set_eth_src(env.router_mac)
                .dec_ttl()
                .load_reg(REG_DEPG, vnid)
                .load_reg(REG_OUTPORT, uplink)
                .write_metadata(meta::ROUTED, meta::ROUTED)
                .go(POL_TABLE);
            rt.push(fb.build());
        }

        // Tag the domain's traffic on its way out.
        let out = vec![
            FlowBuilder::new()
                .priority(12)
                .reg(REG_DEPG, vnid)
                .metadata(0, meta::out::MASK)
                .push_vlan()
                .set_vlan_vid(led.encap_vlan)
                .output(uplink)
                .build(),
        ];

        self.switch.write_flow(obj, SRC_TABLE, src);
        self.switch.write_flow(obj, ROUTE_TABLE, rt);
        self.switch.write_flow(obj, OUT_TABLE, out);

        for c in snap.contracts_for_group(uri) {
            self.update_contract(&c);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg::AgentConfig;
    use crate::model::LocalExternalDomain;
    use crate::model::PolicySnapshot;
    use crate::model::PolicyStore;
    use crate::model::RoutingDomain;
    use gbp_flow::engine::MockSwitch;
    use gbp_flow::engine::flow::Action;
    use slog::Logger;
    use slog::o;

    fn mgr() -> FlowManager<MockSwitch> {
        let mut snap = PolicySnapshot::default();
        snap.routing_domains.insert(Uri::from("/rd/1"), RoutingDomain::default());
        snap.local_external_domains.insert(
            Uri::from("/led/1"),
            LocalExternalDomain {
                encap_vlan: 1000,
                routing_domain: Uri::from("/rd/1"),
                subnets: vec!["172.16.0.0/16".parse().unwrap()],
            },
        );
        let cfg = AgentConfig { uplink_iface: Some("eth1".to_string()), ..Default::default() };
        let log = Logger::root(slog::Discard, o!());
        let mut m =
            FlowManager::new(&log, cfg, PolicyStore::from(snap), MockSwitch::new()).unwrap();
        m.start();
        m
    }

    #[test]
    fn needs_uplink() {
        let mut m = mgr();
        let led = Uri::from("/led/1");
        m.local_external_domain_updated(&led);
        for t in LED_TABLES {
            assert!(m.switch().flows_for("/led/1", t).is_empty());
        }

        m.port_status_update("eth1", Some(3));
        let vnid = m.led_vnid(&led);
        assert!(vnid & PRIVATE_VNID != 0);

        let src = m.switch().flows_for("/led/1", SRC_TABLE);
        assert_eq!(src.len(), 1);
        assert!(src[0].actions.contains(&Action::LoadReg { reg: REG_SEPG, value: vnid }));

        let rt = m.switch().flows_for("/led/1", ROUTE_TABLE);
        assert_eq!(rt.len(), 1);
        assert_eq!(rt[0].priority, 166);

        let out = m.switch().flows_for("/led/1", OUT_TABLE);
        assert_eq!(out[0].actions, vec![Action::PushVlan, Action::SetVlanVid(1000), Action::Output(3)]);
    }

    #[test]
    fn removed_domain_releases_vnid() {
        let mut m = mgr();
        let led = Uri::from("/led/1");
        m.port_status_update("eth1", Some(3));
        assert!(m.ids().get_id_no_alloc(ns::LOCAL_EXT_DOMAIN, "/led/1").is_some());

        m.policy().update(|p| {
            p.local_external_domains.clear();
        });
        m.local_external_domain_updated(&led);
        assert!(m.ids().get_id_no_alloc(ns::LOCAL_EXT_DOMAIN, "/led/1").is_none());
        assert!(m.switch().flows_for("/led/1", ROUTE_TABLE).is_empty());
    }
}
