// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Routing domain flows: internal subnets, external networks, and the
//! domain's default policy.

use super::FlowManager;
use super::common::action_output_to_epg_tunnel;
use super::common::match_subnet;
use super::consts::*;
use gbp_api::EnforcementMode;
use gbp_api::Uri;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::SwitchConnection;
use gbp_flow::engine::flow::IpPrefix;
use slog::debug;

impl<C: SwitchConnection> FlowManager<C> {
    pub(super) fn update_routing_domain(&mut self, rd: &Uri) {
        let snap = self.policy.load();
        let env = self.env();
        let obj = rd.as_str();

        let Some(rdom) = snap.routing_domains.get(rd) else {
            debug!(self.log, "cleaning up routing domain"; "rd" => %rd);
            for t in [NAT_IN_TABLE, ROUTE_TABLE, POL_TABLE] {
                self.switch.clear_flows(obj, t);
            }
            self.ids.erase(ns::ROUTING_DOMAIN, obj);
            self.ids.erase(ns::CT_ZONE, obj);
            for uuid in snap.services_in_domain(rd) {
                self.update_service(uuid);
            }
            return;
        };

        let rd_id = self.id(ns::ROUTING_DOMAIN, rd);
        let (mut rt, mut nat, mut pol) = (vec![], vec![], vec![]);

        // Internal subnets are never routed to an external network;
        // anything not local goes to the uplink.
        let extra = snap.rd_configs.get(rd).map(|c| c.internal_subnets.as_slice());
        for net in rdom.internal_subnets.iter().chain(extra.unwrap_or_default()) {
            let mut fb = FlowBuilder::new();
            match_subnet(&mut fb, rd_id, 300, IpPrefix::from(*net), false);
            if env.tunnel().is_some() {
                action_output_to_epg_tunnel(&mut fb);
            }
            rt.push(fb.build());
        }

        for ext in &rdom.external_networks {
            let Some(net) = snap.external_networks.get(ext) else {
                continue;
            };
            let net_vnid = self.ext_net_vnid(ext);
            let nat_vnid = net
                .nat_epg
                .as_ref()
                .and_then(|e| snap.group(e))
                .and_then(|g| g.vnid);

            for sub in &net.subnets {
                let prefix = IpPrefix::from(*sub);

                let mut fb = FlowBuilder::new();
                match_subnet(&mut fb, rd_id, 150, prefix, false);
                match (&net.nat_epg, nat_vnid) {
                    (Some(_), Some(nat_vnid)) => {
                        fb.load_reg(REG_DEPG, net_vnid)
                            .load_reg(REG_OUTPORT, nat_vnid)
                            .write_metadata(meta::out::NAT, meta::out::MASK)
                            .go(POL_TABLE);
                    }
                    // The NAT group is not resolved yet.
                    (Some(_), None) => {}
                    (None, _) => {
                        if env.tunnel().is_some() {
                            action_output_to_epg_tunnel(&mut fb);
                        }
                    }
                }
                rt.push(fb.build());

                // Return traffic is classified into the external
                // network; policy has not been applied to it.
                let mut fb = FlowBuilder::new();
                match_subnet(&mut fb, rd_id, 150, prefix, true)
                    .load_reg(REG_SEPG, net_vnid)
                    .write_metadata(meta::out::REV_NAT, meta::out::MASK | meta::POLICY_APPLIED)
                    .go(POL_TABLE);
                nat.push(fb.build());
            }
        }

        if rdom.enforcement == EnforcementMode::Unenforced {
            pol.push(
                FlowBuilder::new()
                    .priority(MAX_POLICY_RULE_PRIORITY + 60)
                    .reg(REG_RD, rd_id)
                    .go(STATS_TABLE)
                    .build(),
            );
        }
        pol.push(FlowBuilder::new().priority(1).reg(REG_RD, rd_id).build());

        self.switch.write_flow(obj, NAT_IN_TABLE, nat);
        self.switch.write_flow(obj, ROUTE_TABLE, rt);
        self.switch.write_flow(obj, POL_TABLE, pol);

        for uuid in snap.services_in_domain(rd) {
            self.update_service(uuid);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg::AgentConfig;
    use crate::model::EndpointGroup;
    use crate::model::L3ExternalNetwork;
    use crate::model::PolicySnapshot;
    use crate::model::PolicyStore;
    use crate::model::RdConfig;
    use crate::model::RoutingDomain;
    use gbp_flow::engine::MockSwitch;
    use gbp_flow::engine::flow::Action;
    use slog::Logger;
    use slog::o;

    fn policy() -> PolicySnapshot {
        let mut snap = PolicySnapshot::default();
        snap.routing_domains.insert(
            Uri::from("/rd/1"),
            RoutingDomain {
                internal_subnets: vec!["10.0.0.0/8".parse().unwrap()],
                external_networks: vec![Uri::from("/ext/1")],
                ..Default::default()
            },
        );
        snap.rd_configs.insert(
            Uri::from("/rd/1"),
            RdConfig { internal_subnets: vec!["192.168.0.0/16".parse().unwrap()] },
        );
        snap.external_networks.insert(
            Uri::from("/ext/1"),
            L3ExternalNetwork {
                nat_epg: Some(Uri::from("/epg/nat")),
                subnets: vec!["5.5.5.0/24".parse().unwrap()],
            },
        );
        snap.endpoint_groups.insert(
            Uri::from("/epg/nat"),
            EndpointGroup { vnid: Some(0x4242), ..Default::default() },
        );
        snap
    }

    fn mgr(snap: PolicySnapshot) -> FlowManager<MockSwitch> {
        let log = Logger::root(slog::Discard, o!());
        let mut m = FlowManager::new(
            &log,
            AgentConfig::default(),
            PolicyStore::from(snap),
            MockSwitch::new(),
        )
        .unwrap();
        m.start();
        m
    }

    #[test]
    fn external_network_nat() {
        let mut m = mgr(policy());
        let rd = Uri::from("/rd/1");
        m.domain_updated(gbp_api::ClassId::RoutingDomain, &rd);

        let rt = m.switch().flows_for("/rd/1", ROUTE_TABLE);
        assert_eq!(rt.len(), 3);
        let ext = rt.iter().find(|f| f.priority == 174).unwrap();
        let net_vnid = m.ext_net_vnid(&Uri::from("/ext/1"));
        assert!(net_vnid & PRIVATE_VNID != 0);
        assert!(ext.actions.contains(&Action::LoadReg { reg: REG_OUTPORT, value: 0x4242 }));
        assert!(ext.actions.contains(&Action::LoadReg { reg: REG_DEPG, value: net_vnid }));

        // No tunnel: internal subnets are dropped.
        assert!(rt.iter().filter(|f| f.priority == 308 || f.priority == 316).all(|f| f.is_drop()));

        let nat = m.switch().flows_for("/rd/1", NAT_IN_TABLE);
        assert_eq!(nat.len(), 1);
        assert!(nat[0].matches.ip_src.is_some());
        assert_eq!(nat[0].actions.last(), Some(&Action::GotoTable(POL_TABLE)));
    }

    #[test]
    fn unresolved_nat_group_drops() {
        let mut snap = policy();
        snap.endpoint_groups.clear();
        let mut m = mgr(snap);
        m.domain_updated(gbp_api::ClassId::RoutingDomain, &Uri::from("/rd/1"));
        let rt = m.switch().flows_for("/rd/1", ROUTE_TABLE);
        assert!(rt.iter().find(|f| f.priority == 174).unwrap().is_drop());
    }

    #[test]
    fn unenforced_domain_bypasses_policy() {
        let mut snap = policy();
        snap.routing_domains.get_mut(&Uri::from("/rd/1")).unwrap().enforcement =
            EnforcementMode::Unenforced;
        let mut m = mgr(snap);
        m.domain_updated(gbp_api::ClassId::RoutingDomain, &Uri::from("/rd/1"));
        let pol = m.switch().flows_for("/rd/1", POL_TABLE);
        assert_eq!(pol.len(), 2);
        assert!(pol.iter().any(|f| f.priority == MAX_POLICY_RULE_PRIORITY + 60
            && f.actions == vec![Action::GotoTable(STATS_TABLE)]));
    }

    #[test]
    fn removed_domain_releases_ids() {
        let mut m = mgr(policy());
        let rd = Uri::from("/rd/1");
        m.domain_updated(gbp_api::ClassId::RoutingDomain, &rd);
        assert!(m.ids().get_id_no_alloc(ns::ROUTING_DOMAIN, "/rd/1").is_some());

        m.policy().update(|p| {
            p.routing_domains.clear();
        });
        m.domain_updated(gbp_api::ClassId::RoutingDomain, &rd);
        assert!(m.ids().get_id_no_alloc(ns::ROUTING_DOMAIN, "/rd/1").is_none());
        for t in [NAT_IN_TABLE, ROUTE_TABLE, POL_TABLE] {
            assert!(m.switch().flows_for("/rd/1", t).is_empty());
        }
    }
}
