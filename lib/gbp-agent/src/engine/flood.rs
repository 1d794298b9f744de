// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flood groups.
//!
//! Every flood scope (a flood domain, or an EPG when flooding is per
//! EPG) with at least one local endpoint has two groups on the switch:
//! one with a bucket per member port, and a companion at
//! [`FlowManager::prom_id`] holding only the promiscuous members. Both
//! carry an extra bucket to the uplink when a tunnel is present. A
//! scope whose last member leaves has both groups deleted.

use super::FlowManager;
use super::common::match_fd;
use super::consts::*;
use super::encap::EncapFlows;
use crate::model::FloodDomain;
use crate::model::PolicySnapshot;
use gbp_api::BcastFloodMode;
use gbp_api::FloodScope;
use gbp_api::UnknownFloodMode;
use gbp_api::Uri;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::GroupBuilder;
use gbp_flow::engine::GroupEntry;
use gbp_flow::engine::SwitchConnection;
use gbp_flow::engine::flow::Action;
use slog::debug;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) struct FloodMember {
    pub port: u32,
    pub promiscuous: bool,
}

/// The local members of one flood scope, by endpoint.
pub(super) type FloodGroup = BTreeMap<Uuid, FloodMember>;

fn flood_obj(fgrp: &Uri) -> String {
    format!("fd:{fgrp}")
}

/// Whether unknown unicast in the domain is flooded, in which case it
/// is learned proactively.
pub(super) fn floods_unknown(fd: &FloodDomain) -> bool {
    fd.unknown_flood_mode == UnknownFloodMode::Flood
        && fd.bcast_flood_mode == BcastFloodMode::Normal
}

impl<C: SwitchConnection> FlowManager<C> {
    /// The flood domain governing flood scope `fgrp`.
    pub(super) fn scope_flood_domain<'a>(
        &self,
        snap: &'a PolicySnapshot,
        fgrp: &Uri,
    ) -> Option<&'a FloodDomain> {
        match self.cfg.flood_scope {
            FloodScope::FloodDomain => snap.flood_domains.get(fgrp),
            FloodScope::EndpointGroup => snap.group_fd(fgrp).map(|(_, fd)| fd),
        }
    }

    fn flood_group_entry(&self, id: u32, members: &FloodGroup, prom_only: bool) -> GroupEntry {
        let mut gb = GroupBuilder::new(id);
        for m in members.values().filter(|m| !prom_only || m.promiscuous) {
            gb.bucket(m.port, vec![Action::Output(m.port)]);
        }
        if let Some((tun_port, encap)) = self.env().tunnel() {
            let mut actions = encap.tunnel_actions(None);
            actions.push(Action::Output(tun_port));
            gb.bucket(tun_port, actions);
        }
        gb.build()
    }

    /// Put `uuid` in flood scope `fgrp`, taking it out of any other.
    pub(super) fn update_endpoint_flood_group(
        &mut self,
        uuid: Uuid,
        fgrp: &Uri,
        member: FloodMember,
    ) {
        let elsewhere: Vec<Uri> = self
            .flood_groups
            .iter()
            .filter(|(u, g)| *u != fgrp && g.contains_key(&uuid))
            .map(|(u, _)| u.clone())
            .collect();
        for u in elsewhere {
            if let Some(g) = self.flood_groups.get_mut(&u) {
                g.remove(&uuid);
            }
            self.write_flood_group(&u);
        }

        let group = self.flood_groups.entry(fgrp.clone()).or_default();
        if group.insert(uuid, member) != Some(member) {
            self.write_flood_group(fgrp);
        }
    }

    pub(super) fn remove_endpoint_from_flood_group(&mut self, uuid: Uuid) {
        let holding: Vec<Uri> = self
            .flood_groups
            .iter()
            .filter(|(_, g)| g.contains_key(&uuid))
            .map(|(u, _)| u.clone())
            .collect();
        for u in holding {
            if let Some(g) = self.flood_groups.get_mut(&u) {
                g.remove(&uuid);
            }
            self.write_flood_group(&u);
        }
    }

    /// Write the groups of flood scope `fgrp` and the flows that use
    /// them, or remove all of it once the scope has no members.
    fn write_flood_group(&mut self, fgrp: &Uri) {
        let obj = flood_obj(fgrp);
        let id = self.id(ns::FLOOD_DOMAIN, fgrp);

        if self.flood_groups.get(fgrp).is_none_or(|g| g.is_empty()) {
            debug!(self.log, "removing flood group"; "fgrp" => %fgrp, "id" => id);
            self.flood_groups.remove(fgrp);
            self.switch.delete_group(id);
            self.switch.delete_group(Self::prom_id(id));
            for t in [OUT_TABLE, BRIDGE_TABLE, LEARN_TABLE] {
                self.switch.clear_flows(&obj, t);
            }
            return;
        }

        let Some(members) = self.flood_groups.get(fgrp) else {
            return;
        };
        let all = self.flood_group_entry(id, members, false);
        let prom = self.flood_group_entry(Self::prom_id(id), members, true);
        self.switch.write_group(all);
        self.switch.write_group(prom);

        let out = FlowBuilder::new()
            .priority(10)
            .reg(REG_FD, id)
            .metadata(meta::out::FLOOD, meta::out::MASK)
            .group(id)
            .build();
        self.switch.write_flow(&obj, OUT_TABLE, vec![out]);

        let snap = self.policy.load();
        let learn = self.scope_flood_domain(&snap, fgrp).is_some_and(floods_unknown);
        let (mut br, mut lrn) = (vec![], vec![]);
        if learn {
            let mut fb = FlowBuilder::new();
            fb.priority(5);
            br.push(match_fd(&mut fb, id, false, None).go(LEARN_TABLE).build());

            let mut fb = FlowBuilder::new();
            fb.priority(5).cookie(cookie::PROACTIVE_LEARN);
            lrn.push(match_fd(&mut fb, id, false, None).controller().build());
        }
        self.switch.write_flow(&obj, BRIDGE_TABLE, br);
        self.switch.write_flow(&obj, LEARN_TABLE, lrn);
    }

    /// Rewrite every flood group, as when the tunnel port changes.
    pub(super) fn update_group_table(&mut self) {
        let scopes: Vec<Uri> = self.flood_groups.keys().cloned().collect();
        for fgrp in scopes {
            self.write_flood_group(&fgrp);
        }
    }

    pub fn flood_group_members(&self, fgrp: &Uri) -> Vec<Uuid> {
        self.flood_groups.get(fgrp).map(|g| g.keys().copied().collect()).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg::AgentConfig;
    use crate::model::PolicyStore;
    use gbp_api::EncapType;
    use gbp_flow::engine::MockSwitch;
    use gbp_flow::engine::flow::Field;
    use slog::Logger;
    use slog::o;

    fn mgr() -> FlowManager<MockSwitch> {
        let log = Logger::root(slog::Discard, o!());
        let cfg = AgentConfig {
            encap_type: Some(EncapType::Vxlan),
            encap_iface: "br0_vxlan0".to_string(),
            ..Default::default()
        };
        let mut snap = PolicySnapshot::default();
        snap.flood_domains.insert(
            Uri::from("/fd/1"),
            FloodDomain {
                unknown_flood_mode: UnknownFloodMode::Flood,
                ..Default::default()
            },
        );
        let mut m =
            FlowManager::new(&log, cfg, PolicyStore::from(snap), MockSwitch::new())
                .unwrap();
        m.start();
        m
    }

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn members_and_tunnel_bucket() {
        let mut m = mgr();
        m.port_status_update("br0_vxlan0", Some(2));
        let fd = Uri::from("/fd/1");

        m.update_endpoint_flood_group(uuid(1), &fd, FloodMember { port: 10, promiscuous: false });
        m.update_endpoint_flood_group(uuid(2), &fd, FloodMember { port: 11, promiscuous: true });

        let id = m.ids().get_id_no_alloc(ns::FLOOD_DOMAIN, "/fd/1").unwrap();
        let all = m.switch().group(id).unwrap();
        let ports: Vec<u32> = all.buckets().iter().map(|b| b.id).collect();
        assert_eq!(ports, vec![2, 10, 11]);
        let tun = all.buckets().iter().find(|b| b.id == 2).unwrap();
        assert!(tun.actions.contains(&Action::Move {
            src: Field::Reg(REG_OUTPORT),
            dst: Field::TunDst,
        }));

        let prom = m.switch().group(FlowManager::<MockSwitch>::prom_id(id)).unwrap();
        let ports: Vec<u32> = prom.buckets().iter().map(|b| b.id).collect();
        assert_eq!(ports, vec![2, 11]);

        // Unknown unicast is flooded, so it is learned proactively.
        assert_eq!(m.switch().flows_for("fd:/fd/1", LEARN_TABLE).len(), 1);
        assert_eq!(m.switch().flows_for("fd:/fd/1", OUT_TABLE).len(), 1);
    }

    #[test]
    fn last_member_removes_groups() {
        let mut m = mgr();
        let fd = Uri::from("/fd/1");
        m.update_endpoint_flood_group(uuid(1), &fd, FloodMember { port: 10, promiscuous: false });
        let id = m.ids().get_id_no_alloc(ns::FLOOD_DOMAIN, "/fd/1").unwrap();
        assert!(m.switch().group(id).is_some());

        m.remove_endpoint_from_flood_group(uuid(1));
        assert!(m.switch().group(id).is_none());
        assert!(m.switch().flows_for("fd:/fd/1", OUT_TABLE).is_empty());
        assert!(m.flood_group_members(&fd).is_empty());
        assert!(m.switch().conn().group(id).is_none());
    }

    #[test]
    fn moving_scope_leaves_old_group() {
        let mut m = mgr();
        let a = Uri::from("/fd/1");
        let b = Uri::from("/fd/2");
        let member = FloodMember { port: 10, promiscuous: false };
        m.update_endpoint_flood_group(uuid(1), &a, member);
        m.update_endpoint_flood_group(uuid(2), &a, FloodMember { port: 12, ..member });
        m.update_endpoint_flood_group(uuid(1), &b, member);

        assert_eq!(m.flood_group_members(&a), vec![uuid(2)]);
        assert_eq!(m.flood_group_members(&b), vec![uuid(1)]);
    }
}
