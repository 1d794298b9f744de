// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Endpoint group flows.
//!
//! An EPG owns the flows that do not depend on any single endpoint:
//!
//! * classification of its traffic arriving from the uplink (SRC);
//! * its intra-group policy (POL);
//! * the broadcast flood entry of its flood scope (BR);
//! * the resubmit and tunnel output entries for its VNID (OUT).
//!
//! Its bridge domain and subnets get the virtual router entries (BR),
//! keyed by their own URIs since several groups may share them.

use super::FlowManager;
use super::common::FwdInfo;
use super::common::PipelineEnv;
use super::common::SourceRegs;
use super::common::action_arp_reply;
use super::common::action_controller;
use super::common::action_source;
use super::common::match_dest_arp;
use super::common::match_dest_nd;
use super::common::match_fd;
use super::common::match_group;
use super::consts::*;
use super::encap::EncapFlows;
use super::flood::floods_unknown;
use crate::model::PolicySnapshot;
use gbp_api::BcastFloodMode;
use gbp_api::EncapType;
use gbp_api::IntraGroupPolicy;
use gbp_api::Uri;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::SwitchConnection;
use slog::debug;
use std::collections::BTreeSet;
use std::net::IpAddr;

impl<C: SwitchConnection> FlowManager<C> {
    pub(super) fn update_epg(&mut self, epg: &Uri) {
        let snap = self.policy.load();
        let env = self.env();
        let obj = epg.as_str();

        let Some(group) = snap.group(epg) else {
            debug!(self.log, "cleaning up endpoint group"; "epg" => %epg);
            for t in [SRC_TABLE, POL_TABLE, OUT_TABLE, BRIDGE_TABLE] {
                self.switch.clear_flows(obj, t);
            }
            self.update_multicast_list(None, epg);
            self.update_group_dependents(&snap, epg);
            return;
        };

        let Some(fwd) = self.fwd_info(&snap, epg) else {
            debug!(self.log, "endpoint group has no forwarding info"; "epg" => %epg);
            for t in [SRC_TABLE, POL_TABLE, OUT_TABLE, BRIDGE_TABLE] {
                self.switch.clear_flows(obj, t);
            }
            self.update_group_dependents(&snap, epg);
            return;
        };

        let fd = snap.group_fd(epg).map(|(_, fd)| fd);
        let tun_dst = self.epg_tunnel_dst(&snap, epg);
        let regs = SourceRegs::from(&fwd);

        // Traffic of the group arriving from the uplink. Policy was
        // applied at the sender.
        let mut src = vec![];
        if let Some((tun_port, encap)) = env.tunnel() {
            let next = if fd.is_some_and(floods_unknown) { LEARN_TABLE } else { SVR_TABLE };
            let mut fb = FlowBuilder::new();
            fb.priority(149).in_port(tun_port);
            encap.source_match(&mut fb, fwd.vnid);
            action_source(&mut fb, regs, next, Some(encap), true);
            src.push(fb.build());
        }
        self.switch.write_flow(obj, SRC_TABLE, src);

        let mut fb = FlowBuilder::new();
        match group.intra_policy {
            IntraGroupPolicy::Deny => {
                match_group(&mut fb, MAX_POLICY_RULE_PRIORITY + 200, fwd.vnid, fwd.vnid);
            }
            IntraGroupPolicy::RequireContract => {
                match_group(&mut fb, MAX_POLICY_RULE_PRIORITY + 100, fwd.vnid, fwd.vnid)
                    .metadata(meta::POLICY_APPLIED, meta::POLICY_APPLIED)
                    .go(STATS_TABLE);
            }
            IntraGroupPolicy::Allow => {
                match_group(&mut fb, MAX_POLICY_RULE_PRIORITY + 100, fwd.vnid, fwd.vnid)
                    .go(STATS_TABLE);
            }
        }
        self.switch.write_flow(obj, POL_TABLE, vec![fb.build()]);

        if env.virtual_router && fwd.rd_id != 0 && fwd.bd_id != 0 {
            self.update_group_subnets(&snap, &env, epg, &fwd);

            let mut br = vec![];
            if snap.routing_enabled(epg) {
                br.push(
                    FlowBuilder::new()
                        .priority(2)
                        .reg(REG_BD, fwd.bd_id)
                        .go(ROUTE_TABLE)
                        .build(),
                );
            }
            if env.router_adv {
                let mut fb = FlowBuilder::new();
                fb.priority(20).cookie(cookie::NEIGH_DISC);
                match_dest_nd(&mut fb, None, fwd.bd_id, fwd.rd_id, ND_ROUTER_SOLICIT);
                br.push(action_controller(&mut fb, 0, 0).build());
            }
            if let Some(bd) = &fwd.bd {
                self.switch.write_flow(bd.as_str(), BRIDGE_TABLE, br);
            }
        }

        let mut flood = vec![];
        if fwd.fgrp.is_some() {
            let mut fb = FlowBuilder::new();
            fb.priority(10);
            match_fd(&mut fb, fwd.fgrp_id, true, None).reg(REG_SEPG, fwd.vnid);
            if fd.is_some_and(|fd| fd.bcast_flood_mode == BcastFloodMode::Isolated) {
                fb.metadata(meta::POLICY_APPLIED, meta::POLICY_APPLIED);
            }
            if let Some(dst) = tun_dst {
                fb.load_reg(REG_OUTPORT, u32::from(dst));
            }
            fb.write_metadata(meta::out::FLOOD, meta::out::MASK).go(OUT_TABLE);
            flood.push(fb.build());
        }
        self.switch.write_flow(obj, BRIDGE_TABLE, flood);

        let mut out = vec![];
        out.push(
            FlowBuilder::new()
                .priority(10)
                .reg(REG_OUTPORT, fwd.vnid)
                .metadata(meta::out::RESUBMIT_DST, meta::out::MASK)
                .load_reg(REG_SEPG, fwd.vnid)
                .load_reg(REG_BD, fwd.bd_id)
                .load_reg(REG_FD, fwd.fgrp_id)
                .load_reg(REG_RD, fwd.rd_id)
                .load_reg(REG_OUTPORT, 0)
                .write_metadata(meta::ROUTED, u64::MAX)
                .resubmit(None, BRIDGE_TABLE)
                .build(),
        );
        if let Some((tun_port, encap)) = env.tunnel() {
            out.push(
                FlowBuilder::new()
                    .priority(10)
                    .reg(REG_SEPG, fwd.vnid)
                    .metadata(meta::out::TUNNEL, meta::out::MASK)
                    .actions(encap.tunnel_actions(tun_dst))
                    .output(tun_port)
                    .build(),
            );
            // Routed traffic towards the virtual router goes to the
            // unicast tunnel destination.
            if encap != EncapType::Vlan {
                out.push(
                    FlowBuilder::new()
                        .priority(11)
                        .reg(REG_SEPG, fwd.vnid)
                        .eth_dst(env.router_mac)
                        .metadata(meta::out::TUNNEL, meta::out::MASK)
                        .actions(encap.tunnel_actions(Some(env.tunnel_dst)))
                        .output(tun_port)
                        .build(),
                );
            }
        }
        self.switch.write_flow(obj, OUT_TABLE, out);

        self.update_multicast_list(group.multicast_ip.as_deref(), epg);
        if let Some((_, fd)) = snap.group_fd(epg)
            && let Some(fc) = &fd.flood_context
        {
            let ip = snap.flood_contexts.get(fc).and_then(|c| c.multicast_ip.as_deref());
            self.update_multicast_list(ip, fc);
        }

        self.update_group_dependents(&snap, epg);
    }

    /// Recompute what depends on a group's forwarding: the routing
    /// domains NATing into it, its endpoints and remote endpoints, and
    /// its contracts.
    fn update_group_dependents(&mut self, snap: &PolicySnapshot, epg: &Uri) {
        let mut mapped = BTreeSet::new();
        let mut rds = BTreeSet::new();
        for (uuid, ep) in &snap.endpoints {
            if ep.ip_mappings.iter().any(|m| &m.egroup == epg) {
                mapped.insert(*uuid);
                if let Some(rd) = ep.egroup.as_ref().and_then(|g| snap.group_rd(g)) {
                    rds.insert(rd.0.clone());
                }
            }
        }
        for (uri, rd) in &snap.routing_domains {
            let nats_into = rd.external_networks.iter().any(|e| {
                snap.external_networks
                    .get(e)
                    .is_some_and(|n| n.nat_epg.as_ref() == Some(epg))
            });
            if nats_into {
                rds.insert(uri.clone());
            }
        }

        for rd in rds {
            self.update_routing_domain(&rd);
        }
        mapped.extend(snap.endpoints_in_group(epg));
        for uuid in mapped {
            self.update_endpoint(uuid);
        }
        for key in snap.remote_endpoints_in_group(epg) {
            self.update_remote_endpoint(&key);
        }
        for c in snap.contracts_for_group(epg) {
            self.update_contract(&c);
        }
    }

    /// Answer ARP and ND for the virtual router address of each subnet
    /// of the group. Requests for it arriving from the uplink are
    /// dropped; the remote side has its own router.
    fn update_group_subnets(
        &mut self,
        snap: &PolicySnapshot,
        env: &PipelineEnv,
        epg: &Uri,
        fwd: &FwdInfo,
    ) {
        for (uri, subnet) in snap.group_subnets(epg) {
            let mut br = vec![];
            match subnet.virtual_router_ip {
                Some(IpAddr::V4(ip)) => {
                    if let Some(tun_port) = env.tun_port {
                        let mut fb = FlowBuilder::new();
                        fb.priority(22).in_port(tun_port);
                        br.push(match_dest_arp(&mut fb, ip, fwd.bd_id, fwd.rd_id).build());
                    }
                    let mut fb = FlowBuilder::new();
                    fb.priority(20);
                    match_dest_arp(&mut fb, ip, fwd.bd_id, fwd.rd_id);
                    br.push(action_arp_reply(&mut fb, env.router_mac, ip, None).build());
                }
                Some(IpAddr::V6(_)) => {
                    let ll = env.router_mac.to_link_local();
                    if let Some(tun_port) = env.tun_port {
                        let mut fb = FlowBuilder::new();
                        fb.priority(22).in_port(tun_port).cookie(cookie::NEIGH_DISC);
                        match_dest_nd(&mut fb, Some(ll), fwd.bd_id, fwd.rd_id, ND_NEIGHBOR_SOLICIT);
                        br.push(fb.build());
                    }
                    let metadata = env.router_mac.to_u64_le() | (1 << 56) | (1 << 48);
                    let mut fb = FlowBuilder::new();
                    fb.priority(20).cookie(cookie::NEIGH_DISC);
                    match_dest_nd(&mut fb, Some(ll), fwd.bd_id, fwd.rd_id, ND_NEIGHBOR_SOLICIT);
                    br.push(action_controller(&mut fb, 0, metadata).build());
                }
                None => {}
            }
            self.switch.write_flow(uri.as_str(), BRIDGE_TABLE, br);
        }
    }
}
