// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flows that do not belong to any policy object: the table-miss
//! entries, the admission of the uplink, and the glue between stages.

use super::FlowManager;
use super::common::action_output_to_epg_tunnel;
use super::common::nd;
use super::consts::*;
use super::encap::EncapFlows;
use gbp_api::InventoryMode;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::FlowEntry;
use gbp_flow::engine::SwitchConnection;
use gbp_flow::engine::TableId;
use gbp_flow::engine::flow::ETH_TYPE_ARP;
use gbp_flow::engine::flow::ETH_TYPE_IPV4;
use gbp_flow::engine::flow::ETH_TYPE_IPV6;
use gbp_flow::engine::flow::IP_PROTO_ICMP;
use gbp_flow::engine::flow::IP_PROTO_ICMPV6;
use gbp_flow::engine::flow::IP_PROTO_UDP;

pub(super) const STATIC_OBJ: &str = "static";

// ICMP error types handed to the controller after reverse NAT, so the
// embedded header can be translated too.
const ICMP_V4_ERRORS: [u16; 3] = [3, 11, 12];
const ICMP_V6_ERRORS: [u16; 3] = [1, 3, 4];

fn drop_flow(prio: u16) -> FlowBuilder {
    let mut fb = FlowBuilder::new();
    fb.priority(prio);
    fb
}

impl<C: SwitchConnection> FlowManager<C> {
    pub(super) fn create_static_flows(&mut self) {
        let env = self.env();
        let inventory = self.policy.load().inventory_mode();
        let mut tables: Vec<(TableId, Vec<FlowEntry>)> = vec![];

        // Table misses. With the drop log on, every miss detours
        // through the export table.
        let mut fb = FlowBuilder::new();
        fb.priority(0);
        if env.drop_log {
            fb.write_metadata(meta::DROP_LOG, meta::DROP_LOG);
        }
        tables.push((DROP_LOG_TABLE, vec![fb.go(SEC_TABLE).build()]));

        let mut misses: Vec<Vec<FlowEntry>> = (SEC_TABLE..=OUT_TABLE)
            .map(|_| {
                let mut fb = FlowBuilder::new();
                fb.priority(0).cookie(cookie::TABLE_DROP);
                if env.drop_log {
                    fb.go(EXP_DROP_TABLE);
                }
                vec![fb.build()]
            })
            .collect();
        let mut miss = |t: TableId| -> Vec<FlowEntry> {
            std::mem::take(&mut misses[usize::from(t - SEC_TABLE)])
        };

        let mut fb = FlowBuilder::new();
        fb.priority(0).cookie(cookie::DROP_LOG);
        if env.drop_log {
            fb.controller();
        }
        tables.push((EXP_DROP_TABLE, vec![fb.build()]));

        // ============================================================
        // Port security
        // ============================================================
        let mut sec = miss(SEC_TABLE);
        for et in [ETH_TYPE_ARP, ETH_TYPE_IPV4, ETH_TYPE_IPV6] {
            sec.push(drop_flow(25).eth_type(et).build());
        }

        sec.push(
            FlowBuilder::new()
                .priority(27)
                .eth_type(ETH_TYPE_IPV4)
                .ip_proto(IP_PROTO_UDP)
                .tp_src(68)
                .tp_dst(67)
                .go(SRC_TABLE)
                .build(),
        );
        sec.push(
            FlowBuilder::new()
                .priority(27)
                .eth_type(ETH_TYPE_IPV6)
                .ip_proto(IP_PROTO_UDP)
                .tp_src(546)
                .tp_dst(547)
                .go(SRC_TABLE)
                .build(),
        );
        let mut fb = FlowBuilder::new();
        fb.priority(27);
        nd(&mut fb, ND_ROUTER_SOLICIT).go(SRC_TABLE);
        sec.push(fb.build());

        if let Some((tun_port, _)) = env.tunnel() {
            sec.push(
                FlowBuilder::new().priority(50).in_port(tun_port).go(SRC_TABLE).build(),
            );
        }
        if let Some(uplink) = env.uplink_port {
            sec.push(FlowBuilder::new().priority(50).in_port(uplink).go(SRC_TABLE).build());
        }
        tables.push((SEC_TABLE, sec));

        // ============================================================
        // Glue between stages
        // ============================================================
        let mut svr = miss(SVR_TABLE);
        svr.push(FlowBuilder::new().priority(1).go(BRIDGE_TABLE).build());
        tables.push((SVR_TABLE, svr));

        let mut nat = miss(NAT_IN_TABLE);
        nat.push(FlowBuilder::new().priority(1).go(POL_TABLE).build());
        tables.push((NAT_IN_TABLE, nat));

        let mut stats = miss(STATS_TABLE);
        stats.push(FlowBuilder::new().priority(1).go(OUT_TABLE).build());
        tables.push((STATS_TABLE, stats));

        // Unknown unicast goes to the uplink unless the inventory is
        // complete.
        let unknown_to_tunnel = env.tunnel().is_some() && inventory != InventoryMode::Complete;
        let mut br = miss(BRIDGE_TABLE);
        let mut rt = miss(ROUTE_TABLE);
        if unknown_to_tunnel {
            let mut fb = FlowBuilder::new();
            fb.priority(1);
            br.push(action_output_to_epg_tunnel(&mut fb).build());
            if env.virtual_router {
                rt.push(fb.build());
            }
        }
        tables.push((BRIDGE_TABLE, br));
        tables.push((ROUTE_TABLE, rt));

        // ============================================================
        // Policy
        // ============================================================
        let mut pol = miss(POL_TABLE);
        pol.push(
            FlowBuilder::new()
                .priority(MAX_POLICY_RULE_PRIORITY + 51)
                .metadata(meta::FROM_SERVICE_INTERFACE, meta::FROM_SERVICE_INTERFACE)
                .go(STATS_TABLE)
                .build(),
        );
        pol.push(
            FlowBuilder::new()
                .priority(MAX_POLICY_RULE_PRIORITY + 50)
                .metadata(meta::POLICY_APPLIED, meta::POLICY_APPLIED)
                .build(),
        );
        pol.push(FlowBuilder::new().priority(10).eth_type(ETH_TYPE_ARP).go(STATS_TABLE).build());
        for t in [ND_NEIGHBOR_SOLICIT, ND_NEIGHBOR_ADVERT] {
            let mut fb = FlowBuilder::new();
            fb.priority(10);
            pol.push(nd(&mut fb, t).go(STATS_TABLE).build());
        }
        tables.push((POL_TABLE, pol));

        // ============================================================
        // Output
        // ============================================================
        let mut out = miss(OUT_TABLE);
        out.push(
            FlowBuilder::new()
                .priority(1)
                .metadata(0, meta::out::MASK)
                .output_reg(REG_OUTPORT)
                .build(),
        );
        out.push(
            FlowBuilder::new()
                .priority(1)
                .metadata(meta::out::REV_NAT, meta::out::MASK)
                .output_reg(REG_OUTPORT)
                .build(),
        );
        for t in ICMP_V4_ERRORS {
            out.push(
                FlowBuilder::new()
                    .priority(10)
                    .cookie(cookie::ICMP_ERROR_V4)
                    .metadata(meta::out::REV_NAT, meta::out::MASK)
                    .eth_type(ETH_TYPE_IPV4)
                    .ip_proto(IP_PROTO_ICMP)
                    .tp_src(t)
                    .controller()
                    .build(),
            );
        }
        for t in ICMP_V6_ERRORS {
            out.push(
                FlowBuilder::new()
                    .priority(10)
                    .cookie(cookie::ICMP_ERROR_V6)
                    .metadata(meta::out::REV_NAT, meta::out::MASK)
                    .eth_type(ETH_TYPE_IPV6)
                    .ip_proto(IP_PROTO_ICMPV6)
                    .tp_src(t)
                    .controller()
                    .build(),
            );
        }
        if let Some((tun_port, encap)) = env.tunnel()
            && encap.is_ip_overlay()
        {
            out.push(
                FlowBuilder::new()
                    .priority(10)
                    .metadata(meta::out::REMOTE_TUNNEL, meta::out::MASK)
                    .actions(encap.tunnel_actions(None))
                    .output(tun_port)
                    .build(),
            );
        }
        tables.push((OUT_TABLE, out));

        // Whatever remains is just the miss entry.
        for t in [SRC_TABLE, SVH_TABLE, LEARN_TABLE, SVD_TABLE] {
            tables.push((t, miss(t)));
        }

        for (t, flows) in tables {
            self.switch.write_flow(STATIC_OBJ, t, flows);
        }
    }
}
