// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IP mapping (floating IP and SNAT) flows of a local endpoint.
//!
//! An IP mapping translates the endpoint's own `mapped_ip` to a
//! `floating_ip` in another group, the floating group. Outbound, a
//! packet from the endpoint that routing sent to the NAT group (see
//! the routing domain flows) is rewritten in the output table and
//! either resubmitted into the floating group's domains or handed to
//! the mapping's next hop interface. Inbound, traffic to the floating
//! IP is rewritten back to the mapped IP and delivered through the
//! reverse NAT table.
//!
//! A mapping is skipped when its addresses are of different families,
//! when the floating group has no forwarding information, or when its
//! next hop interface has no port yet.

use super::FlowManager;
use super::common::Discovery;
use super::common::FwdInfo;
use super::common::PipelineEnv;
use super::common::SourceRegs;
use super::common::action_rev_nat_dest;
use super::common::proxy_discovery;
use super::consts::*;
use super::endpoint::EndpointFlows;
use crate::model::Endpoint;
use crate::model::PolicySnapshot;
use gbp_api::MacAddr;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::PortMapper;
use gbp_flow::engine::SwitchConnection;
use slog::warn;

impl<C: SwitchConnection> FlowManager<C> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn ip_mapping_flows(
        &self,
        snap: &PolicySnapshot,
        env: &PipelineEnv,
        ep: &Endpoint,
        mac: MacAddr,
        port: u32,
        fwd: &FwdInfo,
        flows: &mut EndpointFlows,
    ) {
        let regs = SourceRegs::from(fwd);

        for ipm in &ep.ip_mappings {
            let mapped = ipm.mapped_ip;
            if let Some(fip) = ipm.floating_ip
                && fip.is_ipv4() != mapped.is_ipv4()
            {
                warn!(self.log, "ignoring IP mapping across address families";
                    "mapped" => %mapped, "floating" => %fip);
                continue;
            }
            let Some(ffwd) = self.fwd_info(snap, &ipm.egroup) else {
                continue;
            };
            let nh_port = match ipm.next_hop_if.as_deref() {
                Some(iface) => match self.ports.find_port(iface) {
                    Some(p) => Some(p),
                    None => continue,
                },
                None => None,
            };
            let nh_mac = ipm.next_hop_mac.unwrap_or(env.router_mac);

            if let Some(fip) = ipm.floating_ip {
                // Traffic to the floating IP from within its own group
                // is translated right away.
                let mut fb = FlowBuilder::new();
                fb.priority(452)
                    .ip_dst(fip)
                    .reg(REG_SEPG, ffwd.vnid)
                    .reg(REG_RD, ffwd.rd_id)
                    .set_eth_src(env.router_mac)
                    .set_eth_dst(mac)
                    .set_ip_dst(mapped)
                    .dec_ttl();
                flows.rt.push(action_rev_nat_dest(&mut fb, regs, port).build());

                // Anything else goes through policy first, as traffic
                // to the floating group, and is resubmitted to the
                // entry above.
                flows.rt.push(
                    FlowBuilder::new()
                        .priority(450)
                        .ip_dst(fip)
                        .reg(REG_RD, ffwd.rd_id)
                        .load_reg(REG_DEPG, ffwd.vnid)
                        .load_reg(REG_OUTPORT, ffwd.vnid)
                        .write_metadata(meta::out::RESUBMIT_DST, meta::out::MASK)
                        .go(POL_TABLE)
                        .build(),
                );

                let d = Discovery {
                    ip: fip,
                    mac,
                    vnid: ffwd.vnid,
                    bd: ffwd.bd_id,
                    rd: ffwd.rd_id,
                    router: false,
                    src_mac: None,
                };
                proxy_discovery(env, &mut flows.br, 20, &d);
            }

            // Outbound translation.
            let mut fb = FlowBuilder::new();
            fb.priority(10)
                .metadata(meta::out::NAT, meta::out::MASK)
                .reg(REG_RD, fwd.rd_id)
                .reg(REG_OUTPORT, ffwd.vnid)
                .ip_src(mapped)
                .set_eth_src(mac)
                .set_eth_dst(nh_mac);
            if let Some(fip) = ipm.floating_ip {
                fb.set_ip_src(fip);
            }
            fb.dec_ttl();
            match nh_port {
                None => {
                    fb.load_reg(REG_SEPG, ffwd.vnid)
                        .load_reg(REG_BD, ffwd.bd_id)
                        .load_reg(REG_FD, ffwd.fgrp_id)
                        .load_reg(REG_RD, ffwd.rd_id)
                        .load_reg(REG_OUTPORT, 0)
                        .write_metadata(meta::ROUTED, u64::MAX)
                        .resubmit(None, BRIDGE_TABLE);
                }
                Some(nh) => {
                    fb.set_pkt_mark(fwd.rd_id).output(nh);
                }
            }
            flows.out.push(fb.build());

            // Return traffic from the next hop.
            if let Some(nh) = nh_port {
                if let Some(fip) = ipm.floating_ip {
                    let mut fb = FlowBuilder::new();
                    fb.priority(201)
                        .in_port(nh)
                        .eth_src(nh_mac)
                        .ip_dst(fip)
                        .set_eth_src(env.router_mac)
                        .set_eth_dst(mac)
                        .set_ip_dst(mapped)
                        .dec_ttl();
                    flows.src.push(action_rev_nat_dest(&mut fb, regs, port).build());
                }

                let mut fb = FlowBuilder::new();
                fb.priority(200)
                    .in_port(nh)
                    .eth_src(nh_mac)
                    .pkt_mark(fwd.rd_id)
                    .ip_dst(mapped);
                if ipm.next_hop_mac.is_some() {
                    fb.set_eth_src(env.router_mac);
                }
                flows.src.push(action_rev_nat_dest(&mut fb, regs, port).build());
            }
        }
    }
}
