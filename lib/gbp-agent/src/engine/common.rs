// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Match and action fragments shared by the synthesis scopes.
//!
//! The fragments take and return `&mut FlowBuilder` so they chain with
//! the builder's own setters.

use super::consts::ARP_OP_REPLY;
use super::consts::ARP_OP_REQUEST;
use super::consts::ND_NEIGHBOR_SOLICIT;
use super::consts::OUT_TABLE;
use super::consts::POL_TABLE;
use super::consts::REG_BD;
use super::consts::REG_DEPG;
use super::consts::REG_FD;
use super::consts::REG_OUTPORT;
use super::consts::REG_RD;
use super::consts::REG_SEPG;
use super::consts::NAT_IN_TABLE;
use super::consts::cookie;
use super::consts::meta;
use super::encap::EncapFlows;
use gbp_api::EncapType;
use gbp_api::FloodScope;
use gbp_api::MacAddr;
use gbp_api::Uri;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::FlowEntry;
use gbp_flow::engine::TableId;
use gbp_flow::engine::flow::ETH_TYPE_IPV6;
use gbp_flow::engine::flow::Field;
use gbp_flow::engine::flow::IP_PROTO_ICMPV6;
use gbp_flow::engine::flow::IpPrefix;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

/// The agent-wide inputs every scope consults: the uplink, the
/// resolved tunnel port, and the virtual router and DHCP settings.
#[derive(Clone, Copy, Debug)]
pub struct PipelineEnv {
    pub encap: Option<EncapType>,
    pub tun_port: Option<u32>,
    pub uplink_port: Option<u32>,
    pub tunnel_dst: Ipv4Addr,
    pub flood_scope: FloodScope,
    pub router_mac: MacAddr,
    pub dhcp_mac: MacAddr,
    pub virtual_router: bool,
    pub router_adv: bool,
    pub virtual_dhcp: bool,
    pub conntrack: bool,
    pub drop_log: bool,
}

impl PipelineEnv {
    /// The tunnel port and encapsulation, when the uplink is both
    /// configured and present on the switch.
    pub fn tunnel(&self) -> Option<(u32, EncapType)> {
        Some((self.tun_port?, self.encap?))
    }

    pub fn is_ip_overlay(&self) -> bool {
        self.encap.is_some_and(|e| e.is_ip_overlay())
    }
}

/// How traffic of one EPG is forwarded: its VNID and the ids of the
/// domains it belongs to. An id of 0 means the domain is absent.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FwdInfo {
    pub vnid: u32,
    pub rd: Option<Uri>,
    pub rd_id: u32,
    pub bd: Option<Uri>,
    pub bd_id: u32,
    /// The flood scope: the flood domain, or the EPG itself when
    /// flooding is per EPG.
    pub fgrp: Option<Uri>,
    pub fgrp_id: u32,
}

// ================================================================
// Matches
// ================================================================

pub fn match_dest_dom(fb: &mut FlowBuilder, bd: u32, rd: u32) -> &mut FlowBuilder {
    if bd != 0 {
        fb.reg(REG_BD, bd);
    }
    if rd != 0 {
        fb.reg(REG_RD, rd);
    }
    fb
}

/// Match a broadcast ARP request for `ip`.
pub fn match_dest_arp(
    fb: &mut FlowBuilder,
    ip: Ipv4Addr,
    bd: u32,
    rd: u32,
) -> &mut FlowBuilder {
    fb.arp_tpa(IpPrefix::host(IpAddr::V4(ip)))
        .arp_op(ARP_OP_REQUEST)
        .eth_dst(MacAddr::BROADCAST);
    match_dest_dom(fb, bd, rd)
}

/// Match an ICMPv6 neighbor discovery message of type `nd_type`.
pub fn nd(fb: &mut FlowBuilder, nd_type: u16) -> &mut FlowBuilder {
    fb.eth_type(ETH_TYPE_IPV6)
        .ip_proto(IP_PROTO_ICMPV6)
        .tp_src(nd_type)
        .tp_dst(0)
}

/// Match a multicast ND message of `nd_type`, optionally for a given
/// target address.
pub fn match_dest_nd(
    fb: &mut FlowBuilder,
    target: Option<Ipv6Addr>,
    bd: u32,
    rd: u32,
    nd_type: u16,
) -> &mut FlowBuilder {
    match_dest_dom(fb, bd, rd);
    nd(fb, nd_type).eth_dst_masked(MacAddr::MULTICAST, MacAddr::MULTICAST);
    if let Some(ip) = target {
        fb.nd_target(IpPrefix::host(IpAddr::V6(ip)));
    }
    fb
}

/// Match traffic in flood group `fgrp`: to `mac` when given, else any
/// multicast destination when `broadcast`.
pub fn match_fd(
    fb: &mut FlowBuilder,
    fgrp: u32,
    broadcast: bool,
    mac: Option<MacAddr>,
) -> &mut FlowBuilder {
    fb.reg(REG_FD, fgrp);
    match mac {
        Some(mac) => {
            fb.eth_dst(mac);
        }
        None if broadcast => {
            fb.eth_dst_masked(MacAddr::MULTICAST, MacAddr::MULTICAST);
        }
        None => {}
    }
    fb
}

/// Match a subnet within routing domain `rd`, at a priority that grows
/// with the prefix length so longer prefixes win.
pub fn match_subnet(
    fb: &mut FlowBuilder,
    rd: u32,
    base_prio: u16,
    net: IpPrefix,
    src: bool,
) -> &mut FlowBuilder {
    fb.priority(base_prio + u16::from(net.len())).reg(REG_RD, rd);
    if src { fb.ip_src_prefix(net) } else { fb.ip_dst_prefix(net) }
}

/// Match traffic from source EPG `s` to destination EPG `d`. A zero
/// VNID is a wildcard.
pub fn match_group(fb: &mut FlowBuilder, prio: u16, s: u32, d: u32) -> &mut FlowBuilder {
    fb.priority(prio);
    if s != 0 {
        fb.reg(REG_SEPG, s);
    }
    if d != 0 {
        fb.reg(REG_DEPG, d);
    }
    fb
}

// ================================================================
// Actions
// ================================================================

/// The registers loaded for traffic entering the pipeline.
#[derive(Clone, Copy, Debug, Default)]
pub struct SourceRegs {
    pub epg: u32,
    pub bd: u32,
    pub fgrp: u32,
    pub rd: u32,
}

impl From<&FwdInfo> for SourceRegs {
    fn from(f: &FwdInfo) -> Self {
        Self { epg: f.vnid, bd: f.bd_id, fgrp: f.fgrp_id, rd: f.rd_id }
    }
}

/// Classify a packet: strip the uplink encapsulation when `decap` is
/// given, load the source registers, and continue at `next`.
pub fn action_source(
    fb: &mut FlowBuilder,
    regs: SourceRegs,
    next: TableId,
    decap: Option<EncapType>,
    policy_applied: bool,
) -> &mut FlowBuilder {
    if let Some(encap) = decap {
        fb.actions(encap.decap_actions());
    }
    fb.load_reg(REG_SEPG, regs.epg)
        .load_reg(REG_BD, regs.bd)
        .load_reg(REG_FD, regs.fgrp)
        .load_reg(REG_RD, regs.rd);
    if policy_applied {
        fb.write_metadata(meta::POLICY_APPLIED, meta::POLICY_APPLIED);
    }
    fb.go(next)
}

/// Deliver to a known local endpoint, subject to policy.
pub fn action_dest_ep(
    fb: &mut FlowBuilder,
    epg: u32,
    port: u32,
    mac: MacAddr,
) -> &mut FlowBuilder {
    fb.load_reg(REG_DEPG, epg)
        .load_reg(REG_OUTPORT, port)
        .set_eth_dst(mac)
        .go(POL_TABLE)
}

pub fn action_output_to_epg_tunnel(fb: &mut FlowBuilder) -> &mut FlowBuilder {
    fb.write_metadata(meta::out::TUNNEL, meta::out::MASK).go(OUT_TABLE)
}

/// Turn an ARP request into the reply from `mac`/`ip` and send it back
/// out the input port, re-encapsulated when it came over the uplink.
pub fn action_arp_reply(
    fb: &mut FlowBuilder,
    mac: MacAddr,
    ip: Ipv4Addr,
    encap: Option<EncapType>,
) -> &mut FlowBuilder {
    fb.mv(Field::EthSrc, Field::EthDst)
        .set_eth_src(mac)
        .set_arp_op(ARP_OP_REPLY)
        .mv(Field::ArpSha, Field::ArpTha)
        .set_arp_sha(mac)
        .mv(Field::ArpSpa, Field::ArpTpa)
        .set_arp_spa(ip);
    if let Some(encap) = encap {
        fb.actions(encap.reply_actions());
    }
    fb.output_in_port()
}

/// Rewrite to a local destination after reverse NAT.
pub fn action_rev_nat_dest(
    fb: &mut FlowBuilder,
    regs: SourceRegs,
    port: u32,
) -> &mut FlowBuilder {
    fb.load_reg(REG_DEPG, regs.epg)
        .load_reg(REG_BD, regs.bd)
        .load_reg(REG_FD, regs.fgrp)
        .load_reg(REG_RD, regs.rd)
        .load_reg(REG_OUTPORT, port)
        .write_metadata(meta::ROUTED, meta::ROUTED)
        .go(NAT_IN_TABLE)
}

/// Punt to the controller, passing the EPG in `reg0` and extra
/// arguments in the metadata when non-zero.
pub fn action_controller(fb: &mut FlowBuilder, epg: u32, metadata: u64) -> &mut FlowBuilder {
    if epg != 0 {
        fb.load_reg(REG_SEPG, epg);
    }
    if metadata != 0 {
        fb.write_metadata(metadata, u64::MAX);
    }
    fb.controller()
}

// ================================================================
// Proxy discovery
// ================================================================

/// An address the agent answers ARP and ND for on behalf of its owner.
#[derive(Clone, Copy, Debug)]
pub struct Discovery {
    pub ip: IpAddr,
    pub mac: MacAddr,
    /// The EPG of the owner. A zero VNID marks an address that is
    /// never answered across the uplink.
    pub vnid: u32,
    pub bd: u32,
    pub rd: u32,
    /// Answer neighbor solicitations as a router.
    pub router: bool,
    /// Only answer requests from this source.
    pub src_mac: Option<MacAddr>,
}

/// Answer ARP requests for an IPv4 address directly, and hand IPv6
/// solicitations to the controller with the answer packed in the
/// metadata.
pub fn proxy_discovery(
    env: &PipelineEnv,
    out: &mut Vec<FlowEntry>,
    prio: u16,
    d: &Discovery,
) {
    match d.ip {
        IpAddr::V4(ip) => {
            let tun = if d.vnid != 0 { env.tunnel() } else { None };
            if let Some((tun_port, encap)) = tun {
                let mut fb = FlowBuilder::new();
                fb.priority(prio + 1).in_port(tun_port);
                if let Some(src) = d.src_mac {
                    fb.eth_src(src);
                }
                match_dest_arp(&mut fb, ip, d.bd, d.rd);
                action_arp_reply(&mut fb, d.mac, ip, Some(encap));
                out.push(fb.build());
            }

            let mut fb = FlowBuilder::new();
            fb.priority(prio);
            if let Some(src) = d.src_mac {
                fb.eth_src(src);
            }
            match_dest_arp(&mut fb, ip, d.bd, d.rd);
            action_arp_reply(&mut fb, d.mac, ip, None);
            out.push(fb.build());
        }

        IpAddr::V6(ip) => {
            let mut metadata = d.mac.to_u64_le() | (1 << 56);
            if d.router {
                metadata |= 1 << 48;
            }

            let mut fb = FlowBuilder::new();
            fb.priority(prio).cookie(cookie::NEIGH_DISC);
            if let Some(src) = d.src_mac {
                fb.eth_src(src);
            }
            match_dest_nd(&mut fb, Some(ip), d.bd, d.rd, ND_NEIGHBOR_SOLICIT);
            action_controller(&mut fb, d.vnid, metadata);
            out.push(fb.build());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use gbp_flow::engine::flow::Action;
    use gbp_flow::engine::flow::ETH_TYPE_ARP;

    fn env() -> PipelineEnv {
        PipelineEnv {
            encap: Some(EncapType::Vxlan),
            tun_port: Some(2),
            uplink_port: None,
            tunnel_dst: Ipv4Addr::new(10, 11, 12, 13),
            flood_scope: FloodScope::FloodDomain,
            router_mac: MacAddr::from([0x00, 0x22, 0xbd, 0xf8, 0x19, 0xff]),
            dhcp_mac: MacAddr::from([0x00, 0x22, 0xbd, 0xf8, 0x19, 0xff]),
            virtual_router: true,
            router_adv: false,
            virtual_dhcp: false,
            conntrack: false,
            drop_log: false,
        }
    }

    fn discovery(ip: &str, vnid: u32) -> Discovery {
        Discovery {
            ip: ip.parse().unwrap(),
            mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            vnid,
            bd: 1,
            rd: 2,
            router: false,
            src_mac: None,
        }
    }

    #[test]
    fn arp_proxy_answers_tunnel_too() {
        let mut out = vec![];
        proxy_discovery(&env(), &mut out, 20, &discovery("10.20.44.2", 0xA0A));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].priority, 21);
        assert_eq!(out[0].matches.in_port, Some(2));
        assert_eq!(out[0].matches.eth_type, Some(ETH_TYPE_ARP));
        assert!(out[0].actions.contains(&Action::Move {
            src: Field::TunSrc,
            dst: Field::TunDst,
        }));
        assert_eq!(out[1].priority, 20);
        assert_eq!(out[1].actions.last(), Some(&Action::OutputInPort));

        // No VNID: never answered across the uplink.
        let mut out = vec![];
        proxy_discovery(&env(), &mut out, 51, &discovery("169.254.32.32", 0));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn nd_proxy_packs_mac() {
        let mut out = vec![];
        let mut d = discovery("2001:db8::2", 0xA0A);
        d.router = true;
        proxy_discovery(&env(), &mut out, 20, &d);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cookie, cookie::NEIGH_DISC);
        let want = 0x0000_ffee_ddcc_bbaa_u64 | (1 << 56) | (1 << 48);
        assert!(out[0].actions.contains(&Action::WriteMetadata {
            value: want,
            mask: u64::MAX,
        }));
        assert_eq!(out[0].actions.last(), Some(&Action::Controller));
    }

    #[test]
    fn subnet_priority_grows_with_prefix() {
        let net = IpPrefix::new("5.5.5.0".parse().unwrap(), 24);
        let f = match_subnet(&mut FlowBuilder::new(), 3, 150, net, false).build();
        assert_eq!(f.priority, 174);
        assert_eq!(f.matches.ip_dst, Some(net));
        assert_eq!(f.matches.regs[REG_RD as usize].unwrap().value, 3);
    }
}
