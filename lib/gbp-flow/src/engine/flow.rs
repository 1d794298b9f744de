// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow entries: the match, the action list, and the builder used by
//! every synthesis routine to put them together.
//!
//! A flow's identity within its table is the pair (priority, match).
//! Two entries with the same identity but different cookie, flags, or
//! actions are the same flow in two versions, and reconciling them
//! produces a modify rather than an add and a delete.

use core::fmt;
use core::fmt::Display;
use gbp_api::MacAddr;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

pub type TableId = u8;

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_VLAN: u16 = 0x8100;
pub const ETH_TYPE_IPV6: u16 = 0x86DD;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;
pub const IP_PROTO_ICMPV6: u8 = 58;

/// The VLAN "present" bit of the TCI, set on any tagged frame.
pub const VLAN_CFI: u16 = 0x1000;
pub const VLAN_VID_MASK: u16 = 0x0FFF;

/// The number of general purpose registers the pipeline uses.
pub const NUM_REGS: usize = 8;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    pub struct FlowFlags: u16 {
        /// Ask the switch to report the flow's counters when it is
        /// removed.
        const SEND_FLOW_REM = 0x1;
    }
}

/// A field value under an optional mask. A `None` mask is an exact
/// match.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Masked<T> {
    pub value: T,
    pub mask: Option<T>,
}

impl<T> Masked<T> {
    pub fn exact(value: T) -> Self {
        Self { value, mask: None }
    }

    pub fn masked(value: T, mask: T) -> Self {
        Self { value, mask: Some(mask) }
    }
}

impl<T: fmt::LowerHex> Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.mask {
            None => write!(f, "{:#x}", self.value),
            Some(m) => write!(f, "{:#x}/{:#x}", self.value, m),
        }
    }
}

/// An IP network with the host bits cleared, or a single host when the
/// length covers the whole address.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

impl IpPrefix {
    pub fn new(addr: IpAddr, len: u8) -> Self {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let len = len.min(max);
        let addr = match addr {
            IpAddr::V4(ip) => {
                let bits = u32::from(ip);
                let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
                IpAddr::V4(Ipv4Addr::from(bits & mask))
            }
            IpAddr::V6(ip) => {
                let bits = u128::from(ip);
                let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
                IpAddr::V6(Ipv6Addr::from(bits & mask))
            }
        };
        Self { addr, len }
    }

    pub fn host(addr: IpAddr) -> Self {
        Self::new(addr, if addr.is_ipv4() { 32 } else { 128 })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn is_host(&self) -> bool {
        self.len == if self.is_ipv4() { 32 } else { 128 }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        ip.is_ipv4() == self.is_ipv4() && Self::new(ip, self.len) == *self
    }
}

impl From<IpAddr> for IpPrefix {
    fn from(addr: IpAddr) -> Self {
        Self::host(addr)
    }
}

impl From<IpNetwork> for IpPrefix {
    fn from(net: IpNetwork) -> Self {
        Self::new(net.ip(), net.prefix())
    }
}

impl Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_host() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}/{}", self.addr, self.len)
        }
    }
}

/// The match half of a flow. Every unset field is a wildcard.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Match {
    pub in_port: Option<u32>,
    pub eth_src: Option<Masked<MacAddr>>,
    pub eth_dst: Option<Masked<MacAddr>>,
    pub eth_type: Option<u16>,
    pub vlan_tci: Option<Masked<u16>>,
    pub tun_id: Option<u64>,
    pub regs: [Option<Masked<u32>>; NUM_REGS],
    pub metadata: Option<Masked<u64>>,
    pub pkt_mark: Option<u32>,
    pub ct_state: Option<Masked<u32>>,
    pub ct_mark: Option<u32>,
    pub ip_proto: Option<u8>,
    pub ip_src: Option<IpPrefix>,
    pub ip_dst: Option<IpPrefix>,
    pub arp_op: Option<u16>,
    pub arp_spa: Option<IpPrefix>,
    pub arp_tpa: Option<IpPrefix>,
    pub tp_src: Option<Masked<u16>>,
    pub tp_dst: Option<Masked<u16>>,
    pub tcp_flags: Option<Masked<u16>>,
    pub nd_target: Option<IpPrefix>,
}

/// A packet or pipeline field that actions can copy between.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Field {
    EthSrc,
    EthDst,
    ArpSha,
    ArpTha,
    ArpSpa,
    ArpTpa,
    Reg(u8),
    TunId,
    TunSrc,
    TunDst,
    VlanVid,
}

impl Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::EthSrc => write!(f, "eth_src"),
            Self::EthDst => write!(f, "eth_dst"),
            Self::ArpSha => write!(f, "arp_sha"),
            Self::ArpTha => write!(f, "arp_tha"),
            Self::ArpSpa => write!(f, "arp_spa"),
            Self::ArpTpa => write!(f, "arp_tpa"),
            Self::Reg(r) => write!(f, "reg{r}"),
            Self::TunId => write!(f, "tun_id"),
            Self::TunSrc => write!(f, "tun_src"),
            Self::TunDst => write!(f, "tun_dst"),
            Self::VlanVid => write!(f, "vlan_vid"),
        }
    }
}

/// The arguments of a `learn` action. The learned flow matches the
/// VLAN of the packet and an Ethernet destination equal to the
/// packet's source, and outputs to the packet's input port.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LearnSpec {
    pub table: TableId,
    pub priority: u16,
    pub idle_timeout: u16,
    pub cookie: u64,
}

/// A connection tracking action.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Conntrack {
    pub commit: bool,
    pub zone: u16,
    /// Recirculate to this table once the lookup completes.
    pub table: Option<TableId>,
    /// Set `ct_mark` on the committed connection.
    pub mark: Option<u32>,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Action {
    Output(u32),
    OutputInPort,
    /// Output to the port number held in a register.
    OutputReg(u8),
    Controller,
    Group(u32),
    GotoTable(TableId),
    /// Resubmit to `table`, as though the packet arrived on `port`, or
    /// on its own input port when `None`.
    Resubmit { port: Option<u32>, table: TableId },
    LoadReg { reg: u8, value: u32 },
    WriteMetadata { value: u64, mask: u64 },
    SetEthSrc(MacAddr),
    SetEthDst(MacAddr),
    SetIpSrc(IpAddr),
    SetIpDst(IpAddr),
    SetTunDst(Ipv4Addr),
    SetArpOp(u16),
    SetArpSha(MacAddr),
    SetArpSpa(Ipv4Addr),
    SetL4Src(u16),
    SetL4Dst(u16),
    SetVlanVid(u16),
    SetPktMark(u32),
    Move { src: Field, dst: Field },
    PushVlan,
    PopVlan,
    DecTtl,
    /// Hash the symmetric L3/L4 tuple into `0..=max_link` and store the
    /// link in a register.
    Multipath { basis: u16, max_link: u16, arg: u32, reg: u8 },
    Conntrack(Conntrack),
    Learn(LearnSpec),
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Output(p) => write!(f, "output:{p}"),
            Self::OutputInPort => write!(f, "IN_PORT"),
            Self::OutputReg(r) => write!(f, "output:reg{r}"),
            Self::Controller => write!(f, "CONTROLLER:65535"),
            Self::Group(g) => write!(f, "group:{g}"),
            Self::GotoTable(t) => write!(f, "goto_table:{t}"),
            Self::Resubmit { port: None, table } => {
                write!(f, "resubmit(,{table})")
            }
            Self::Resubmit { port: Some(p), table } => {
                write!(f, "resubmit({p},{table})")
            }
            Self::LoadReg { reg, value } => {
                write!(f, "load:{value:#x}->reg{reg}")
            }
            Self::WriteMetadata { value, mask } => {
                write!(f, "write_metadata:{value:#x}/{mask:#x}")
            }
            Self::SetEthSrc(m) => write!(f, "set_field:{m}->eth_src"),
            Self::SetEthDst(m) => write!(f, "set_field:{m}->eth_dst"),
            Self::SetIpSrc(ip) => write!(f, "set_field:{ip}->ip_src"),
            Self::SetIpDst(ip) => write!(f, "set_field:{ip}->ip_dst"),
            Self::SetTunDst(ip) => write!(f, "set_field:{ip}->tun_dst"),
            Self::SetArpOp(op) => write!(f, "set_field:{op}->arp_op"),
            Self::SetArpSha(m) => write!(f, "set_field:{m}->arp_sha"),
            Self::SetArpSpa(ip) => write!(f, "set_field:{ip}->arp_spa"),
            Self::SetL4Src(p) => write!(f, "set_field:{p}->tp_src"),
            Self::SetL4Dst(p) => write!(f, "set_field:{p}->tp_dst"),
            Self::SetVlanVid(v) => write!(f, "set_field:{v}->vlan_vid"),
            Self::SetPktMark(m) => write!(f, "set_field:{m:#x}->pkt_mark"),
            Self::Move { src, dst } => write!(f, "move:{src}->{dst}"),
            Self::PushVlan => write!(f, "push_vlan:0x8100"),
            Self::PopVlan => write!(f, "pop_vlan"),
            Self::DecTtl => write!(f, "dec_ttl"),
            Self::Multipath { basis, max_link, arg, reg } => write!(
                f,
                "multipath(symmetric_l3l4+udp,{basis},iter_hash,\
                 {max_link},{arg},reg{reg})"
            ),
            Self::Conntrack(ct) => {
                write!(f, "ct(")?;
                if ct.commit {
                    write!(f, "commit,")?;
                }
                write!(f, "zone={}", ct.zone)?;
                if let Some(t) = ct.table {
                    write!(f, ",table={t}")?;
                }
                if let Some(m) = ct.mark {
                    write!(f, ",exec(set_field:{m:#x}->ct_mark)")?;
                }
                write!(f, ")")
            }
            Self::Learn(l) => write!(
                f,
                "learn(table={},priority={},idle_timeout={},cookie={:#x},\
                 NXM_OF_VLAN_TCI[0..11],\
                 NXM_OF_ETH_DST[]=NXM_OF_ETH_SRC[],\
                 output:NXM_OF_IN_PORT[])",
                l.table, l.priority, l.idle_timeout, l.cookie
            ),
        }
    }
}

/// The (priority, match) pair identifying a flow within its table.
pub type FlowKey = (u16, Match);

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct FlowEntry {
    pub table: TableId,
    pub priority: u16,
    pub cookie: u64,
    pub flags: FlowFlags,
    pub matches: Match,
    pub actions: Vec<Action>,
}

impl FlowEntry {
    pub fn key(&self) -> FlowKey {
        (self.priority, self.matches.clone())
    }

    /// Does `other` carry a different version of this flow?
    pub fn differs(&self, other: &FlowEntry) -> bool {
        self.cookie != other.cookie
            || self.flags != other.flags
            || self.actions != other.actions
    }

    /// A flow with no actions drops what it matches.
    pub fn is_drop(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut parts: Vec<String> = vec![];

        if let Some(p) = self.in_port {
            parts.push(format!("in_port={p}"));
        }
        if let Some(m) = &self.eth_src {
            parts.push(fmt_mac("eth_src", m));
        }
        if let Some(m) = &self.eth_dst {
            parts.push(fmt_mac("eth_dst", m));
        }
        if let Some(et) = self.eth_type {
            parts.push(format!("eth_type={et:#06x}"));
        }
        if let Some(v) = &self.vlan_tci {
            parts.push(format!("vlan_tci={v}"));
        }
        if let Some(t) = self.tun_id {
            parts.push(format!("tun_id={t:#x}"));
        }
        for (i, r) in self.regs.iter().enumerate() {
            if let Some(r) = r {
                parts.push(format!("reg{i}={r}"));
            }
        }
        if let Some(m) = &self.metadata {
            parts.push(format!("metadata={m}"));
        }
        if let Some(m) = self.pkt_mark {
            parts.push(format!("pkt_mark={m:#x}"));
        }
        if let Some(s) = &self.ct_state {
            parts.push(format!("ct_state={s}"));
        }
        if let Some(m) = self.ct_mark {
            parts.push(format!("ct_mark={m:#x}"));
        }
        if let Some(p) = self.ip_proto {
            parts.push(format!("nw_proto={p}"));
        }
        if let Some(ip) = &self.ip_src {
            parts.push(format!("ip_src={ip}"));
        }
        if let Some(ip) = &self.ip_dst {
            parts.push(format!("ip_dst={ip}"));
        }
        if let Some(op) = self.arp_op {
            parts.push(format!("arp_op={op}"));
        }
        if let Some(ip) = &self.arp_spa {
            parts.push(format!("arp_spa={ip}"));
        }
        if let Some(ip) = &self.arp_tpa {
            parts.push(format!("arp_tpa={ip}"));
        }
        if let Some(p) = &self.tp_src {
            parts.push(format!("tp_src={p}"));
        }
        if let Some(p) = &self.tp_dst {
            parts.push(format!("tp_dst={p}"));
        }
        if let Some(fl) = &self.tcp_flags {
            parts.push(format!("tcp_flags={fl}"));
        }
        if let Some(ip) = &self.nd_target {
            parts.push(format!("nd_target={ip}"));
        }

        write!(f, "{}", parts.join(","))
    }
}

fn fmt_mac(name: &str, m: &Masked<MacAddr>) -> String {
    match &m.mask {
        None => format!("{name}={}", m.value),
        Some(mask) => format!("{name}={}/{mask}", m.value),
    }
}

pub fn fmt_actions(actions: &[Action]) -> String {
    if actions.is_empty() {
        return "drop".to_string();
    }

    actions.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(",")
}

impl Display for FlowEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "table={}, priority={}, cookie={:#x}, {} actions={}",
            self.table,
            self.priority,
            self.cookie,
            self.matches,
            fmt_actions(&self.actions)
        )
    }
}

/// Assemble a [`FlowEntry`] one match or action at a time.
///
/// Match setters name the field they match. Action setters are
/// prefixed by what they do (`set_`, `load_`, `output`, `go`). The
/// table is left for the writer to stamp.
#[derive(Clone, Debug, Default)]
pub struct FlowBuilder {
    entry: FlowEntry,
}

impl FlowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(&self) -> FlowEntry {
        self.entry.clone()
    }

    pub fn priority(&mut self, priority: u16) -> &mut Self {
        self.entry.priority = priority;
        self
    }

    pub fn cookie(&mut self, cookie: u64) -> &mut Self {
        self.entry.cookie = cookie;
        self
    }

    pub fn flags(&mut self, flags: FlowFlags) -> &mut Self {
        self.entry.flags |= flags;
        self
    }

    fn m(&mut self) -> &mut Match {
        &mut self.entry.matches
    }

    // ================================================================
    // Matches
    // ================================================================

    pub fn in_port(&mut self, port: u32) -> &mut Self {
        self.m().in_port = Some(port);
        self
    }

    pub fn eth_src(&mut self, mac: MacAddr) -> &mut Self {
        self.m().eth_src = Some(Masked::exact(mac));
        self
    }

    pub fn eth_src_masked(&mut self, mac: MacAddr, mask: MacAddr) -> &mut Self {
        self.m().eth_src = Some(Masked::masked(mac, mask));
        self
    }

    pub fn eth_dst(&mut self, mac: MacAddr) -> &mut Self {
        self.m().eth_dst = Some(Masked::exact(mac));
        self
    }

    pub fn eth_dst_masked(&mut self, mac: MacAddr, mask: MacAddr) -> &mut Self {
        self.m().eth_dst = Some(Masked::masked(mac, mask));
        self
    }

    pub fn eth_type(&mut self, eth_type: u16) -> &mut Self {
        self.m().eth_type = Some(eth_type);
        self
    }

    /// Match frames tagged with `vid`.
    pub fn vlan(&mut self, vid: u16) -> &mut Self {
        self.m().vlan_tci = Some(Masked::masked(
            VLAN_CFI | (vid & VLAN_VID_MASK),
            VLAN_CFI | VLAN_VID_MASK,
        ));
        self
    }

    pub fn vlan_tci_masked(&mut self, tci: u16, mask: u16) -> &mut Self {
        self.m().vlan_tci = Some(Masked::masked(tci, mask));
        self
    }

    pub fn tun_id(&mut self, id: u64) -> &mut Self {
        self.m().tun_id = Some(id);
        self
    }

    pub fn reg(&mut self, reg: u8, value: u32) -> &mut Self {
        self.m().regs[reg as usize] = Some(Masked::exact(value));
        self
    }

    pub fn reg_masked(&mut self, reg: u8, value: u32, mask: u32) -> &mut Self {
        self.m().regs[reg as usize] = Some(Masked::masked(value, mask));
        self
    }

    pub fn metadata(&mut self, value: u64, mask: u64) -> &mut Self {
        self.m().metadata = Some(Masked::masked(value, mask));
        self
    }

    pub fn pkt_mark(&mut self, mark: u32) -> &mut Self {
        self.m().pkt_mark = Some(mark);
        self
    }

    pub fn ct_state(&mut self, state: u32, mask: u32) -> &mut Self {
        self.m().ct_state = Some(Masked::masked(state, mask));
        self
    }

    pub fn ct_mark(&mut self, mark: u32) -> &mut Self {
        self.m().ct_mark = Some(mark);
        self
    }

    pub fn ip_proto(&mut self, proto: u8) -> &mut Self {
        self.m().ip_proto = Some(proto);
        self
    }

    fn ip_eth_type(&mut self, ip: &IpAddr) {
        let et = if ip.is_ipv4() { ETH_TYPE_IPV4 } else { ETH_TYPE_IPV6 };
        self.m().eth_type = Some(et);
    }

    /// Match the source address; also matches the matching Ethernet
    /// type.
    pub fn ip_src(&mut self, ip: IpAddr) -> &mut Self {
        self.ip_src_prefix(IpPrefix::host(ip))
    }

    pub fn ip_src_prefix(&mut self, prefix: IpPrefix) -> &mut Self {
        self.ip_eth_type(&prefix.addr());
        self.m().ip_src = Some(prefix);
        self
    }

    pub fn ip_dst(&mut self, ip: IpAddr) -> &mut Self {
        self.ip_dst_prefix(IpPrefix::host(ip))
    }

    pub fn ip_dst_prefix(&mut self, prefix: IpPrefix) -> &mut Self {
        self.ip_eth_type(&prefix.addr());
        self.m().ip_dst = Some(prefix);
        self
    }

    pub fn arp_op(&mut self, op: u16) -> &mut Self {
        self.m().eth_type = Some(ETH_TYPE_ARP);
        self.m().arp_op = Some(op);
        self
    }

    pub fn arp_spa(&mut self, prefix: IpPrefix) -> &mut Self {
        self.m().eth_type = Some(ETH_TYPE_ARP);
        self.m().arp_spa = Some(prefix);
        self
    }

    pub fn arp_tpa(&mut self, prefix: IpPrefix) -> &mut Self {
        self.m().eth_type = Some(ETH_TYPE_ARP);
        self.m().arp_tpa = Some(prefix);
        self
    }

    pub fn tp_src(&mut self, port: u16) -> &mut Self {
        self.m().tp_src = Some(Masked::exact(port));
        self
    }

    pub fn tp_src_masked(&mut self, port: u16, mask: u16) -> &mut Self {
        self.m().tp_src = Some(Masked::masked(port, mask));
        self
    }

    pub fn tp_dst(&mut self, port: u16) -> &mut Self {
        self.m().tp_dst = Some(Masked::exact(port));
        self
    }

    pub fn tp_dst_masked(&mut self, port: u16, mask: u16) -> &mut Self {
        self.m().tp_dst = Some(Masked::masked(port, mask));
        self
    }

    pub fn tcp_flags(&mut self, flags: u16, mask: u16) -> &mut Self {
        self.m().tcp_flags = Some(Masked::masked(flags, mask));
        self
    }

    pub fn nd_target(&mut self, prefix: IpPrefix) -> &mut Self {
        self.m().nd_target = Some(prefix);
        self
    }

    // ================================================================
    // Actions
    // ================================================================

    fn push(&mut self, action: Action) -> &mut Self {
        self.entry.actions.push(action);
        self
    }

    /// Append a prepared action list, as produced for group buckets.
    pub fn actions<I>(&mut self, actions: I) -> &mut Self
    where
        I: IntoIterator<Item = Action>,
    {
        self.entry.actions.extend(actions);
        self
    }

    /// Has any action been added yet?
    pub fn has_actions(&self) -> bool {
        !self.entry.actions.is_empty()
    }

    pub fn output(&mut self, port: u32) -> &mut Self {
        self.push(Action::Output(port))
    }

    pub fn output_in_port(&mut self) -> &mut Self {
        self.push(Action::OutputInPort)
    }

    pub fn output_reg(&mut self, reg: u8) -> &mut Self {
        self.push(Action::OutputReg(reg))
    }

    pub fn controller(&mut self) -> &mut Self {
        self.push(Action::Controller)
    }

    pub fn group(&mut self, id: u32) -> &mut Self {
        self.push(Action::Group(id))
    }

    pub fn go(&mut self, table: TableId) -> &mut Self {
        self.push(Action::GotoTable(table))
    }

    pub fn resubmit(&mut self, port: Option<u32>, table: TableId) -> &mut Self {
        self.push(Action::Resubmit { port, table })
    }

    pub fn load_reg(&mut self, reg: u8, value: u32) -> &mut Self {
        self.push(Action::LoadReg { reg, value })
    }

    pub fn write_metadata(&mut self, value: u64, mask: u64) -> &mut Self {
        self.push(Action::WriteMetadata { value, mask })
    }

    pub fn set_eth_src(&mut self, mac: MacAddr) -> &mut Self {
        self.push(Action::SetEthSrc(mac))
    }

    pub fn set_eth_dst(&mut self, mac: MacAddr) -> &mut Self {
        self.push(Action::SetEthDst(mac))
    }

    pub fn set_ip_src(&mut self, ip: IpAddr) -> &mut Self {
        self.push(Action::SetIpSrc(ip))
    }

    pub fn set_ip_dst(&mut self, ip: IpAddr) -> &mut Self {
        self.push(Action::SetIpDst(ip))
    }

    pub fn set_tun_dst(&mut self, ip: Ipv4Addr) -> &mut Self {
        self.push(Action::SetTunDst(ip))
    }

    pub fn set_arp_op(&mut self, op: u16) -> &mut Self {
        self.push(Action::SetArpOp(op))
    }

    pub fn set_arp_sha(&mut self, mac: MacAddr) -> &mut Self {
        self.push(Action::SetArpSha(mac))
    }

    pub fn set_arp_spa(&mut self, ip: Ipv4Addr) -> &mut Self {
        self.push(Action::SetArpSpa(ip))
    }

    pub fn set_l4_src(&mut self, port: u16) -> &mut Self {
        self.push(Action::SetL4Src(port))
    }

    pub fn set_l4_dst(&mut self, port: u16) -> &mut Self {
        self.push(Action::SetL4Dst(port))
    }

    pub fn set_vlan_vid(&mut self, vid: u16) -> &mut Self {
        self.push(Action::SetVlanVid(vid))
    }

    pub fn set_pkt_mark(&mut self, mark: u32) -> &mut Self {
        self.push(Action::SetPktMark(mark))
    }

    pub fn mv(&mut self, src: Field, dst: Field) -> &mut Self {
        self.push(Action::Move { src, dst })
    }

    pub fn push_vlan(&mut self) -> &mut Self {
        self.push(Action::PushVlan)
    }

    pub fn pop_vlan(&mut self) -> &mut Self {
        self.push(Action::PopVlan)
    }

    pub fn dec_ttl(&mut self) -> &mut Self {
        self.push(Action::DecTtl)
    }

    pub fn multipath(
        &mut self,
        basis: u16,
        max_link: u16,
        arg: u32,
        reg: u8,
    ) -> &mut Self {
        self.push(Action::Multipath { basis, max_link, arg, reg })
    }

    pub fn conntrack(&mut self, ct: Conntrack) -> &mut Self {
        self.push(Action::Conntrack(ct))
    }

    pub fn learn(&mut self, spec: LearnSpec) -> &mut Self {
        self.push(Action::Learn(spec))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_canonical() {
        let a = IpPrefix::new("10.20.44.2".parse().unwrap(), 24);
        let b = IpPrefix::new("10.20.44.0".parse().unwrap(), 24);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "10.20.44.0/24");
        assert!(a.contains("10.20.44.77".parse().unwrap()));
        assert!(!a.contains("10.20.45.1".parse().unwrap()));
        assert!(!a.contains("::1".parse().unwrap()));

        let h = IpPrefix::host("2001:db8::2".parse().unwrap());
        assert!(h.is_host());
        assert_eq!(h.to_string(), "2001:db8::2");

        let all = IpPrefix::new("1.2.3.4".parse().unwrap(), 0);
        assert_eq!(all.addr(), "0.0.0.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn builder_sets_eth_type() {
        let f = FlowBuilder::new()
            .priority(500)
            .ip_dst("10.20.44.2".parse().unwrap())
            .dec_ttl()
            .build();
        assert_eq!(f.matches.eth_type, Some(ETH_TYPE_IPV4));

        let f = FlowBuilder::new()
            .ip_src("2001:db8::2".parse().unwrap())
            .build();
        assert_eq!(f.matches.eth_type, Some(ETH_TYPE_IPV6));
    }

    #[test]
    fn identity_ignores_actions() {
        let mut fb = FlowBuilder::new();
        fb.priority(10).reg(4, 7).eth_dst(MacAddr::from([2, 0, 0, 0, 0, 1]));
        let a = fb.clone().output(1).build();
        let b = fb.clone().output(2).build();
        assert_eq!(a.key(), b.key());
        assert!(a.differs(&b));

        let c = fb.clone().output(1).cookie(5).build();
        assert!(a.differs(&c));
        assert!(!a.differs(&a.clone()));
    }

    #[test]
    fn display() {
        let f = FlowBuilder::new()
            .priority(10)
            .in_port(3)
            .vlan(100)
            .pop_vlan()
            .load_reg(0, 0xA0A)
            .go(4)
            .build();
        let s = f.to_string();
        assert!(s.contains("in_port=3"), "{s}");
        assert!(s.contains("vlan_tci=0x1064/0x1fff"), "{s}");
        assert!(s.contains("load:0xa0a->reg0"), "{s}");
        assert_eq!(fmt_actions(&[]), "drop");
    }
}
