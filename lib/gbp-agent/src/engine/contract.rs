// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Contract enforcement in the policy table.
//!
//! A contract's rules apply between every provider and consumer, in
//! the direction each rule names, and within each of its intra groups.
//! Rules are listed in decreasing precedence; each gets its own
//! priority tier below [`MAX_POLICY_RULE_PRIORITY`]. One classifier
//! can expand into many flows: one per source and destination port
//! mask, subnet, and TCP flag combination.

use super::FlowManager;
use super::common::match_group;
use super::consts::*;
use crate::model::Classifier;
use crate::model::ContractRule;
use crate::model::TcpFlag;
use gbp_api::Direction;
use gbp_api::Uri;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::FlowEntry;
use gbp_flow::engine::SwitchConnection;
use gbp_flow::engine::flow::ETH_TYPE_ARP;
use gbp_flow::engine::flow::ETH_TYPE_IPV4;
use gbp_flow::engine::flow::ETH_TYPE_IPV6;
use gbp_flow::engine::flow::FlowFlags;
use gbp_flow::engine::flow::IP_PROTO_ICMP;
use gbp_flow::engine::flow::IP_PROTO_ICMPV6;
use gbp_flow::engine::flow::IpPrefix;
use gbp_flow::engine::range_mask::Mask;
use gbp_flow::engine::range_mask::get_masks;
use ipnetwork::IpNetwork;
use itertools::iproduct;
use slog::debug;
use std::collections::BTreeSet;

/// The distance between the priority tiers of consecutive rules.
pub const RULE_PRIORITY_STEP: u16 = 128;

const TCP_FIN: u16 = 0x01;
const TCP_SYN: u16 = 0x02;
const TCP_RST: u16 = 0x04;
const TCP_ACK: u16 = 0x10;

/// A mask that matches anything, standing in for an empty range.
const ANY: Mask = Mask { value: 0, mask: 0 };

/// The priority of the `idx`th rule of a contract.
pub fn rule_priority(idx: usize) -> u16 {
    let step = u16::try_from(idx)
        .unwrap_or(u16::MAX)
        .saturating_mul(RULE_PRIORITY_STEP);
    MAX_POLICY_RULE_PRIORITY.saturating_sub(step).max(1)
}

/// The TCP flag combinations to match. "Established" expands to two
/// matches, one for ACK and one for RST.
fn tcp_flag_sets(flags: &[TcpFlag]) -> Vec<u16> {
    if flags.is_empty() {
        return vec![];
    }
    if flags.contains(&TcpFlag::Established) {
        return vec![TCP_ACK, TCP_RST];
    }

    let bits = flags.iter().fold(0, |acc, f| {
        acc | match f {
            TcpFlag::Fin => TCP_FIN,
            TcpFlag::Syn => TCP_SYN,
            TcpFlag::Rst => TCP_RST,
            TcpFlag::Ack => TCP_ACK,
            TcpFlag::Established => 0,
        }
    });
    vec![bits]
}

fn port_masks(from: Option<u16>, to: Option<u16>) -> Vec<Mask> {
    let masks = get_masks(from, to);
    if masks.is_empty() { vec![ANY] } else { masks }
}

/// Match the protocol fields of a classifier, returning the Ethernet
/// type it matches, if any.
fn match_protocol(fb: &mut FlowBuilder, cls: &Classifier) -> Option<u16> {
    if let Some(op) = cls.arp_op {
        fb.arp_op(op);
    }
    if let Some(et) = cls.eth_type {
        fb.eth_type(et);
    }
    if let Some(proto) = cls.proto {
        fb.ip_proto(proto);
    }
    cls.eth_type
}

/// Apply a subnet restriction. A subnet of the wrong family for the
/// classifier's Ethernet type, or on a classifier matching no Ethernet
/// type at all, cannot match anything.
fn match_remote_subnet(
    fb: &mut FlowBuilder,
    net: Option<&IpNetwork>,
    eth_type: Option<u16>,
    src: bool,
) -> bool {
    let Some(net) = net else {
        return true;
    };
    let prefix = IpPrefix::from(*net);
    match (prefix.is_ipv4(), eth_type) {
        (true, Some(ETH_TYPE_ARP)) => {
            if src {
                fb.arp_spa(prefix);
            } else {
                fb.arp_tpa(prefix);
            }
        }
        (true, Some(ETH_TYPE_IPV4)) | (false, Some(ETH_TYPE_IPV6)) => {
            if src {
                fb.ip_src_prefix(prefix);
            } else {
                fb.ip_dst_prefix(prefix);
            }
        }
        _ => return false,
    }
    true
}

fn set_tp(fb: &mut FlowBuilder, m: Mask, src: bool) {
    match (m.mask, src) {
        (0, _) => {}
        (0xFFFF, true) => {
            fb.tp_src(m.value);
        }
        (0xFFFF, false) => {
            fb.tp_dst(m.value);
        }
        (mask, true) => {
            fb.tp_src_masked(m.value, mask);
        }
        (mask, false) => {
            fb.tp_dst_masked(m.value, mask);
        }
    }
}

/// Expand one classifier into policy table entries for traffic from
/// group `svnid` to group `dvnid`. Allowed traffic continues to the
/// stats table; denied traffic is dropped.
pub fn classifier_entries(
    cls: &Classifier,
    allow: bool,
    prio: u16,
    cookie: u64,
    svnid: u32,
    dvnid: u32,
) -> Vec<FlowEntry> {
    // ICMP type and code live where the ports would be.
    let icmp = matches!(cls.proto, Some(IP_PROTO_ICMP) | Some(IP_PROTO_ICMPV6))
        && (cls.icmp_type.is_some() || cls.icmp_code.is_some());
    let (src_ports, dst_ports) = if icmp {
        let exact = |v: Option<u8>| match v {
            Some(v) => vec![Mask { value: u16::from(v), mask: 0xFFFF }],
            None => vec![ANY],
        };
        (exact(cls.icmp_type), exact(cls.icmp_code))
    } else {
        (
            port_masks(cls.s_from_port, cls.s_to_port),
            port_masks(cls.d_from_port, cls.d_to_port),
        )
    };

    let flag_sets = tcp_flag_sets(&cls.tcp_flags);
    let flag_opts: Vec<Option<u16>> = if flag_sets.is_empty() {
        vec![None]
    } else {
        flag_sets.into_iter().map(Some).collect()
    };

    let src_nets: Vec<Option<&IpNetwork>> = if cls.src_subnets.is_empty() {
        vec![None]
    } else {
        cls.src_subnets.iter().map(Some).collect()
    };
    let dst_nets: Vec<Option<&IpNetwork>> = if cls.dst_subnets.is_empty() {
        vec![None]
    } else {
        cls.dst_subnets.iter().map(Some).collect()
    };

    let mut entries = vec![];
    for (ss, ds, sm, dm, flags) in
        iproduct!(&src_nets, &dst_nets, &src_ports, &dst_ports, &flag_opts)
    {
        let mut fb = FlowBuilder::new();
        fb.cookie(cookie).flags(FlowFlags::SEND_FLOW_REM);
        match_group(&mut fb, prio, svnid, dvnid);
        let eth_type = match_protocol(&mut fb, cls);
        if let Some(f) = flags {
            fb.tcp_flags(*f, *f);
        }
        if !match_remote_subnet(&mut fb, *ss, eth_type, true)
            || !match_remote_subnet(&mut fb, *ds, eth_type, false)
        {
            continue;
        }
        set_tp(&mut fb, *sm, true);
        set_tp(&mut fb, *dm, false);
        if allow {
            fb.go(STATS_TABLE);
        }
        entries.push(fb.build());
    }
    entries
}

impl<C: SwitchConnection> FlowManager<C> {
    /// Policy entries for `rules` between provider `pvnid` and consumer
    /// `cvnid`. When both groups provide and consume, a bidirectional
    /// rule is only written in the consumer to provider direction, as
    /// the reverse pair writes the other.
    fn contract_rules(
        &self,
        rules: &[(u16, &ContractRule, &Classifier)],
        pvnid: u32,
        cvnid: u32,
        allow_bidirectional: bool,
        out: &mut Vec<FlowEntry>,
    ) {
        for (prio, rule, cls) in rules {
            let cookie = u64::from(self.id(ns::CLASSIFIER_RULE, &rule.classifier));
            let dir = match rule.direction {
                Direction::Bidirectional if !allow_bidirectional => Direction::In,
                d => d,
            };
            if matches!(dir, Direction::In | Direction::Bidirectional) {
                out.extend(classifier_entries(cls, rule.allow, *prio, cookie, cvnid, pvnid));
            }
            if matches!(dir, Direction::Out | Direction::Bidirectional) {
                out.extend(classifier_entries(cls, rule.allow, *prio, cookie, pvnid, cvnid));
            }
        }
    }

    pub(super) fn update_contract(&mut self, uri: &Uri) {
        let snap = self.policy.load();
        let obj = uri.as_str();

        let Some(contract) = snap.contracts.get(uri) else {
            debug!(self.log, "cleaning up contract"; "uri" => %uri);
            self.switch.clear_flows(obj, POL_TABLE);
            return;
        };

        let vnids = |uris: &[Uri]| -> BTreeSet<u32> {
            uris.iter().filter_map(|u| self.group_vnid(&snap, u)).collect()
        };
        let provs = vnids(&contract.providers);
        let cons = vnids(&contract.consumers);
        let intra = vnids(&contract.intra);

        // A rule whose classifier is unknown keeps its tier, so the
        // priorities of the others do not shift when it resolves.
        let rules: Vec<(u16, &ContractRule, &Classifier)> = contract
            .rules
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                snap.classifiers.get(&r.classifier).map(|c| (rule_priority(i), r, c))
            })
            .collect();

        debug!(self.log, "updating contract";
            "uri" => %uri,
            "providers" => provs.len(),
            "consumers" => cons.len(),
            "intra" => intra.len(),
            "rules" => rules.len());

        let mut entries = vec![];
        for p in &provs {
            for c in cons.iter().filter(|c| *c != p) {
                let bi = !provs.contains(c) || !cons.contains(p);
                self.contract_rules(&rules, *p, *c, bi, &mut entries);
            }
        }
        for i in &intra {
            self.contract_rules(&rules, *i, *i, false, &mut entries);
        }

        self.switch.write_flow(obj, POL_TABLE, entries);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg::AgentConfig;
    use crate::model::Contract;
    use crate::model::EndpointGroup;
    use crate::model::PolicySnapshot;
    use crate::model::PolicyStore;
    use crate::model::RoutingDomain;
    use gbp_flow::engine::MockSwitch;
    use gbp_flow::engine::flow::Action;
    use gbp_flow::engine::flow::IP_PROTO_TCP;
    use slog::Logger;
    use slog::o;

    fn tcp(dport: u16) -> Classifier {
        Classifier {
            eth_type: Some(ETH_TYPE_IPV4),
            proto: Some(IP_PROTO_TCP),
            d_from_port: Some(dport),
            ..Default::default()
        }
    }

    #[test]
    fn port_range_expansion() {
        let cls = Classifier {
            d_from_port: Some(80),
            d_to_port: Some(85),
            s_from_port: Some(66),
            s_to_port: Some(69),
            ..tcp(0)
        };
        let flows = classifier_entries(&cls, true, 100, 7, 1, 2);
        assert_eq!(flows.len(), 4);
        for f in &flows {
            assert_eq!(f.priority, 100);
            assert_eq!(f.cookie, 7);
            assert!(f.flags.contains(FlowFlags::SEND_FLOW_REM));
            assert_eq!(f.actions, vec![Action::GotoTable(STATS_TABLE)]);
        }
        let dst: BTreeSet<_> = flows.iter().map(|f| f.matches.tp_dst.unwrap()).collect();
        assert_eq!(dst.len(), 2);
        assert!(dst.iter().any(|m| m.value == 0x50 && m.mask == Some(0xfffc)));
    }

    #[test]
    fn established_expands_to_ack_and_rst() {
        let cls = Classifier { tcp_flags: vec![TcpFlag::Established], ..tcp(21) };
        let flows = classifier_entries(&cls, true, 100, 1, 1, 2);
        let flags: Vec<u16> =
            flows.iter().map(|f| f.matches.tcp_flags.unwrap().value).collect();
        assert_eq!(flags, vec![TCP_ACK, TCP_RST]);

        let cls = Classifier { tcp_flags: vec![TcpFlag::Syn, TcpFlag::Ack], ..tcp(22) };
        let flows = classifier_entries(&cls, true, 100, 1, 1, 2);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].matches.tcp_flags.unwrap().value, TCP_SYN | TCP_ACK);
    }

    #[test]
    fn subnets_follow_family() {
        let cls = Classifier {
            src_subnets: vec!["10.0.0.0/8".parse().unwrap(), "2001:db8::/32".parse().unwrap()],
            ..tcp(80)
        };
        let flows = classifier_entries(&cls, false, 100, 1, 1, 2);
        assert_eq!(flows.len(), 1);
        assert!(flows[0].is_drop());
        assert_eq!(flows[0].matches.ip_src.unwrap().len(), 8);

        // No Ethernet type: a subnet cannot be matched.
        let cls = Classifier {
            eth_type: None,
            dst_subnets: vec!["10.0.0.0/8".parse().unwrap()],
            ..Default::default()
        };
        assert!(classifier_entries(&cls, true, 100, 1, 1, 2).is_empty());
    }

    #[test]
    fn icmp_type_and_code() {
        let cls = Classifier {
            eth_type: Some(ETH_TYPE_IPV4),
            proto: Some(IP_PROTO_ICMP),
            icmp_type: Some(8),
            d_from_port: Some(1000),
            ..Default::default()
        };
        let flows = classifier_entries(&cls, true, 100, 1, 0, 0);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].matches.tp_src.unwrap().value, 8);
        assert!(flows[0].matches.tp_dst.is_none());
        assert!(flows[0].matches.regs.iter().all(|r| r.is_none()));
    }

    #[test]
    fn rule_tiers() {
        assert_eq!(rule_priority(0), MAX_POLICY_RULE_PRIORITY);
        assert_eq!(rule_priority(2), MAX_POLICY_RULE_PRIORITY - 256);
        assert_eq!(rule_priority(1000), 1);
    }

    fn policy() -> PolicySnapshot {
        let mut snap = PolicySnapshot::default();
        snap.routing_domains.insert(Uri::from("/rd/1"), RoutingDomain::default());
        for (uri, vnid) in [("/epg/web", 0xA0A), ("/epg/db", 0xA0B)] {
            snap.endpoint_groups.insert(
                Uri::from(uri),
                EndpointGroup {
                    vnid: Some(vnid),
                    routing_domain: Some(Uri::from("/rd/1")),
                    ..Default::default()
                },
            );
        }
        snap.classifiers.insert(Uri::from("/cls/http"), tcp(80));
        snap.classifiers.insert(
            Uri::from("/cls/arp"),
            Classifier { eth_type: Some(ETH_TYPE_ARP), ..Default::default() },
        );
        snap.classifiers.insert(
            Uri::from("/cls/ssh"),
            Classifier { tcp_flags: vec![TcpFlag::Established], ..tcp(22) },
        );
        snap.contracts.insert(
            Uri::from("/contract/1"),
            Contract {
                providers: vec![Uri::from("/epg/db")],
                consumers: vec![Uri::from("/epg/web")],
                intra: vec![],
                rules: vec![
                    ContractRule {
                        direction: Direction::In,
                        allow: true,
                        classifier: Uri::from("/cls/http"),
                    },
                    ContractRule {
                        direction: Direction::Bidirectional,
                        allow: true,
                        classifier: Uri::from("/cls/arp"),
                    },
                    ContractRule {
                        direction: Direction::Out,
                        allow: false,
                        classifier: Uri::from("/cls/ssh"),
                    },
                ],
            },
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
    fn three_rule_contract() {
        let mut m = mgr(policy());
        let uri = Uri::from("/contract/1");
        m.contract_updated(&uri);

        let pol = m.switch().flows_for("/contract/1", POL_TABLE);
        // http in, arp both ways, ssh out as two flag matches.
        assert_eq!(pol.len(), 5);

        let http = pol.iter().filter(|f| f.priority == MAX_POLICY_RULE_PRIORITY).collect::<Vec<_>>();
        assert_eq!(http.len(), 1);
        let regs = &http[0].matches.regs;
        assert_eq!(regs[REG_SEPG as usize].unwrap().value, 0xA0A);
        assert_eq!(regs[REG_DEPG as usize].unwrap().value, 0xA0B);
        let ck = m.ids().get_id_no_alloc(ns::CLASSIFIER_RULE, "/cls/http").unwrap();
        assert_eq!(http[0].cookie, u64::from(ck));

        let arp = pol.iter().filter(|f| f.priority == MAX_POLICY_RULE_PRIORITY - 128);
        assert_eq!(arp.count(), 2);

        let ssh: Vec<_> =
            pol.iter().filter(|f| f.priority == MAX_POLICY_RULE_PRIORITY - 256).collect();
        assert_eq!(ssh.len(), 2);
        assert!(ssh.iter().all(|f| f.is_drop()
            && f.matches.regs[REG_SEPG as usize].unwrap().value == 0xA0B));
    }

    #[test]
    fn mutual_providers_collapse_bidirectional() {
        let mut snap = policy();
        let c = snap.contracts.get_mut(&Uri::from("/contract/1")).unwrap();
        c.providers.push(Uri::from("/epg/web"));
        c.consumers.push(Uri::from("/epg/db"));
        c.rules.retain(|r| r.direction == Direction::Bidirectional);
        let mut m = mgr(snap);
        m.contract_updated(&Uri::from("/contract/1"));

        // Each ordered pair writes only its consumer to provider
        // direction.
        let pol = m.switch().flows_for("/contract/1", POL_TABLE);
        assert_eq!(pol.len(), 2);
    }

    #[test]
    fn unresolved_groups_and_removal() {
        let mut snap = policy();
        snap.routing_domains.clear();
        let mut m = mgr(snap);
        let uri = Uri::from("/contract/1");
        m.contract_updated(&uri);
        assert!(m.switch().flows_for("/contract/1", POL_TABLE).is_empty());

        m.policy().store(policy());
        m.contract_updated(&uri);
        assert!(!m.switch().flows_for("/contract/1", POL_TABLE).is_empty());

        m.policy().update(|p| {
            p.contracts.clear();
        });
        m.contract_updated(&uri);
        assert!(m.switch().flows_for("/contract/1", POL_TABLE).is_empty());
    }
}
