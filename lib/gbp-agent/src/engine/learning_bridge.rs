// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Learning bridge interfaces.
//!
//! A learning bridge interface trunks a set of VLANs that are switched
//! as plain L2 segments, outside of any policy. Tagged traffic on one
//! of those VLANs is taken out of the pipeline on admission. It teaches
//! the learning table where its source lives and is then either
//! delivered to a learned port or flooded to every other interface
//! trunking the same VLAN.
//!
//! Interfaces interact through their shared VLANs, so all of their
//! flows are computed together and owned by one object.

use super::FlowManager;
use super::consts::*;
use crate::model::VlanRange;
use gbp_api::MacAddr;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::PortMapper;
use gbp_flow::engine::SwitchConnection;
use gbp_flow::engine::flow::LearnSpec;
use gbp_flow::engine::flow::VLAN_CFI;
use gbp_flow::engine::flow::VLAN_VID_MASK;
use gbp_flow::engine::range_mask::get_masks;
use slog::debug;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

pub(super) const LB_OBJ: &str = "learning-bridge";

const MAX_VLAN: u16 = 4095;

/// Bridge protocol traffic: 01:80:c2:00:00:00 to 01:80:c2:00:00:0f.
const RESERVED_MCAST: MacAddr = MacAddr::from_const([0x01, 0x80, 0xc2, 0x00, 0x00, 0x00]);
const RESERVED_MCAST_MASK: MacAddr = MacAddr::from_const([0xff, 0xff, 0xff, 0xff, 0xff, 0xf0]);

/// How long a learned MAC survives without traffic, in seconds.
const LEARN_IDLE_TIMEOUT: u16 = 300;
const LEARNED_PRIORITY: u16 = 200;

/// A run of VLANs trunked by the same set of ports.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VlanInterval {
    pub start: u16,
    pub end: u16,
    pub ports: BTreeSet<u32>,
}

/// Split the VLAN space into maximal intervals over which the set of
/// trunking ports does not change. VLANs no port trunks are left out.
pub fn vlan_intervals(trunks: &[(u32, VlanRange)]) -> Vec<VlanInterval> {
    let ranges: Vec<(u32, u16, u16)> = trunks
        .iter()
        .map(|(port, r)| {
            let lo = r.start.min(r.end).min(MAX_VLAN);
            let hi = r.start.max(r.end).min(MAX_VLAN);
            (*port, lo, hi)
        })
        .collect();

    let mut cuts = BTreeSet::new();
    for (_, lo, hi) in &ranges {
        cuts.insert(u32::from(*lo));
        cuts.insert(u32::from(*hi) + 1);
    }
    let cuts: Vec<u32> = cuts.into_iter().collect();

    let mut out: Vec<VlanInterval> = vec![];
    for w in cuts.windows(2) {
        // Both cuts are at most MAX_VLAN + 1.
        let (start, end) = (w[0] as u16, (w[1] - 1) as u16);
        let ports: BTreeSet<u32> = ranges
            .iter()
            .filter(|(_, lo, hi)| *lo <= start && start <= *hi)
            .map(|(p, _, _)| *p)
            .collect();
        if ports.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(prev) if prev.ports == ports && prev.end + 1 == start => prev.end = end,
            _ => out.push(VlanInterval { start, end, ports }),
        }
    }
    out
}

/// The TCI match of a VLAN mask: the tag must be present.
fn tci_match(m: gbp_flow::engine::range_mask::Mask) -> (u16, u16) {
    (VLAN_CFI | (m.value & VLAN_VID_MASK), VLAN_CFI | (m.mask & VLAN_VID_MASK))
}

impl<C: SwitchConnection> FlowManager<C> {
    pub(super) fn update_learning_bridge(&mut self) {
        let snap = self.policy.load();

        let mut trunks = vec![];
        for (uuid, lb) in &snap.learning_bridge_ifaces {
            let Some(port) = lb.interface.as_deref().and_then(|i| self.ports.find_port(i))
            else {
                continue;
            };
            debug!(self.log, "learning bridge interface";
                "uuid" => %uuid, "port" => port, "ranges" => lb.trunk_vlans.len());
            trunks.extend(lb.trunk_vlans.iter().map(|r| (port, *r)));
        }

        let mut sec = vec![];
        let mut lrn = vec![];
        // Admission is per port and VLAN run; a port's runs may come
        // from several interfaces.
        let mut admitted: BTreeMap<u32, BTreeSet<(u16, u16)>> = BTreeMap::new();

        for iv in vlan_intervals(&trunks) {
            let masks = get_masks(Some(iv.start), Some(iv.end));
            for port in &iv.ports {
                admitted.entry(*port).or_default().insert((iv.start, iv.end));

                let peers: Vec<u32> = iv.ports.iter().copied().filter(|p| p != port).collect();
                if peers.is_empty() {
                    continue;
                }
                for m in &masks {
                    let (tci, mask) = tci_match(*m);
                    let mut fb = FlowBuilder::new();
                    fb.priority(100).in_port(*port).vlan_tci_masked(tci, mask);
                    for p in &peers {
                        fb.output(*p);
                    }
                    lrn.push(fb.build());
                }
            }
        }

        for (port, runs) in admitted {
            for (start, end) in runs {
                for m in get_masks(Some(start), Some(end)) {
                    let (tci, mask) = tci_match(m);

                    // Never forward bridge protocol traffic or frames
                    // claiming a multicast source.
                    sec.push(
                        FlowBuilder::new()
                            .priority(500)
                            .cookie(cookie::LEARN_BRIDGE)
                            .in_port(port)
                            .vlan_tci_masked(tci, mask)
                            .eth_dst_masked(RESERVED_MCAST, RESERVED_MCAST_MASK)
                            .build(),
                    );
                    sec.push(
                        FlowBuilder::new()
                            .priority(500)
                            .cookie(cookie::LEARN_BRIDGE)
                            .in_port(port)
                            .vlan_tci_masked(tci, mask)
                            .eth_src_masked(MacAddr::MULTICAST, MacAddr::MULTICAST)
                            .build(),
                    );

                    sec.push(
                        FlowBuilder::new()
                            .priority(499)
                            .cookie(cookie::LEARN_BRIDGE)
                            .in_port(port)
                            .vlan_tci_masked(tci, mask)
                            .learn(LearnSpec {
                                table: LEARN_TABLE,
                                priority: LEARNED_PRIORITY,
                                idle_timeout: LEARN_IDLE_TIMEOUT,
                                cookie: cookie::LEARN_BRIDGE,
                            })
                            .go(LEARN_TABLE)
                            .build(),
                    );
                }
            }
        }

        self.switch.write_flow(LB_OBJ, SEC_TABLE, sec);
        self.switch.write_flow(LB_OBJ, LEARN_TABLE, lrn);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg::AgentConfig;
    use crate::model::LearningBridgeIface;
    use crate::model::PolicySnapshot;
    use crate::model::PolicyStore;
    use gbp_flow::engine::MockSwitch;
    use gbp_flow::engine::flow::Action;
    use slog::Logger;
    use slog::o;
    use uuid::Uuid;

    fn range(start: u16, end: u16) -> VlanRange {
        VlanRange { start, end }
    }

    #[test]
    fn intervals_split_on_membership() {
        let iv = vlan_intervals(&[(1, range(10, 20)), (2, range(30, 15))]);
        assert_eq!(
            iv,
            vec![
                VlanInterval { start: 10, end: 14, ports: [1].into() },
                VlanInterval { start: 15, end: 20, ports: [1, 2].into() },
                VlanInterval { start: 21, end: 30, ports: [2].into() },
            ]
        );
    }

    #[test]
    fn intervals_merge_and_clamp() {
        let iv = vlan_intervals(&[
            (1, range(100, 199)),
            (1, range(200, 299)),
            (2, range(4000, 9000)),
        ]);
        assert_eq!(
            iv,
            vec![
                VlanInterval { start: 100, end: 299, ports: [1].into() },
                VlanInterval { start: 4000, end: 4095, ports: [2].into() },
            ]
        );
        assert!(vlan_intervals(&[]).is_empty());
    }

    fn mgr(ifaces: Vec<(&str, Vec<VlanRange>)>) -> FlowManager<MockSwitch> {
        let mut snap = PolicySnapshot::default();
        for (i, (name, ranges)) in ifaces.into_iter().enumerate() {
            snap.learning_bridge_ifaces.insert(
                Uuid::from_u128(i as u128 + 1),
                LearningBridgeIface {
                    interface: Some(name.to_string()),
                    trunk_vlans: ranges,
                },
            );
        }
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
    fn trunk_flows() {
        let mut m = mgr(vec![("trunk1", vec![range(5, 5)]), ("trunk2", vec![range(4, 7)])]);
        // No ports, no flows.
        m.port_status_update("trunk1", Some(1));
        assert!(m.switch().flows_for(LB_OBJ, LEARN_TABLE).is_empty());
        assert_eq!(m.switch().flows_for(LB_OBJ, SEC_TABLE).len(), 3);

        m.port_status_update("trunk2", Some(2));
        let sec = m.switch().flows_for(LB_OBJ, SEC_TABLE);
        // trunk1: VLAN 5. trunk2: 4, 5, 6-7.
        assert_eq!(sec.len(), 3 * 4);
        let learn = sec.iter().find(|f| f.priority == 499).unwrap();
        assert!(matches!(
            learn.actions[0],
            Action::Learn(LearnSpec { table: LEARN_TABLE, .. })
        ));

        let lrn = m.switch().flows_for(LB_OBJ, LEARN_TABLE);
        assert_eq!(lrn.len(), 2);
        let from1 = lrn.iter().find(|f| f.matches.in_port == Some(1)).unwrap();
        assert_eq!(from1.actions, vec![Action::Output(2)]);
        assert_eq!(
            from1.matches.vlan_tci.map(|t| (t.value, t.mask)),
            Some((VLAN_CFI | 5, Some(VLAN_CFI | VLAN_VID_MASK)))
        );

        m.port_status_update("trunk1", None);
        assert!(m.switch().flows_for(LB_OBJ, LEARN_TABLE).is_empty());
    }
}
