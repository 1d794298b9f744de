// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The uplink encapsulation.
//!
//! Three points in the pipeline depend on how EPG traffic is carried
//! across the uplink:
//!
//! * the source table, which recognizes the VNID of a packet arriving
//!   from the uplink (a VXLAN tunnel id, or a VLAN tag);
//! * the output table and the flood groups, which put the source EPG's
//!   VNID (and, for VXLAN, the tunnel destination) back on the packet;
//! * the ARP responders, which send a reply back the way the request
//!   came.
//!
//! Each synthesis routine asks the [`EncapFlows`] implementation once
//! for its contribution instead of matching on [`EncapType`] itself.

use super::consts::REG_OUTPORT;
use super::consts::REG_SEPG;
use gbp_api::EncapType;
use gbp_flow::engine::FlowBuilder;
use gbp_flow::engine::flow::Action;
use gbp_flow::engine::flow::Field;
use gbp_flow::engine::flow::VLAN_VID_MASK;
use std::net::Ipv4Addr;

pub trait EncapFlows {
    /// Match a packet of EPG `vnid` as received on the uplink.
    fn source_match(&self, fb: &mut FlowBuilder, vnid: u32);

    /// Actions removing the encapsulation from a packet admitted from
    /// the uplink before it is classified.
    fn decap_actions(&self) -> Vec<Action>;

    /// Actions preparing a packet for output on the uplink. The source
    /// VNID is taken from `reg0`. With no explicit destination, an IP
    /// overlay takes the tunnel destination from `reg7`.
    fn tunnel_actions(&self, dst: Option<Ipv4Addr>) -> Vec<Action>;

    /// Actions returning a locally generated reply to the sender of a
    /// packet received on the uplink.
    fn reply_actions(&self) -> Vec<Action>;
}

impl EncapFlows for EncapType {
    fn source_match(&self, fb: &mut FlowBuilder, vnid: u32) {
        match self {
            Self::Vlan => {
                fb.vlan((vnid as u16) & VLAN_VID_MASK);
            }
            Self::Vxlan | Self::Ivxlan => {
                fb.tun_id(u64::from(vnid));
            }
        }
    }

    fn decap_actions(&self) -> Vec<Action> {
        match self {
            Self::Vlan => vec![Action::PopVlan],
            Self::Vxlan | Self::Ivxlan => vec![],
        }
    }

    fn tunnel_actions(&self, dst: Option<Ipv4Addr>) -> Vec<Action> {
        match self {
            Self::Vlan => vec![
                Action::PushVlan,
                Action::Move { src: Field::Reg(REG_SEPG), dst: Field::VlanVid },
            ],

            Self::Vxlan => {
                let mut actions = vec![Action::Move {
                    src: Field::Reg(REG_SEPG),
                    dst: Field::TunId,
                }];
                match dst {
                    Some(ip) => actions.push(Action::SetTunDst(ip)),
                    None => actions.push(Action::Move {
                        src: Field::Reg(REG_OUTPORT),
                        dst: Field::TunDst,
                    }),
                }
                actions
            }

            // The iVXLAN port carries the metadata itself.
            Self::Ivxlan => vec![],
        }
    }

    fn reply_actions(&self) -> Vec<Action> {
        match self {
            Self::Vlan => vec![
                Action::PushVlan,
                Action::Move { src: Field::Reg(REG_SEPG), dst: Field::VlanVid },
            ],
            Self::Vxlan | Self::Ivxlan => {
                vec![Action::Move { src: Field::TunSrc, dst: Field::TunDst }]
            }
        }
    }
}
