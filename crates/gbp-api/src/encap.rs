// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// How EPG traffic is carried on the uplink.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncapType {
    /// VXLAN; the VNID is carried as the tunnel id and the tunnel
    /// destination is loaded per packet.
    Vxlan,
    /// 802.1Q; the VNID is carried as the VLAN id.
    Vlan,
    /// VXLAN with the tunnel destination owned by the tunnel port
    /// configuration rather than the flow.
    Ivxlan,
}

impl EncapType {
    /// Whether the encapsulation is an IP-addressable overlay, which
    /// remote-tunnel addressing and multicast groups require.
    pub fn is_ip_overlay(&self) -> bool {
        matches!(self, Self::Vxlan | Self::Ivxlan)
    }
}

impl FromStr for EncapType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vxlan" => Ok(Self::Vxlan),
            "vlan" => Ok(Self::Vlan),
            "ivxlan" => Ok(Self::Ivxlan),
            _ => Err(format!("invalid encapsulation type: {s}")),
        }
    }
}

impl Display for EncapType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Vxlan => "vxlan",
            Self::Vlan => "vlan",
            Self::Ivxlan => "ivxlan",
        };
        write!(f, "{s}")
    }
}

/// The scope a flood group is created for.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum FloodScope {
    /// One flood group per flood domain.
    #[default]
    FloodDomain,
    /// One flood group per endpoint group.
    EndpointGroup,
}

impl FromStr for FloodScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flood-domain" | "fd" => Ok(Self::FloodDomain),
            "endpoint-group" | "epg" => Ok(Self::EndpointGroup),
            _ => Err(format!("invalid flood scope: {s}")),
        }
    }
}
