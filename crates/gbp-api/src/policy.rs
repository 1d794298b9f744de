// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Mode settings carried by policy objects.

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// How ARP requests and IPv6 neighbor solicitations are handled in a
/// flood domain.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum AddressResMode {
    /// Send resolution requests for a known endpoint straight to its
    /// port.
    #[default]
    Unicast,
    /// Flood resolution requests like any other broadcast.
    Flood,
    /// Drop resolution requests for known endpoints.
    Drop,
}

/// What happens to unicast traffic with an unknown destination.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownFloodMode {
    #[default]
    Drop,
    Flood,
}

/// Broadcast handling within an endpoint group.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum BcastFloodMode {
    #[default]
    Normal,
    /// Broadcasts are subject to policy, like unicast traffic between
    /// groups.
    Isolated,
}

/// Policy applied to traffic between endpoints of the same group.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum IntraGroupPolicy {
    #[default]
    Allow,
    Deny,
    /// Intra-group traffic needs a contract with the group as both
    /// provider and consumer.
    RequireContract,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum EnforcementMode {
    #[default]
    Enforced,
    /// Traffic in the routing domain bypasses contracts.
    Unenforced,
}

/// How much of the remote endpoint inventory is known locally.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum InventoryMode {
    #[default]
    None,
    OnLink,
    /// Every remote endpoint is known; unmatched traffic is not sent
    /// to the tunnel.
    Complete,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceMode {
    /// A single service address answered by the local endpoint, or
    /// hashed across next hops.
    #[default]
    Anycast,
    /// A service address spread across next hops, optionally with
    /// connection tracking.
    LoadBalancer,
}

/// The transport protocol of a service mapping.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ServiceProto {
    #[default]
    Tcp,
    Udp,
}

impl ServiceProto {
    pub fn ip_proto(&self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }
}

impl Display for AddressResMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Unicast => "unicast",
            Self::Flood => "flood",
            Self::Drop => "drop",
        };
        write!(f, "{s}")
    }
}

impl Display for ServiceMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Anycast => "anycast",
            Self::LoadBalancer => "loadbalancer",
        };
        write!(f, "{s}")
    }
}
