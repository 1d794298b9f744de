// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Table numbers, registers, metadata bits, and cookies of the
//! integration bridge pipeline.

use gbp_flow::engine::TableId;

// ================================================================
// Tables, in pipeline order
// ================================================================

pub const DROP_LOG_TABLE: TableId = 0;
/// Port security: admit traffic by port, MAC, and IP.
pub const SEC_TABLE: TableId = 1;
/// Source classification: load the source EPG and its domains.
pub const SRC_TABLE: TableId = 2;
/// Service reverse path.
pub const SVR_TABLE: TableId = 3;
pub const BRIDGE_TABLE: TableId = 4;
/// Service next hop selection.
pub const SVH_TABLE: TableId = 5;
pub const ROUTE_TABLE: TableId = 6;
pub const NAT_IN_TABLE: TableId = 7;
pub const LEARN_TABLE: TableId = 8;
/// Service destination delivery.
pub const SVD_TABLE: TableId = 9;
pub const POL_TABLE: TableId = 10;
pub const STATS_TABLE: TableId = 11;
pub const OUT_TABLE: TableId = 12;
pub const EXP_DROP_TABLE: TableId = 13;
pub const NUM_TABLES: u8 = 14;

// ================================================================
// Registers
// ================================================================

pub const REG_SEPG: u8 = 0;
pub const REG_DEPG: u8 = 2;
pub const REG_BD: u8 = 4;
pub const REG_FD: u8 = 5;
pub const REG_RD: u8 = 6;
pub const REG_OUTPORT: u8 = 7;

// ================================================================
// Metadata
// ================================================================

pub mod meta {
    /// The low byte selects what the output table does.
    pub mod out {
        pub const MASK: u64 = 0xff;
        pub const TUNNEL: u64 = 1;
        pub const FLOOD: u64 = 2;
        pub const RESUBMIT_DST: u64 = 3;
        pub const NAT: u64 = 4;
        pub const REV_NAT: u64 = 5;
        pub const REMOTE_TUNNEL: u64 = 6;
    }

    pub const POLICY_APPLIED: u64 = 0x100;
    pub const FROM_SERVICE_INTERFACE: u64 = 0x200;
    pub const ROUTED: u64 = 0x400;
    pub const DROP_LOG: u64 = 0x800;
}

// ================================================================
// Cookies
// ================================================================

pub mod cookie {
    const fn c(v: u64) -> u64 {
        (1 << 63) | v
    }

    pub const PROACTIVE_LEARN: u64 = c(1);
    pub const LEARN: u64 = c(2);
    pub const NEIGH_DISC: u64 = c(3);
    pub const DHCP_V4: u64 = c(4);
    pub const DHCP_V6: u64 = c(5);
    pub const VIRTUAL_IP_V4: u64 = c(6);
    pub const VIRTUAL_IP_V6: u64 = c(7);
    pub const ICMP_ERROR_V4: u64 = c(8);
    pub const ICMP_ERROR_V6: u64 = c(9);
    pub const TABLE_DROP: u64 = c(10);
    pub const DROP_LOG: u64 = c(11);
    pub const LEARN_BRIDGE: u64 = c(12);
}

// ================================================================
// Connection tracking state bits
// ================================================================

pub mod ct {
    pub const NEW: u32 = 0x01;
    pub const ESTABLISHED: u32 = 0x02;
    pub const INVALID: u32 = 0x10;
    pub const TRACKED: u32 = 0x20;
}

// ================================================================
// Protocol constants
// ================================================================

pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

pub const ND_ROUTER_SOLICIT: u16 = 133;
pub const ND_NEIGHBOR_SOLICIT: u16 = 135;
pub const ND_NEIGHBOR_ADVERT: u16 = 136;

pub const MAX_POLICY_RULE_PRIORITY: u16 = 8192;

/// The address of the virtual DHCPv4 server when the endpoint does not
/// name one.
pub const LINK_LOCAL_DHCP: std::net::Ipv4Addr =
    std::net::Ipv4Addr::new(169, 254, 32, 32);

/// Private VNIDs (external networks, local external domains) have the
/// top bit set; wire VNIDs are at most 24 bits.
pub const PRIVATE_VNID: u32 = 1 << 31;

// ================================================================
// Id namespaces
// ================================================================

pub mod ns {
    pub const FLOOD_DOMAIN: &str = "floodDomain";
    pub const BRIDGE_DOMAIN: &str = "bridgeDomain";
    pub const ROUTING_DOMAIN: &str = "routingDomain";
    pub const EXTERNAL_NETWORK: &str = "externalNetwork";
    pub const CLASSIFIER_RULE: &str = "l24classifierRule";
    pub const SERVICE: &str = "service";
    pub const SVC_STATS: &str = "svcstats";
    pub const CT_ZONE: &str = "ctzone";
    pub const LOCAL_EXT_DOMAIN: &str = "localExternalDomain";

    pub const ALL: [&str; 9] = [
        FLOOD_DOMAIN,
        BRIDGE_DOMAIN,
        ROUTING_DOMAIN,
        EXTERNAL_NETWORK,
        CLASSIFIER_RULE,
        SERVICE,
        SVC_STATS,
        CT_ZONE,
        LOCAL_EXT_DOMAIN,
    ];
}
