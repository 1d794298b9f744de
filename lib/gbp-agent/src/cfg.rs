// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Agent configuration.
//!
//! The configuration is read once from a TOML file when the agent
//! starts. Every field has a default so that an empty (or missing)
//! file yields a working agent with no uplink encapsulation.

use gbp_api::EncapType;
use gbp_api::FloodScope;
use gbp_api::MacAddr;
use gbp_flow::engine::table_state::ReconcileIgnore;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use slog::info;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },

    #[error("malformed config {path}: {err}")]
    Toml { path: PathBuf, err: toml::de::Error },

    #[error("invalid reconcile-ignore entry: {0}")]
    ReconcileIgnore(String),

    #[error("tunnel destination must be IPv4: {0}")]
    TunnelNotIpv4(IpAddr),
}

pub const DEFAULT_ROUTER_MAC: MacAddr =
    MacAddr::from_const([0x00, 0x22, 0xbd, 0xf8, 0x19, 0xff]);
pub const DEFAULT_DHCP_MAC: MacAddr =
    MacAddr::from_const([0x00, 0x22, 0xbd, 0xf8, 0x19, 0xff]);
pub const DEFAULT_TUNNEL_PORT: u16 = 4789;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct VirtualRouterCfg {
    pub enabled: bool,
    /// Answer router solicitations from endpoints.
    pub router_adv: bool,
    pub mac: MacAddr,
}

impl Default for VirtualRouterCfg {
    fn default() -> Self {
        Self { enabled: true, router_adv: false, mac: DEFAULT_ROUTER_MAC }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct VirtualDhcpCfg {
    pub enabled: bool,
    pub mac: MacAddr,
}

impl Default for VirtualDhcpCfg {
    fn default() -> Self {
        Self { enabled: false, mac: DEFAULT_DHCP_MAC }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DropLogCfg {
    pub enabled: bool,
}

/// The overall configuration of the integration bridge agent.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AgentConfig {
    /// The uplink encapsulation, or `None` when endpoints are only
    /// connected locally.
    pub encap_type: Option<EncapType>,

    /// The name of the tunnel (or VLAN uplink) interface.
    pub encap_iface: String,

    /// A physical uplink admitted in the security table like the
    /// tunnel interface.
    pub uplink_iface: Option<String>,

    pub flood_scope: FloodScope,

    /// The default unicast tunnel destination.
    pub tunnel_remote_ip: Ipv4Addr,
    pub tunnel_remote_port: u16,

    pub virtual_router: VirtualRouterCfg,
    pub virtual_dhcp: VirtualDhcpCfg,

    pub conntrack_enabled: bool,

    /// Where to write the active multicast groups.
    pub multicast_group_file: Option<PathBuf>,

    /// Where to persist allocated ids. Ids live only in memory when
    /// unset.
    pub id_dir: Option<PathBuf>,

    pub drop_log: DropLogCfg,

    /// Kinds of edit (`add`, `mod`, `del`) to skip when reconciling
    /// against a freshly dumped switch.
    pub reconcile_ignore: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            encap_type: None,
            encap_iface: String::new(),
            uplink_iface: None,
            flood_scope: FloodScope::default(),
            tunnel_remote_ip: Ipv4Addr::LOCALHOST,
            tunnel_remote_port: DEFAULT_TUNNEL_PORT,
            virtual_router: VirtualRouterCfg::default(),
            virtual_dhcp: VirtualDhcpCfg::default(),
            conntrack_enabled: false,
            multicast_group_file: None,
            id_dir: None,
            drop_log: DropLogCfg::default(),
            reconcile_ignore: vec![],
        }
    }
}

impl AgentConfig {
    /// Load the configuration from `path`. A missing file is not an
    /// error: it is logged and the defaults are returned.
    pub fn from_file(log: &Logger, path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(log, "no config file, using defaults";
                    "path" => %path.display());
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(ConfigError::Io { path: path.to_path_buf(), err });
            }
        };

        let cfg: Self = Self::from_toml(&data)
            .map_err(|err| ConfigError::Toml { path: path.to_path_buf(), err })?;
        cfg.reconcile_ignore()?;
        Ok(cfg)
    }

    pub fn from_toml(data: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(data)
    }

    /// The parsed set of edit kinds skipped during reconciliation.
    pub fn reconcile_ignore(&self) -> Result<ReconcileIgnore, ConfigError> {
        self.reconcile_ignore.iter().try_fold(
            ReconcileIgnore::empty(),
            |acc, s| {
                s.parse::<ReconcileIgnore>()
                    .map(|k| acc | k)
                    .map_err(|_| ConfigError::ReconcileIgnore(s.clone()))
            },
        )
    }

    pub fn set_encap_type(&mut self, encap: Option<EncapType>) {
        self.encap_type = encap;
    }

    /// Set the tunnel interface. An empty name leaves the current one
    /// in place.
    pub fn set_encap_iface(&mut self, iface: &str) {
        if !iface.is_empty() {
            self.encap_iface = iface.to_string();
        }
    }

    pub fn set_flood_scope(&mut self, scope: FloodScope) {
        self.flood_scope = scope;
    }

    pub fn set_tunnel(&mut self, ip: IpAddr, port: u16) -> Result<(), ConfigError> {
        match ip {
            IpAddr::V4(ip) => {
                self.tunnel_remote_ip = ip;
                self.tunnel_remote_port = port;
                Ok(())
            }
            IpAddr::V6(_) => Err(ConfigError::TunnelNotIpv4(ip)),
        }
    }

    pub fn set_virtual_router(&mut self, enabled: bool, router_adv: bool, mac: MacAddr) {
        self.virtual_router = VirtualRouterCfg { enabled, router_adv, mac };
    }

    pub fn set_virtual_dhcp(&mut self, enabled: bool, mac: MacAddr) {
        self.virtual_dhcp = VirtualDhcpCfg { enabled, mac };
    }

    pub fn set_multicast_group_file(&mut self, path: PathBuf) {
        self.multicast_group_file = Some(path);
    }

    pub fn enable_conntrack(&mut self) {
        self.conntrack_enabled = true;
    }

    /// Is the uplink an IP overlay that can address individual
    /// tunnel destinations?
    pub fn is_ip_overlay(&self) -> bool {
        self.encap_type.is_some_and(|e| e.is_ip_overlay())
    }

    pub fn router_mac(&self) -> MacAddr {
        self.virtual_router.mac
    }

    pub fn dhcp_mac(&self) -> MacAddr {
        self.virtual_dhcp.mac
    }
}
