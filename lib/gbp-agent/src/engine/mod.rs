// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow synthesis engine of the integration bridge.
//!
//! The [`FlowManager`] turns the policy into the expected contents of
//! every table of the pipeline:
//!
//! ```text
//! DROPLOG -> SEC -> SRC -> SVR -> BR -> SVH -> RT -> NAT -> LRN -> SVD
//!         -> POL -> STAT -> OUT -> EXP_DROPLOG
//! ```
//!
//! Every policy object owns the flows it produced, under its URI (or
//! UUID). A notification about an object recomputes that object's
//! flows from the current [`PolicySnapshot`] and hands them to the
//! [`SwitchManager`], which turns the difference into edits. Writing
//! an empty set is how an object's flows are retired.
//!
//! The synthesis itself lives in one module per scope:
//!
//! * `static_flows`: table-miss entries and the fixed pipeline glue;
//! * `epg`: uplink classification, intra-group policy, output;
//! * `flood`: flood groups and the flood entries of each group;
//! * `domain`: routing domains, subnets, external networks;
//! * `endpoint` and `nat`: local endpoints and their IP mappings;
//! * `contract`: classifier rules between groups;
//! * `service`: anycast and load balanced services and their stats;
//! * `remote_ep`, `learning_bridge`, `external`: the remaining scopes.

use crate::cfg::AgentConfig;
use crate::cfg::ConfigError;
use crate::mcast::MulticastMap;
use crate::mcast::write_multicast_groups;
use crate::model::PolicySnapshot;
use crate::model::PolicyStore;
use common::FwdInfo;
use common::PipelineEnv;
use consts::NUM_TABLES;
use consts::PRIVATE_VNID;
use consts::ns;
use flood::FloodGroup;
use gbp_api::ClassId;
use gbp_api::FloodScope;
use gbp_api::Uri;
use gbp_flow::engine::IdGenerator;
use gbp_flow::engine::PortMap;
use gbp_flow::engine::PortMapper;
use gbp_flow::engine::SwitchConnection;
use gbp_flow::engine::SwitchManager;
use gbp_flow::engine::id_gen::IdGenError;
use gbp_flow::engine::switch::ConnectionState;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use uuid::Uuid;

pub mod common;
pub mod consts;
pub mod encap;

mod contract;
mod domain;
mod endpoint;
mod epg;
mod external;
mod flood;
mod learning_bridge;
mod nat;
mod remote_ep;
mod service;
mod static_flows;

pub use contract::classifier_entries;
pub use learning_bridge::VlanInterval;
pub use learning_bridge::vlan_intervals;
pub use service::stats_key;

pub struct FlowManager<C: SwitchConnection> {
    log: Logger,
    cfg: AgentConfig,
    policy: PolicyStore,
    switch: SwitchManager<C>,
    ids: IdGenerator,
    ports: PortMap,
    /// Flood group URI -> the local endpoints delivering into it.
    flood_groups: BTreeMap<Uri, FloodGroup>,
    mcast: MulticastMap,
    /// The platform-wide multicast tunnel destination.
    mcast_tun_dst: Option<Ipv4Addr>,
    stopping: bool,
}

impl<C: SwitchConnection> FlowManager<C> {
    pub fn new(
        log: &Logger,
        cfg: AgentConfig,
        policy: PolicyStore,
        conn: C,
    ) -> Result<Self, ConfigError> {
        let ignore = cfg.reconcile_ignore()?;
        let log = log.new(o!("component" => "flow-manager"));
        let switch = SwitchManager::new(&log, conn, NUM_TABLES, ignore);
        let ids = IdGenerator::new(&log, cfg.id_dir.clone());

        Ok(Self {
            log,
            cfg,
            policy,
            switch,
            ids,
            ports: PortMap::new(),
            flood_groups: BTreeMap::new(),
            mcast: MulticastMap::new(),
            mcast_tun_dst: None,
            stopping: false,
        })
    }

    /// Load persisted ids, resolve the platform config, and write the
    /// static flows.
    pub fn start(&mut self) {
        info!(self.log, "starting flow manager";
            "encap" => ?self.cfg.encap_type,
            "encap_iface" => &self.cfg.encap_iface);

        for n in ns::ALL {
            if let Err(e) = self.ids.init_namespace(n) {
                warn!(self.log, "could not load persisted ids";
                    "namespace" => n, "err" => %e);
            }
        }
        let snap = self.policy.load();
        self.init_platform_config(&snap);
        self.create_static_flows();
    }

    /// Ignore further notifications and persist the allocated ids.
    pub fn stop(&mut self) -> Result<(), IdGenError> {
        info!(self.log, "stopping flow manager");
        self.stopping = true;
        self.ids.persist()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    pub fn switch(&self) -> &SwitchManager<C> {
        &self.switch
    }

    pub fn switch_mut(&mut self) -> &mut SwitchManager<C> {
        &mut self.switch
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn ports(&self) -> &PortMap {
        &self.ports
    }

    pub fn multicast(&self) -> &MulticastMap {
        &self.mcast
    }

    pub fn mcast_tun_dst(&self) -> Option<Ipv4Addr> {
        self.mcast_tun_dst
    }

    /// The agent-wide inputs as they stand right now.
    pub fn env(&self) -> PipelineEnv {
        let tun_port = if self.cfg.encap_iface.is_empty() {
            None
        } else {
            self.ports.find_port(&self.cfg.encap_iface)
        };

        PipelineEnv {
            encap: self.cfg.encap_type,
            tun_port,
            uplink_port: self
                .cfg
                .uplink_iface
                .as_deref()
                .and_then(|n| self.ports.find_port(n)),
            tunnel_dst: self.cfg.tunnel_remote_ip,
            flood_scope: self.cfg.flood_scope,
            router_mac: self.cfg.router_mac(),
            dhcp_mac: self.cfg.dhcp_mac(),
            virtual_router: self.cfg.virtual_router.enabled,
            router_adv: self.cfg.virtual_router.router_adv,
            virtual_dhcp: self.cfg.virtual_dhcp.enabled,
            conntrack: self.cfg.conntrack_enabled,
            drop_log: self.cfg.drop_log.enabled,
        }
    }

    fn id(&self, ns: &str, uri: &Uri) -> u32 {
        self.ids.get_id(ns, uri.as_str())
    }

    /// External networks get private VNIDs.
    pub fn ext_net_vnid(&self, uri: &Uri) -> u32 {
        self.id(ns::EXTERNAL_NETWORK, uri) | PRIVATE_VNID
    }

    /// The id of the companion group holding only the promiscuous
    /// members of flood group `fgrp`.
    pub fn prom_id(fgrp: u32) -> u32 {
        (1 << 31) | fgrp
    }

    /// Resolve how traffic of `epg` is forwarded. A group without a
    /// VNID, or without any domain, has no forwarding information.
    fn fwd_info(&self, snap: &PolicySnapshot, epg: &Uri) -> Option<FwdInfo> {
        let vnid = snap.group(epg)?.vnid?;
        let rd = snap.group_rd(epg).map(|(u, _)| u.clone());
        let bd = snap.group_bd(epg).map(|(u, _)| u.clone());
        let fd = snap.group_fd(epg).map(|(u, _)| u.clone());
        if rd.is_none() && bd.is_none() && fd.is_none() {
            return None;
        }

        let fgrp = fd.map(|fd| match self.cfg.flood_scope {
            FloodScope::EndpointGroup => epg.clone(),
            FloodScope::FloodDomain => fd,
        });

        Some(FwdInfo {
            vnid,
            rd_id: rd.as_ref().map_or(0, |u| self.id(ns::ROUTING_DOMAIN, u)),
            rd,
            bd_id: bd.as_ref().map_or(0, |u| self.id(ns::BRIDGE_DOMAIN, u)),
            bd,
            fgrp_id: fgrp.as_ref().map_or(0, |u| self.id(ns::FLOOD_DOMAIN, u)),
            fgrp,
        })
    }

    /// The VNID a contract participant is enforced under: a group in a
    /// routing domain, or an external network or local external
    /// domain attached to one.
    fn group_vnid(&self, snap: &PolicySnapshot, uri: &Uri) -> Option<u32> {
        if let Some(g) = snap.group(uri) {
            let vnid = g.vnid?;
            snap.group_rd(uri)?;
            return Some(vnid);
        }
        if snap.ext_net_rd(uri).is_some() {
            return Some(self.ext_net_vnid(uri));
        }
        let led = snap.local_external_domains.get(uri)?;
        snap.routing_domains.get(&led.routing_domain)?;
        Some(self.led_vnid(uri))
    }

    /// The multicast tunnel destination of a group's broadcast traffic.
    /// Only an IP overlay has one.
    fn epg_tunnel_dst(&self, snap: &PolicySnapshot, epg: &Uri) -> Option<Ipv4Addr> {
        if !self.cfg.is_ip_overlay() {
            return None;
        }

        let fallback = self.mcast_tun_dst.unwrap_or(self.cfg.tunnel_remote_ip);
        let Some(ip) = snap.group(epg).and_then(|g| g.multicast_ip.as_deref()) else {
            return Some(fallback);
        };
        match ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) if v4.is_multicast() => Some(v4),
            _ => {
                warn!(self.log, "ignoring invalid group multicast address";
                    "group" => %epg, "ip" => ip);
                Some(fallback)
            }
        }
    }

    // ================================================================
    // Notifications
    // ================================================================

    pub fn eg_domain_updated(&mut self, epg: &Uri) {
        if self.stopping {
            return;
        }
        self.update_epg(epg);
    }

    pub fn domain_updated(&mut self, class: ClassId, uri: &Uri) {
        if self.stopping {
            return;
        }

        let snap = self.policy.load();
        match class {
            ClassId::EndpointGroup => self.update_epg(uri),
            ClassId::RoutingDomain => self.update_routing_domain(uri),
            ClassId::BridgeDomain => {
                if !snap.bridge_domains.contains_key(uri) {
                    debug!(self.log, "cleaning up bridge domain"; "uri" => %uri);
                    self.switch.clear_flows(uri.as_str(), consts::BRIDGE_TABLE);
                    self.ids.erase(ns::BRIDGE_DOMAIN, uri.as_str());
                }
                self.update_referencing_groups(&snap, uri);
            }
            ClassId::FloodDomain => {
                if !snap.flood_domains.contains_key(uri) {
                    debug!(self.log, "cleaning up flood domain"; "uri" => %uri);
                    self.ids.erase(ns::FLOOD_DOMAIN, uri.as_str());
                }
                self.update_referencing_groups(&snap, uri);
            }
            ClassId::Subnet => {
                if !snap.subnets.contains_key(uri) {
                    debug!(self.log, "cleaning up subnet"; "uri" => %uri);
                    self.switch.clear_flows(uri.as_str(), consts::BRIDGE_TABLE);
                }
                self.update_referencing_groups(&snap, uri);
            }
            ClassId::FloodContext => {
                if !snap.flood_contexts.contains_key(uri) {
                    debug!(self.log, "cleaning up flood context"; "uri" => %uri);
                    if self.mcast.remove(uri) {
                        self.multicast_groups_updated();
                    }
                }
                for epg in snap.groups_in_flood_context(uri) {
                    self.update_epg(&epg);
                }
            }
            ClassId::L3ExternalNetwork => {
                if !snap.external_networks.contains_key(uri) {
                    debug!(self.log, "cleaning up external network"; "uri" => %uri);
                    self.ids.erase(ns::EXTERNAL_NETWORK, uri.as_str());
                }
                let rds: Vec<Uri> = snap
                    .routing_domains
                    .iter()
                    .filter(|(_, rd)| rd.external_networks.contains(uri))
                    .map(|(u, _)| u.clone())
                    .collect();
                for rd in rds {
                    self.update_routing_domain(&rd);
                }
                for c in snap.contracts_for_group(uri) {
                    self.update_contract(&c);
                }
            }
            ClassId::L24Classifier => {
                let contracts: Vec<Uri> = snap
                    .contracts
                    .iter()
                    .filter(|(_, c)| c.rules.iter().any(|r| &r.classifier == uri))
                    .map(|(u, _)| u.clone())
                    .collect();
                for c in contracts {
                    self.update_contract(&c);
                }
            }
            ClassId::LocalExternalDomain => self.update_local_external_domain(uri),
            ClassId::PlatformConfig => self.handle_config_update(uri),
        }
    }

    fn update_referencing_groups(&mut self, snap: &PolicySnapshot, uri: &Uri) {
        for epg in snap.groups_referencing(uri) {
            self.update_epg(&epg);
        }
    }

    pub fn rd_config_updated(&mut self, rd: &Uri) {
        self.domain_updated(ClassId::RoutingDomain, rd);
    }

    pub fn endpoint_updated(&mut self, uuid: Uuid) {
        if self.stopping {
            return;
        }
        self.update_endpoint(uuid);
    }

    pub fn service_updated(&mut self, uuid: Uuid) {
        if self.stopping {
            return;
        }
        self.update_service(uuid);
    }

    pub fn contract_updated(&mut self, uri: &Uri) {
        if self.stopping {
            return;
        }
        self.update_contract(uri);
    }

    pub fn config_updated(&mut self, uri: &Uri) {
        if self.stopping {
            return;
        }
        self.handle_config_update(uri);
    }

    pub fn remote_endpoint_updated(&mut self, key: &str) {
        if self.stopping {
            return;
        }
        self.update_remote_endpoint(key);
    }

    pub fn local_external_domain_updated(&mut self, uri: &Uri) {
        if self.stopping {
            return;
        }
        self.update_local_external_domain(uri);
    }

    pub fn lb_iface_updated(&mut self, uuid: Uuid) {
        if self.stopping {
            return;
        }
        debug!(self.log, "learning bridge interface updated"; "uuid" => %uuid);
        self.update_learning_bridge();
    }

    /// A port appeared (`Some`), was renumbered, or went away
    /// (`None`).
    pub fn port_status_update(&mut self, name: &str, port: Option<u32>) {
        if self.stopping {
            return;
        }

        let prev = match port {
            Some(p) => self.ports.set_port(name, p),
            None => self.ports.remove(name),
        };
        debug!(self.log, "port status update";
            "port" => name, "ofport" => ?port, "previous" => ?prev);

        let snap = self.policy.load();
        if name == self.cfg.encap_iface {
            self.init_platform_config(&snap);
            self.create_static_flows();
            for epg in snap.endpoint_groups.keys() {
                self.update_epg(epg);
            }
            for rd in snap.routing_domains.keys() {
                self.update_routing_domain(rd);
            }
            for key in snap.remote_endpoints.keys() {
                self.update_remote_endpoint(key);
            }
            self.update_group_table();
        } else {
            if self.cfg.uplink_iface.as_deref() == Some(name) {
                self.create_static_flows();
                for led in snap.local_external_domains.keys() {
                    self.update_local_external_domain(led);
                }
            }
            for uuid in snap.endpoints_by_iface(name) {
                self.update_endpoint(uuid);
            }
            for uuid in snap.services_by_iface(name) {
                self.update_service(uuid);
            }
            if !snap.lb_ifaces_by_iface(name).is_empty() {
                self.update_learning_bridge();
            }
        }
    }

    fn handle_config_update(&mut self, uri: &Uri) {
        debug!(self.log, "updating platform config"; "uri" => %uri);
        let snap = self.policy.load();
        self.init_platform_config(&snap);
        self.create_static_flows();
        self.update_group_table();
    }

    /// Parse the platform multicast tunnel destination and track its
    /// group address.
    fn init_platform_config(&mut self, snap: &PolicySnapshot) {
        self.mcast_tun_dst = None;
        let Some(pc) = &snap.platform else {
            return;
        };

        if let Some(s) = &pc.multicast_group_ip {
            match s.parse::<IpAddr>() {
                Ok(IpAddr::V4(ip)) => self.mcast_tun_dst = Some(ip),
                Ok(IpAddr::V6(_)) => {
                    error!(self.log, "multicast tunnel destination must be IPv4";
                        "ip" => s);
                }
                Err(e) => {
                    error!(self.log, "invalid multicast tunnel destination";
                        "ip" => s, "err" => %e);
                }
            }
        }
        self.update_multicast_list(pc.multicast_group_ip.as_deref(), &pc.uri);
    }

    // ================================================================
    // Connection and sync
    // ================================================================

    pub fn handle_connection(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.switch.begin_sync();
                self.resync_all();
                self.switch.end_sync();
                self.complete_sync();
            }
            ConnectionState::Disconnected => {
                self.switch.handle_connection(state);
            }
        }
    }

    /// Recompute every live scope.
    pub fn resync_all(&mut self) {
        info!(self.log, "recomputing every scope");
        let snap = self.policy.load();

        self.init_platform_config(&snap);
        self.create_static_flows();
        for rd in snap.routing_domains.keys() {
            self.update_routing_domain(rd);
        }
        for epg in snap.endpoint_groups.keys() {
            self.update_epg(epg);
        }
        for c in snap.contracts.keys() {
            self.update_contract(c);
        }
        for uuid in snap.endpoints.keys() {
            self.update_endpoint(*uuid);
        }
        for uuid in snap.services.keys() {
            self.update_service(*uuid);
        }
        for key in snap.remote_endpoints.keys() {
            self.update_remote_endpoint(key);
        }
        for led in snap.local_external_domains.keys() {
            self.update_local_external_domain(led);
        }
        self.update_learning_bridge();
        self.update_group_table();
    }

    /// Finish a sync: the multicast file is written once, with
    /// whatever the sync accumulated.
    pub fn complete_sync(&mut self) {
        info!(self.log, "sync complete";
            "flood_groups" => self.flood_groups.len(),
            "multicast_groups" => self.mcast.len());
        self.write_multicast_groups();
    }

    /// Drop ids whose object no longer exists.
    pub fn cleanup(&self) -> usize {
        let snap = self.policy.load();
        let per_epg = self.cfg.flood_scope == FloodScope::EndpointGroup;

        let fd = self.ids.collect_garbage(ns::FLOOD_DOMAIN, |k| {
            let u = Uri::from(k);
            snap.flood_domains.contains_key(&u)
                || (per_epg && snap.endpoint_groups.contains_key(&u))
        });
        let bd = self.ids.collect_garbage(ns::BRIDGE_DOMAIN, |k| {
            snap.bridge_domains.contains_key(&Uri::from(k))
        });
        let rd = self.ids.collect_garbage(ns::ROUTING_DOMAIN, |k| {
            snap.routing_domains.contains_key(&Uri::from(k))
        });
        let ct = self.ids.collect_garbage(ns::CT_ZONE, |k| {
            snap.routing_domains.contains_key(&Uri::from(k))
        });
        let ext = self.ids.collect_garbage(ns::EXTERNAL_NETWORK, |k| {
            snap.external_networks.contains_key(&Uri::from(k))
        });
        let cls = self.ids.collect_garbage(ns::CLASSIFIER_RULE, |k| {
            snap.classifiers.contains_key(&Uri::from(k))
        });
        let led = self.ids.collect_garbage(ns::LOCAL_EXT_DOMAIN, |k| {
            snap.local_external_domains.contains_key(&Uri::from(k))
        });
        let svc = self.ids.collect_garbage(ns::SERVICE, |k| {
            k.parse::<Uuid>().is_ok_and(|u| snap.services.contains_key(&u))
        });
        let stats = self.ids.collect_garbage(ns::SVC_STATS, |k| {
            service::stats_key_service(k)
                .is_some_and(|u| snap.services.contains_key(&u))
        });

        let total = fd + bd + rd + ct + ext + cls + led + svc + stats;
        debug!(self.log, "collected unused ids"; "count" => total);
        total
    }

    // ================================================================
    // Multicast groups
    // ================================================================

    /// Track the multicast address `ip` of object `uri`. Only an IP
    /// overlay with its tunnel port present joins groups.
    fn update_multicast_list(&mut self, ip: Option<&str>, uri: &Uri) {
        let env = self.env();
        let changed = match ip {
            Some(s) if env.is_ip_overlay() && env.tun_port.is_some() => {
                match s.parse::<IpAddr>() {
                    Ok(addr) if addr.is_multicast() => self.mcast.insert(addr, uri),
                    _ => {
                        warn!(self.log, "ignoring invalid multicast address";
                            "uri" => %uri, "ip" => s);
                        return;
                    }
                }
            }
            _ => self.mcast.remove(uri),
        };

        if changed {
            self.multicast_groups_updated();
        }
    }

    fn multicast_groups_updated(&mut self) {
        if !self.switch.is_syncing() {
            self.write_multicast_groups();
        }
    }

    fn write_multicast_groups(&self) {
        let Some(path) = &self.cfg.multicast_group_file else {
            return;
        };
        debug!(self.log, "writing multicast groups";
            "path" => %path.display(), "count" => self.mcast.len());
        if let Err(e) = write_multicast_groups(path, self.mcast.ips()) {
            error!(self.log, "could not write multicast groups"; "err" => %e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::EndpointGroup;
    use crate::model::FloodDomain;
    use crate::model::PlatformConfig;
    use gbp_api::EncapType;
    use gbp_flow::engine::MockSwitch;

    fn mgr(snap: PolicySnapshot, cfg: AgentConfig) -> FlowManager<MockSwitch> {
        let log = Logger::root(slog::Discard, o!());
        let mut m =
            FlowManager::new(&log, cfg, PolicyStore::from(snap), MockSwitch::new())
                .unwrap();
        m.start();
        m
    }

    fn vxlan_cfg() -> AgentConfig {
        AgentConfig {
            encap_type: Some(EncapType::Vxlan),
            encap_iface: "br0_vxlan0".to_string(),
            tunnel_remote_ip: "10.11.12.13".parse().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn forwarding_info_follows_flood_scope() {
        let mut snap = PolicySnapshot::default();
        let epg = Uri::from("/epg/1");
        let fd = Uri::from("/fd/1");
        snap.flood_domains.insert(fd.clone(), FloodDomain::default());
        snap.endpoint_groups.insert(
            epg.clone(),
            EndpointGroup {
                vnid: Some(0xA0A),
                flood_domain: Some(fd.clone()),
                ..Default::default()
            },
        );

        let m = mgr(snap.clone(), AgentConfig::default());
        let fwd = m.fwd_info(&snap, &epg).unwrap();
        assert_eq!(fwd.fgrp, Some(fd));
        assert_eq!(fwd.rd_id, 0);
        assert_ne!(fwd.fgrp_id, 0);

        let cfg = AgentConfig {
            flood_scope: FloodScope::EndpointGroup,
            ..Default::default()
        };
        let m = mgr(snap.clone(), cfg);
        assert_eq!(m.fwd_info(&snap, &epg).unwrap().fgrp, Some(epg.clone()));

        // No VNID, no forwarding.
        snap.endpoint_groups.get_mut(&epg).unwrap().vnid = None;
        assert!(m.fwd_info(&snap, &epg).is_none());
    }

    #[test]
    fn group_tunnel_destination() {
        let mut snap = PolicySnapshot::default();
        let epg = Uri::from("/epg/1");
        snap.endpoint_groups.insert(
            epg.clone(),
            EndpointGroup {
                vnid: Some(1),
                multicast_ip: Some("224.1.1.1".to_string()),
                ..Default::default()
            },
        );

        let m = mgr(snap.clone(), vxlan_cfg());
        assert_eq!(m.epg_tunnel_dst(&snap, &epg), Some("224.1.1.1".parse().unwrap()));

        snap.endpoint_groups.get_mut(&epg).unwrap().multicast_ip =
            Some("10.0.0.1".to_string());
        assert_eq!(
            m.epg_tunnel_dst(&snap, &epg),
            Some("10.11.12.13".parse().unwrap())
        );

        let m = mgr(snap.clone(), AgentConfig::default());
        assert_eq!(m.epg_tunnel_dst(&snap, &epg), None);
    }

    #[test]
    fn platform_multicast_destination() {
        let snap = PolicySnapshot {
            platform: Some(PlatformConfig {
                uri: Uri::from("/platform"),
                multicast_group_ip: Some("224.5.5.5".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut m = mgr(snap, vxlan_cfg());
        assert_eq!(m.mcast_tun_dst(), Some("224.5.5.5".parse().unwrap()));

        // The group is only joined once the tunnel port exists.
        assert!(m.multicast().is_empty());
        m.port_status_update("br0_vxlan0", Some(2));
        assert_eq!(m.multicast().len(), 1);

        m.policy().update(|p| {
            p.platform.as_mut().unwrap().multicast_group_ip = Some("ff05::1".into());
        });
        m.config_updated(&Uri::from("/platform"));
        assert_eq!(m.mcast_tun_dst(), None);
        assert_eq!(m.multicast().len(), 1);
    }

    #[test]
    fn stopped_manager_ignores_updates() {
        let mut m = mgr(PolicySnapshot::default(), AgentConfig::default());
        m.stop().unwrap();
        let before = m.switch().all_flows().len();
        m.port_status_update("veth0", Some(5));
        assert!(m.ports().find_port("veth0").is_none());
        assert_eq!(m.switch().all_flows().len(), before);
    }
}
