// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Delivery of policy notifications to the flow manager.
//!
//! Notifications are queued per scope. A scope that is already queued
//! is not queued again: its recompute reads the latest policy anyway,
//! and the newer notification replaces the older one in place. Scopes
//! are recomputed in the order they were first queued.

use crate::engine::FlowManager;
use gbp_api::ClassId;
use gbp_api::Uri;
use gbp_flow::engine::SwitchConnection;
use gbp_flow::engine::switch::ConnectionState;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::TryRecvError;
use uuid::Uuid;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Notification {
    EgDomain(Uri),
    Domain(ClassId, Uri),
    RdConfig(Uri),
    Endpoint(Uuid),
    Service(Uuid),
    Contract(Uri),
    Config(Uri),
    PortStatus { name: String, port: Option<u32> },
    RemoteEndpoint(String),
    LocalExternalDomain(Uri),
    LbIface(Uuid),
    Connection(ConnectionState),
}

/// What a notification recomputes. Two notifications with the same
/// scope coalesce.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum Scope {
    EgDomain(Uri),
    Domain(ClassId, Uri),
    RdConfig(Uri),
    Endpoint(Uuid),
    Service(Uuid),
    Contract(Uri),
    Config(Uri),
    Port(String),
    RemoteEndpoint(String),
    LocalExternalDomain(Uri),
    LbIface(Uuid),
    Connection,
}

impl Notification {
    fn scope(&self) -> Scope {
        match self {
            Self::EgDomain(u) => Scope::EgDomain(u.clone()),
            Self::Domain(c, u) => Scope::Domain(*c, u.clone()),
            Self::RdConfig(u) => Scope::RdConfig(u.clone()),
            Self::Endpoint(id) => Scope::Endpoint(*id),
            Self::Service(id) => Scope::Service(*id),
            Self::Contract(u) => Scope::Contract(u.clone()),
            Self::Config(u) => Scope::Config(u.clone()),
            Self::PortStatus { name, .. } => Scope::Port(name.clone()),
            Self::RemoteEndpoint(k) => Scope::RemoteEndpoint(k.clone()),
            Self::LocalExternalDomain(u) => Scope::LocalExternalDomain(u.clone()),
            Self::LbIface(id) => Scope::LbIface(*id),
            Self::Connection(_) => Scope::Connection,
        }
    }
}

pub struct Dispatcher {
    log: Logger,
    order: VecDeque<Scope>,
    pending: BTreeMap<Scope, Notification>,
}

impl Dispatcher {
    pub fn new(log: &Logger) -> Self {
        Self {
            log: log.new(o!("component" => "dispatcher")),
            order: VecDeque::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Queue a notification. Returns `false` when it replaced one
    /// already queued for the same scope.
    pub fn notify(&mut self, n: Notification) -> bool {
        let scope = n.scope();
        if self.pending.insert(scope.clone(), n).is_some() {
            return false;
        }
        self.order.push_back(scope);
        true
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Recompute every queued scope. Returns how many ran.
    pub fn drain<C: SwitchConnection>(&mut self, mgr: &mut FlowManager<C>) -> usize {
        let mut count = 0;
        while let Some(scope) = self.order.pop_front() {
            let Some(n) = self.pending.remove(&scope) else {
                continue;
            };
            debug!(self.log, "dispatching"; "notification" => ?n);
            deliver(mgr, n);
            count += 1;
        }
        count
    }

    /// Deliver notifications until every sender is gone. Whatever
    /// arrived while a batch was being recomputed is coalesced into
    /// the next batch.
    pub fn run<C: SwitchConnection>(
        &mut self,
        mgr: &mut FlowManager<C>,
        rx: &Receiver<Notification>,
    ) -> usize {
        let mut total = 0;
        while let Ok(n) = rx.recv() {
            self.notify(n);
            let closed = loop {
                match rx.try_recv() {
                    Ok(n) => {
                        self.notify(n);
                    }
                    Err(TryRecvError::Empty) => break false,
                    Err(TryRecvError::Disconnected) => break true,
                }
            };
            total += self.drain(mgr);
            if closed {
                break;
            }
        }
        info!(self.log, "notification channel closed"; "dispatched" => total);
        total
    }
}

fn deliver<C: SwitchConnection>(mgr: &mut FlowManager<C>, n: Notification) {
    match n {
        Notification::EgDomain(u) => mgr.eg_domain_updated(&u),
        Notification::Domain(c, u) => mgr.domain_updated(c, &u),
        Notification::RdConfig(u) => mgr.rd_config_updated(&u),
        Notification::Endpoint(id) => mgr.endpoint_updated(id),
        Notification::Service(id) => mgr.service_updated(id),
        Notification::Contract(u) => mgr.contract_updated(&u),
        Notification::Config(u) => mgr.config_updated(&u),
        Notification::PortStatus { name, port } => mgr.port_status_update(&name, port),
        Notification::RemoteEndpoint(k) => mgr.remote_endpoint_updated(&k),
        Notification::LocalExternalDomain(u) => mgr.local_external_domain_updated(&u),
        Notification::LbIface(id) => mgr.lb_iface_updated(id),
        Notification::Connection(state) => mgr.handle_connection(state),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg::AgentConfig;
    use crate::model::PolicySnapshot;
    use crate::model::PolicyStore;
    use gbp_flow::engine::MockSwitch;
    use gbp_flow::engine::PortMapper;
    use std::sync::mpsc::channel;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn mgr() -> FlowManager<MockSwitch> {
        let mut m = FlowManager::new(
            &log(),
            AgentConfig::default(),
            PolicyStore::from(PolicySnapshot::default()),
            MockSwitch::new(),
        )
        .unwrap();
        m.start();
        m
    }

    #[test]
    fn same_scope_coalesces() {
        let mut d = Dispatcher::new(&log());
        assert!(d.notify(Notification::Endpoint(Uuid::from_u128(1))));
        assert!(d.notify(Notification::Endpoint(Uuid::from_u128(2))));
        assert!(!d.notify(Notification::Endpoint(Uuid::from_u128(1))));
        assert!(d.notify(Notification::PortStatus { name: "veth0".into(), port: Some(1) }));
        assert!(!d.notify(Notification::PortStatus { name: "veth0".into(), port: Some(7) }));
        assert_eq!(d.pending(), 3);

        let mut m = mgr();
        assert_eq!(d.drain(&mut m), 3);
        assert_eq!(d.pending(), 0);
        // The last port status won.
        assert_eq!(m.ports().find_port("veth0"), Some(7));
    }

    #[test]
    fn run_until_closed() {
        let (tx, rx) = channel();
        for p in [1, 2, 3] {
            tx.send(Notification::PortStatus { name: "veth0".into(), port: Some(p) }).unwrap();
        }
        tx.send(Notification::PortStatus { name: "veth1".into(), port: Some(4) }).unwrap();
        drop(tx);

        let mut m = mgr();
        let mut d = Dispatcher::new(&log());
        assert_eq!(d.run(&mut m, &rx), 2);
        assert_eq!(m.ports().find_port("veth0"), Some(3));
        assert_eq!(m.ports().find_port("veth1"), Some(4));
    }
}
