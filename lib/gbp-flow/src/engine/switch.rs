// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The switch manager: holds the expected state of every table and
//! group, and pushes edits to the switch connection as that state
//! changes.
//!
//! Edits are fire-and-forget. A rejected edit is logged and otherwise
//! forgotten; the next full reconcile (on reconnect) brings the switch
//! back in line with the expected state.

use super::flow::FlowEntry;
use super::flow::TableId;
use super::group::GroupEntry;
use super::table_state::diff_flows;
use super::table_state::diff_group;
use super::table_state::diff_groups;
use super::table_state::EditKind;
use super::table_state::FlowEdit;
use super::table_state::GroupEdit;
use super::table_state::ReconcileIgnore;
use super::table_state::TableState;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("switch connection is down")]
    NotConnected,

    #[error("switch rejected {kind:?} for table {table}: {msg}")]
    FlowRejected { kind: EditKind, table: TableId, msg: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// The connection to a switch. Implementations issue edits without
/// waiting for them to be acknowledged.
pub trait SwitchConnection {
    fn is_connected(&self) -> bool;
    fn apply_flows(&mut self, edits: &[FlowEdit]) -> Result<(), SwitchError>;
    fn apply_groups(&mut self, edits: &[GroupEdit]) -> Result<(), SwitchError>;
    fn dump_flows(&mut self) -> Result<Vec<FlowEntry>, SwitchError>;
    fn dump_groups(&mut self) -> Result<Vec<GroupEntry>, SwitchError>;
}

/// A switch that lives in memory. Used by the admin tool to render the
/// synthesized pipeline, and by tests.
#[derive(Debug, Default)]
pub struct MockSwitch {
    connected: bool,
    flows: BTreeMap<(TableId, super::flow::FlowKey), FlowEntry>,
    groups: BTreeMap<u32, GroupEntry>,
    flow_log: Vec<FlowEdit>,
    group_log: Vec<GroupEdit>,
    rejected: Option<TableId>,
}

impl MockSwitch {
    pub fn new() -> Self {
        Self { connected: true, ..Default::default() }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Refuse any batch touching `table`.
    pub fn reject_table(&mut self, table: Option<TableId>) {
        self.rejected = table;
    }

    pub fn flows(&self) -> Vec<FlowEntry> {
        self.flows.values().cloned().collect()
    }

    pub fn table(&self, table: TableId) -> Vec<FlowEntry> {
        self.flows.values().filter(|f| f.table == table).cloned().collect()
    }

    pub fn groups(&self) -> Vec<GroupEntry> {
        self.groups.values().cloned().collect()
    }

    pub fn group(&self, id: u32) -> Option<&GroupEntry> {
        self.groups.get(&id)
    }

    /// Every flow edit received since the last call.
    pub fn take_flow_log(&mut self) -> Vec<FlowEdit> {
        core::mem::take(&mut self.flow_log)
    }

    /// Every group edit received since the last call.
    pub fn take_group_log(&mut self) -> Vec<GroupEdit> {
        core::mem::take(&mut self.group_log)
    }

    /// Install state behind the manager's back, as a previous agent
    /// instance would have.
    pub fn preload(&mut self, flows: Vec<FlowEntry>, groups: Vec<GroupEntry>) {
        for f in flows {
            self.flows.insert((f.table, f.key()), f);
        }
        for g in groups {
            self.groups.insert(g.id, g);
        }
    }
}

impl SwitchConnection for MockSwitch {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn apply_flows(&mut self, edits: &[FlowEdit]) -> Result<(), SwitchError> {
        if !self.connected {
            return Err(SwitchError::NotConnected);
        }

        if let Some(bad) = edits.iter().find(|e| Some(e.entry().table) == self.rejected) {
            return Err(SwitchError::FlowRejected {
                kind: bad.kind(),
                table: bad.entry().table,
                msg: "table is read-only".to_string(),
            });
        }

        for edit in edits {
            let e = edit.entry();
            let key = (e.table, e.key());
            match edit {
                FlowEdit::Add(_) | FlowEdit::Mod(_) => {
                    self.flows.insert(key, e.clone());
                }
                FlowEdit::Del(_) => {
                    self.flows.remove(&key);
                }
            }
            self.flow_log.push(edit.clone());
        }
        Ok(())
    }

    fn apply_groups(&mut self, edits: &[GroupEdit]) -> Result<(), SwitchError> {
        if !self.connected {
            return Err(SwitchError::NotConnected);
        }

        for edit in edits {
            match edit {
                GroupEdit::Add(g) | GroupEdit::Mod(g) => {
                    self.groups.insert(g.id, g.clone());
                }
                GroupEdit::Del(id) => {
                    self.groups.remove(id);
                }
            }
            self.group_log.push(edit.clone());
        }
        Ok(())
    }

    fn dump_flows(&mut self) -> Result<Vec<FlowEntry>, SwitchError> {
        if !self.connected {
            return Err(SwitchError::NotConnected);
        }
        Ok(self.flows())
    }

    fn dump_groups(&mut self) -> Result<Vec<GroupEntry>, SwitchError> {
        if !self.connected {
            return Err(SwitchError::NotConnected);
        }
        Ok(self.groups())
    }
}

pub struct SwitchManager<C: SwitchConnection> {
    log: Logger,
    conn: C,
    tables: Vec<TableState>,
    groups: BTreeMap<u32, GroupEntry>,
    syncing: bool,
    ignore: ReconcileIgnore,
}

impl<C: SwitchConnection> SwitchManager<C> {
    pub fn new(log: &Logger, conn: C, num_tables: u8, ignore: ReconcileIgnore) -> Self {
        let tables = (0..num_tables).map(TableState::new).collect();
        Self {
            log: log.new(o!("component" => "switch-manager")),
            conn,
            tables,
            groups: BTreeMap::new(),
            syncing: false,
            ignore,
        }
    }

    pub fn conn(&self) -> &C {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    fn send_flows(&mut self, edits: Vec<FlowEdit>) {
        if edits.is_empty() || self.syncing || !self.conn.is_connected() {
            return;
        }

        if let Err(e) = self.conn.apply_flows(&edits) {
            error!(self.log, "failed to apply flow edits";
                "count" => edits.len(), "err" => %e);
        }
    }

    fn send_groups(&mut self, edits: Vec<GroupEdit>) {
        if edits.is_empty() || self.syncing || !self.conn.is_connected() {
            return;
        }

        if let Err(e) = self.conn.apply_groups(&edits) {
            error!(self.log, "failed to apply group edits";
                "count" => edits.len(), "err" => %e);
        }
    }

    /// Replace the flows `obj_id` owns in `table`.
    pub fn write_flow(&mut self, obj_id: &str, table: TableId, entries: Vec<FlowEntry>) {
        let Some(ts) = self.tables.get_mut(table as usize) else {
            error!(self.log, "write to unknown table"; "table" => table);
            return;
        };

        let update = ts.apply(obj_id, entries);
        for (key, holder) in &update.conflicts {
            warn!(self.log, "duplicate flow from a different object";
                "table" => table,
                "priority" => key.0,
                "match" => %key.1,
                "object" => obj_id,
                "holder" => holder);
        }
        self.send_flows(update.edits);
    }

    pub fn clear_flows(&mut self, obj_id: &str, table: TableId) {
        self.write_flow(obj_id, table, vec![]);
    }

    /// Set the expected state of a group. A group without buckets is
    /// removed from the switch.
    pub fn write_group(&mut self, group: GroupEntry) {
        let edit = diff_group(Some(&group), self.groups.get(&group.id));
        if group.is_empty() {
            self.groups.remove(&group.id);
        } else {
            self.groups.insert(group.id, group);
        }
        if let Some(edit) = edit {
            self.send_groups(vec![edit]);
        }
    }

    pub fn delete_group(&mut self, id: u32) {
        if self.groups.remove(&id).is_some() {
            self.send_groups(vec![GroupEdit::Del(id)]);
        }
    }

    pub fn group(&self, id: u32) -> Option<&GroupEntry> {
        self.groups.get(&id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupEntry> {
        self.groups.values()
    }

    /// The expected flows of one table.
    pub fn flows(&self, table: TableId) -> Vec<FlowEntry> {
        self.tables
            .get(table as usize)
            .map(|t| t.snapshot())
            .unwrap_or_default()
    }

    /// The expected flows of one object in one table.
    pub fn flows_for(&self, obj_id: &str, table: TableId) -> Vec<FlowEntry> {
        self.tables
            .get(table as usize)
            .map(|t| t.flows_for(obj_id))
            .unwrap_or_default()
    }

    /// The expected flows of every table, in table order.
    pub fn all_flows(&self) -> Vec<FlowEntry> {
        self.tables.iter().flat_map(|t| t.snapshot()).collect()
    }

    pub fn for_each_cookie_match<F>(&self, table: TableId, cookie: u64, f: F)
    where
        F: FnMut(&FlowEntry),
    {
        if let Some(t) = self.tables.get(table as usize) {
            t.for_each_cookie_match(cookie, f);
        }
    }

    /// Stop sending edits; the expected state keeps accumulating until
    /// [`Self::end_sync`].
    pub fn begin_sync(&mut self) {
        self.syncing = true;
    }

    /// Reconcile the switch against everything written since
    /// [`Self::begin_sync`].
    pub fn end_sync(&mut self) {
        self.syncing = false;
        self.reconcile();
    }

    pub fn handle_connection(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                info!(self.log, "switch connected");
                if !self.syncing {
                    self.reconcile();
                }
            }
            ConnectionState::Disconnected => {
                info!(self.log, "switch disconnected");
            }
        }
    }

    /// Dump the switch and push the edits bringing it in line with the
    /// expected state, less the edit kinds configured to be ignored.
    pub fn reconcile(&mut self) {
        if !self.conn.is_connected() {
            debug!(self.log, "not connected, deferring reconcile");
            return;
        }

        let actual_flows = match self.conn.dump_flows() {
            Ok(f) => f,
            Err(e) => {
                error!(self.log, "flow dump failed"; "err" => %e);
                return;
            }
        };
        let actual_groups = match self.conn.dump_groups() {
            Ok(g) => g,
            Err(e) => {
                error!(self.log, "group dump failed"; "err" => %e);
                return;
            }
        };

        let ignore = self.ignore;
        let flow_edits: Vec<FlowEdit> = diff_flows(&self.all_flows(), &actual_flows)
            .into_iter()
            .filter(|e| !ignore.ignores(e.kind()))
            .collect();

        let actual: BTreeMap<u32, GroupEntry> =
            actual_groups.into_iter().map(|g| (g.id, g)).collect();
        let group_edits: Vec<GroupEdit> = diff_groups(&self.groups, &actual)
            .into_iter()
            .filter(|e| !ignore.ignores(e.kind()))
            .collect();

        info!(self.log, "reconciled switch state";
            "flow_edits" => flow_edits.len(),
            "group_edits" => group_edits.len());

        // Groups first so that flows referring to them land after.
        self.send_groups(group_edits);
        self.send_flows(flow_edits);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::flow::Action;
    use crate::engine::flow::FlowBuilder;
    use crate::engine::group::GroupBuilder;

    fn mgr() -> SwitchManager<MockSwitch> {
        let log = Logger::root(slog::Discard, o!());
        SwitchManager::new(&log, MockSwitch::new(), 14, ReconcileIgnore::empty())
    }

    #[test]
    fn write_and_clear() {
        let mut m = mgr();
        let f = FlowBuilder::new().priority(10).reg(4, 1).output(2).build();
        m.write_flow("ep", 4, vec![f]);
        assert_eq!(m.conn().table(4).len(), 1);
        assert_eq!(m.flows(4).len(), 1);

        m.clear_flows("ep", 4);
        assert!(m.conn().table(4).is_empty());
        assert!(m.flows(4).is_empty());
    }

    #[test]
    fn empty_group_is_deleted() {
        let mut m = mgr();
        m.write_group(GroupBuilder::new(3).build());
        assert!(m.conn().groups().is_empty());

        m.write_group(GroupBuilder::new(3).bucket(1, vec![Action::Output(1)]).build());
        assert_eq!(m.conn().groups().len(), 1);

        m.write_group(GroupBuilder::new(3).build());
        assert!(m.conn().groups().is_empty());
        assert_eq!(
            m.conn_mut().take_group_log(),
            vec![
                GroupEdit::Add(GroupBuilder::new(3).bucket(1, vec![Action::Output(1)]).build()),
                GroupEdit::Del(3),
            ]
        );
    }

    #[test]
    fn reconcile_deletes_stale() {
        let mut m = mgr();
        let mut stale = FlowBuilder::new().priority(99).reg(4, 9).build();
        stale.table = 4;
        m.conn_mut().preload(vec![stale], vec![]);

        m.begin_sync();
        let f = FlowBuilder::new().priority(10).reg(4, 1).output(2).build();
        m.write_flow("ep", 4, vec![f]);
        assert!(m.conn().flow_log_is_empty());
        m.end_sync();

        let flows = m.conn().table(4);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].priority, 10);

        // Nothing left to do.
        m.conn_mut().take_flow_log();
        m.reconcile();
        assert!(m.conn_mut().take_flow_log().is_empty());
    }

    #[test]
    fn reconcile_honors_ignore() {
        let log = Logger::root(slog::Discard, o!());
        let mut m = SwitchManager::new(
            &log,
            MockSwitch::new(),
            14,
            ReconcileIgnore::DEL,
        );
        let mut stale = FlowBuilder::new().priority(99).reg(4, 9).build();
        stale.table = 4;
        m.conn_mut().preload(vec![stale], vec![]);
        m.reconcile();
        assert_eq!(m.conn().table(4).len(), 1);
    }

    #[test]
    fn disconnected_edits_replay() {
        let mut m = mgr();
        m.conn_mut().set_connected(false);
        let f = FlowBuilder::new().priority(10).reg(4, 1).output(2).build();
        m.write_flow("ep", 4, vec![f]);
        assert!(m.conn().table(4).is_empty());

        m.conn_mut().set_connected(true);
        m.handle_connection(ConnectionState::Connected);
        assert_eq!(m.conn().table(4).len(), 1);
    }

    #[test]
    fn rejected_edits_heal_on_reconcile() {
        let mut m = mgr();
        m.conn_mut().reject_table(Some(4));
        let f = FlowBuilder::new().priority(10).reg(4, 1).output(2).build();
        m.write_flow("ep", 4, vec![f]);
        assert!(m.conn().table(4).is_empty());

        m.conn_mut().reject_table(None);
        m.reconcile();
        assert_eq!(m.conn().table(4).len(), 1);
    }

    impl MockSwitch {
        fn flow_log_is_empty(&self) -> bool {
            self.flow_log.is_empty()
        }
    }
}
