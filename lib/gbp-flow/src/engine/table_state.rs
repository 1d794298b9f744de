// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The expected state of each flow table, and the diff between
//! expected and actual switch state.
//!
//! Every flow is written on behalf of an owning object (an endpoint
//! UUID, an EPG URI, and so on). Rewriting an object's flows replaces
//! its previous set and produces the edits needed to move the switch
//! from the old set to the new one. When two objects ask for the same
//! (priority, match), the first keeps the switch entry and the second
//! waits in a queue until the first withdraws it.

use super::flow::FlowEntry;
use super::flow::FlowKey;
use super::flow::TableId;
use super::group::GroupEntry;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum EditKind {
    Add,
    Mod,
    Del,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FlowEdit {
    Add(FlowEntry),
    Mod(FlowEntry),
    Del(FlowEntry),
}

impl FlowEdit {
    pub fn kind(&self) -> EditKind {
        match self {
            Self::Add(_) => EditKind::Add,
            Self::Mod(_) => EditKind::Mod,
            Self::Del(_) => EditKind::Del,
        }
    }

    pub fn entry(&self) -> &FlowEntry {
        match self {
            Self::Add(e) | Self::Mod(e) | Self::Del(e) => e,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GroupEdit {
    Add(GroupEntry),
    Mod(GroupEntry),
    Del(u32),
}

impl GroupEdit {
    pub fn kind(&self) -> EditKind {
        match self {
            Self::Add(_) => EditKind::Add,
            Self::Mod(_) => EditKind::Mod,
            Self::Del(_) => EditKind::Del,
        }
    }

    pub fn group_id(&self) -> u32 {
        match self {
            Self::Add(g) | Self::Mod(g) => g.id,
            Self::Del(id) => *id,
        }
    }
}

bitflags::bitflags! {
    /// Edit kinds to hold back when reconciling against a switch that
    /// was programmed by a previous agent instance.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ReconcileIgnore: u8 {
        const ADD = 0x1;
        const MOD = 0x2;
        const DEL = 0x4;
    }
}

impl ReconcileIgnore {
    pub fn ignores(&self, kind: EditKind) -> bool {
        match kind {
            EditKind::Add => self.contains(Self::ADD),
            EditKind::Mod => self.contains(Self::MOD),
            EditKind::Del => self.contains(Self::DEL),
        }
    }
}

impl core::str::FromStr for ReconcileIgnore {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(Self::ADD),
            "mod" | "modify" => Ok(Self::MOD),
            "del" | "delete" => Ok(Self::DEL),
            _ => Err(format!("invalid reconcile operation: {s}")),
        }
    }
}

/// The result of replacing one object's flows in a table.
#[derive(Debug, Default)]
pub struct TableUpdate {
    pub edits: Vec<FlowEdit>,
    /// Keys this object asked for that are held by another object with
    /// different actions, along with the holder.
    pub conflicts: Vec<(FlowKey, String)>,
}

#[derive(Debug, Default)]
pub struct TableState {
    id: TableId,
    /// The flows each object currently owns.
    by_obj: BTreeMap<String, BTreeMap<FlowKey, FlowEntry>>,
    /// Every object asking for a key, in arrival order. The front is
    /// the installed entry.
    by_key: BTreeMap<FlowKey, VecDeque<(String, FlowEntry)>>,
    cookies: BTreeMap<u64, BTreeSet<FlowKey>>,
}

impl TableState {
    pub fn new(id: TableId) -> Self {
        Self { id, ..Default::default() }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    /// Replace the flows owned by `obj_id` with `entries`, returning
    /// the switch edits this implies.
    pub fn apply(&mut self, obj_id: &str, entries: Vec<FlowEntry>) -> TableUpdate {
        let mut update = TableUpdate::default();
        let mut new: BTreeMap<FlowKey, FlowEntry> = BTreeMap::new();
        for mut e in entries {
            e.table = self.id;
            new.insert(e.key(), e);
        }

        let old = self.by_obj.remove(obj_id).unwrap_or_default();
        for (key, old_entry) in &old {
            if !new.contains_key(key) {
                self.withdraw(obj_id, key, old_entry, &mut update.edits);
            }
        }

        for (key, entry) in &new {
            self.request(obj_id, key, entry, &mut update);
        }

        if !new.is_empty() {
            self.by_obj.insert(obj_id.to_string(), new);
        }

        update
    }

    /// Withdraw every flow owned by `obj_id`.
    pub fn clear(&mut self, obj_id: &str) -> Vec<FlowEdit> {
        self.apply(obj_id, vec![]).edits
    }

    fn withdraw(
        &mut self,
        obj_id: &str,
        key: &FlowKey,
        old_entry: &FlowEntry,
        edits: &mut Vec<FlowEdit>,
    ) {
        let Some(queue) = self.by_key.get_mut(key) else {
            return;
        };
        let Some(pos) = queue.iter().position(|(o, _)| o == obj_id) else {
            return;
        };
        queue.remove(pos);

        if pos != 0 {
            return;
        }

        match queue.front().map(|(_, e)| e.clone()) {
            None => {
                self.by_key.remove(key);
                uncookie(&mut self.cookies, old_entry);
                edits.push(FlowEdit::Del(old_entry.clone()));
            }
            Some(next) => {
                if next.differs(old_entry) {
                    uncookie(&mut self.cookies, old_entry);
                    cookie(&mut self.cookies, &next);
                    edits.push(FlowEdit::Mod(next));
                }
            }
        }
    }

    fn request(
        &mut self,
        obj_id: &str,
        key: &FlowKey,
        entry: &FlowEntry,
        update: &mut TableUpdate,
    ) {
        let queue = self.by_key.entry(key.clone()).or_default();

        if let Some(pos) = queue.iter().position(|(o, _)| o == obj_id) {
            let prev = core::mem::replace(&mut queue[pos].1, entry.clone());
            if pos == 0 && prev.differs(entry) {
                uncookie(&mut self.cookies, &prev);
                cookie(&mut self.cookies, entry);
                update.edits.push(FlowEdit::Mod(entry.clone()));
            }
            return;
        }

        let holder = queue.front().map(|(o, e)| (o.clone(), e.differs(entry)));
        queue.push_back((obj_id.to_string(), entry.clone()));
        match holder {
            None => {
                cookie(&mut self.cookies, entry);
                update.edits.push(FlowEdit::Add(entry.clone()));
            }
            Some((holder, true)) => {
                update.conflicts.push((key.clone(), holder));
            }
            Some((_, false)) => {}
        }
    }

    /// The flows owned by `obj_id`, in key order.
    pub fn flows_for(&self, obj_id: &str) -> Vec<FlowEntry> {
        self.by_obj
            .get(obj_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The flows that should be installed in the switch, in key order.
    pub fn snapshot(&self) -> Vec<FlowEntry> {
        self.by_key
            .values()
            .filter_map(|q| q.front().map(|(_, e)| e.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Call `f` with each installed flow carrying `cookie`.
    pub fn for_each_cookie_match<F>(&self, cookie: u64, mut f: F)
    where
        F: FnMut(&FlowEntry),
    {
        let Some(keys) = self.cookies.get(&cookie) else {
            return;
        };
        for key in keys {
            if let Some((_, e)) = self.by_key.get(key).and_then(|q| q.front()) {
                f(e);
            }
        }
    }

    pub fn cookies(&self) -> impl Iterator<Item = &u64> {
        self.cookies.keys()
    }
}

fn cookie(map: &mut BTreeMap<u64, BTreeSet<FlowKey>>, e: &FlowEntry) {
    map.entry(e.cookie).or_default().insert(e.key());
}

fn uncookie(map: &mut BTreeMap<u64, BTreeSet<FlowKey>>, e: &FlowEntry) {
    if let Some(keys) = map.get_mut(&e.cookie) {
        keys.remove(&e.key());
        if keys.is_empty() {
            map.remove(&e.cookie);
        }
    }
}

/// Compute the edits moving `actual` to `expected`.
///
/// Flows are matched up by (table, priority, match). Adds and mods come
/// first in key order, followed by deletes.
pub fn diff_flows(expected: &[FlowEntry], actual: &[FlowEntry]) -> Vec<FlowEdit> {
    let exp = index_flows(expected);
    let act = index_flows(actual);

    let mut edits = vec![];
    for (k, e) in &exp {
        match act.get(k) {
            None => edits.push(FlowEdit::Add((*e).clone())),
            Some(a) if a.differs(e) => edits.push(FlowEdit::Mod((*e).clone())),
            Some(_) => {}
        }
    }

    for (k, a) in &act {
        if !exp.contains_key(k) {
            edits.push(FlowEdit::Del((*a).clone()));
        }
    }

    edits
}

fn index_flows(flows: &[FlowEntry]) -> BTreeMap<(TableId, FlowKey), &FlowEntry> {
    flows.iter().map(|f| ((f.table, f.key()), f)).collect()
}

/// Compute the edit, if any, moving a group from `actual` to
/// `expected`. An expected group without buckets is deleted rather
/// than installed empty.
pub fn diff_group(
    expected: Option<&GroupEntry>,
    actual: Option<&GroupEntry>,
) -> Option<GroupEdit> {
    let expected = expected.filter(|g| !g.is_empty());
    match (expected, actual) {
        (None, None) => None,
        (None, Some(a)) => Some(GroupEdit::Del(a.id)),
        (Some(e), None) => Some(GroupEdit::Add(e.clone())),
        (Some(e), Some(a)) if !e.same_buckets(a) => Some(GroupEdit::Mod(e.clone())),
        (Some(_), Some(_)) => None,
    }
}

/// Compute the group edits moving `actual` to `expected`.
pub fn diff_groups(
    expected: &BTreeMap<u32, GroupEntry>,
    actual: &BTreeMap<u32, GroupEntry>,
) -> Vec<GroupEdit> {
    let ids: BTreeSet<u32> =
        expected.keys().chain(actual.keys()).copied().collect();
    ids.into_iter()
        .filter_map(|id| diff_group(expected.get(&id), actual.get(&id)))
        .collect()
}
