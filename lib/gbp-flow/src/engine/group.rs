// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Group table entries.

use super::flow::fmt_actions;
use super::flow::Action;
use core::fmt;
use core::fmt::Display;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum GroupType {
    /// Every bucket receives a copy of the packet.
    #[default]
    All,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Bucket {
    pub id: u32,
    pub actions: Vec<Action>,
}

/// A group entry. Buckets are kept sorted by id so that two groups
/// holding the same buckets compare equal regardless of the order the
/// buckets were added in.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct GroupEntry {
    pub id: u32,
    pub group_type: GroupType,
    buckets: Vec<Bucket>,
}

impl GroupEntry {
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Do both groups hold the same set of buckets?
    pub fn same_buckets(&self, other: &GroupEntry) -> bool {
        self.group_type == other.group_type && self.buckets == other.buckets
    }
}

impl Display for GroupEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "group_id={},type=all", self.id)?;
        for b in &self.buckets {
            write!(f, ",bucket=bucket_id:{},{}", b.id, fmt_actions(&b.actions))?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct GroupBuilder {
    id: u32,
    group_type: GroupType,
    buckets: Vec<Bucket>,
}

impl GroupBuilder {
    pub fn new(id: u32) -> Self {
        Self { id, ..Default::default() }
    }

    /// Add a bucket, replacing any bucket with the same id.
    pub fn bucket(&mut self, id: u32, actions: Vec<Action>) -> &mut Self {
        self.buckets.retain(|b| b.id != id);
        self.buckets.push(Bucket { id, actions });
        self
    }

    pub fn build(&self) -> GroupEntry {
        let mut buckets = self.buckets.clone();
        buckets.sort_by_key(|b| b.id);
        GroupEntry { id: self.id, group_type: self.group_type, buckets }
    }
}
