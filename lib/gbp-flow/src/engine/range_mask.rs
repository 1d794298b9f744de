// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Decompose an inclusive range of 16-bit values into the smallest
//! list of value/mask pairs whose union matches exactly that range.
//!
//! OpenFlow can only match a field against a value under a bitmask,
//! so port ranges in classifier rules and VLAN ranges on learning
//! bridge trunks are expanded into one flow per pair.

use core::fmt;
use core::fmt::Display;

/// A single masked value. A field `f` matches when
/// `f & mask == value`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Mask {
    pub value: u16,
    pub mask: u16,
}

impl Mask {
    pub fn matches(&self, v: u16) -> bool {
        v & self.mask == self.value
    }
}

impl Display for Mask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:04x}/0x{:04x}", self.value, self.mask)
    }
}

pub type MaskList = Vec<Mask>;

/// Check every bit above `pos`, wildcard `pos` and everything below
/// it. A negative `pos` produces an exact match.
fn create_mask(base: u16, pos: i32) -> Mask {
    let mask = if pos >= 0 {
        ((0xFFFF_u32 << (pos + 1)) & 0xFFFF) as u16
    } else {
        0xFFFF
    };
    Mask { value: base & mask, mask }
}

fn bit(v: u16, pos: i32) -> bool {
    v & (1 << pos) != 0
}

/// Compute the masks covering `[start, end]`.
///
/// With neither bound there is nothing to match on and the list is
/// empty. With a single bound the result is an exact match on that
/// bound. Reversed bounds are swapped.
pub fn get_masks(start: Option<u16>, end: Option<u16>) -> MaskList {
    let (start, end) = match (start, end) {
        (None, None) => return vec![],
        (Some(x), None) | (None, Some(x)) => return vec![create_mask(x, -1)],
        (Some(s), Some(e)) if s <= e => (s, e),
        (Some(s), Some(e)) => (e, s),
    };

    if start == end {
        return vec![create_mask(start, -1)];
    }

    // Highest bit where the bounds differ. Everything above it is
    // shared and stays checked in every mask.
    let mut l2: i32 = 15;
    while l2 >= 0 && bit(start, l2) == bit(end, l2) {
        l2 -= 1;
    }

    // Lowest set bit of `start` below `l2`.
    let mut l1: i32 = 0;
    while l1 < l2 && !bit(start, l1) {
        l1 += 1;
    }

    // Top of the run of trailing ones in `end`, bounded by `l2`.
    let mut lto: i32 = -1;
    while lto < l2 && bit(end, lto + 1) {
        lto += 1;
    }

    if l1 == l2 && l2 == lto {
        return vec![create_mask(start, l2)];
    }

    let mut masks = vec![create_mask(start, l1 - 1)];

    for p in (l1 + 1)..l2 {
        if !bit(start, p) {
            masks.push(create_mask(start | (1 << p), p - 1));
        }
    }

    for p in ((lto + 1)..l2).rev() {
        if bit(end, p) {
            masks.push(create_mask(end & !(1 << p), p - 1));
        }
    }

    masks.push(create_mask(end, if lto == l2 { lto - 1 } else { lto }));
    masks
}
