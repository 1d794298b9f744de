// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types shared between the flow engine, the GBP agent and the
//! administration tooling.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod encap;
pub mod mac;
pub mod policy;
pub mod uri;

pub use encap::*;
pub use mac::*;
pub use policy::*;
pub use uri::*;

/// The overall version of the API. Anytime a type in this crate is
/// added, removed, or modified in a way that changes its serialized
/// form, this number should increment.
pub const API_VERSION: u64 = 3;

/// The direction of a classifier rule, relative to the provider of
/// the contract it belongs to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    In,
    Out,
    Bidirectional,
}

impl core::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            "bidirectional" | "bi" => Ok(Direction::Bidirectional),
            _ => Err(format!("invalid direction: {}", s)),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dirstr = match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
            Direction::Bidirectional => "BI",
        };

        write!(f, "{}", dirstr)
    }
}
