// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The Group-Based Policy agent of an integration bridge: the policy
//! model, the agent configuration, and the engine compiling policy
//! into the flows and groups of the switch.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod cfg;
pub mod dispatch;
pub mod engine;
pub mod mcast;
pub mod model;
