// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The switch-facing half of the agent: flow and group values, the
//! expected table state, and reconciliation with the switch.

pub mod flow;
pub mod group;
pub mod id_gen;
pub mod port_mapper;
pub mod range_mask;
pub mod switch;
pub mod table_state;

pub use flow::FlowBuilder;
pub use flow::FlowEntry;
pub use flow::TableId;
pub use group::GroupBuilder;
pub use group::GroupEntry;
pub use id_gen::IdGenerator;
pub use port_mapper::PortMap;
pub use port_mapper::PortMapper;
pub use switch::MockSwitch;
pub use switch::SwitchConnection;
pub use switch::SwitchManager;
