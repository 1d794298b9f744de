// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;

/// Resolve interface names to switch port numbers and back.
pub trait PortMapper {
    fn find_port(&self, name: &str) -> Option<u32>;
    fn find_name(&self, port: u32) -> Option<&str>;
}

/// A port mapper fed by port status events.
#[derive(Clone, Debug, Default)]
pub struct PortMap {
    by_name: BTreeMap<String, u32>,
    by_port: BTreeMap<u32, String>,
}

impl PortMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `name` to `port`, returning the port it previously had.
    pub fn set_port(&mut self, name: &str, port: u32) -> Option<u32> {
        let prev = self.by_name.insert(name.to_string(), port);
        if let Some(p) = prev {
            self.by_port.remove(&p);
        }
        if let Some(other) = self.by_port.insert(port, name.to_string()) {
            if other != name {
                self.by_name.remove(&other);
            }
        }
        prev
    }

    pub fn remove(&mut self, name: &str) -> Option<u32> {
        let port = self.by_name.remove(name)?;
        self.by_port.remove(&port);
        Some(port)
    }
}

impl PortMapper for PortMap {
    fn find_port(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    fn find_name(&self, port: u32) -> Option<&str> {
        self.by_port.get(&port).map(|s| s.as_str())
    }
}
