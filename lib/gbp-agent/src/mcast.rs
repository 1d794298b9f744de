// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The multicast groups the switch must join.
//!
//! Several objects may name the same group address (the platform
//! config, endpoint groups, flood contexts). The map tracks which
//! objects hold each address so an address is only dropped once no
//! object names it. The active set is exported as
//! `{"multicast-groups": [..]}` for the tooling that joins them.

use gbp_api::Uri;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use slog::error;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum McastError {
    #[error("failed to access {path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },

    #[error("malformed multicast group file {path}: {err}")]
    Json { path: PathBuf, err: serde_json::Error },
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct McastFile {
    #[serde(rename = "multicast-groups", default)]
    groups: Vec<IpAddr>,
}

#[derive(Clone, Debug, Default)]
pub struct MulticastMap {
    groups: BTreeMap<IpAddr, BTreeSet<Uri>>,
}

impl MulticastMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `uri` with `ip`, dropping any address it held before.
    /// Returns whether the set of addresses changed.
    pub fn insert(&mut self, ip: IpAddr, uri: &Uri) -> bool {
        if self.groups.get(&ip).is_some_and(|uris| uris.contains(uri)) {
            return false;
        }

        let removed = self.remove(uri);
        let uris = self.groups.entry(ip).or_default();
        let added = uris.is_empty();
        uris.insert(uri.clone());
        removed || added
    }

    /// Drop whatever address `uri` held. Returns whether the set of
    /// addresses changed.
    pub fn remove(&mut self, uri: &Uri) -> bool {
        let Some(ip) = self
            .groups
            .iter()
            .find(|(_, uris)| uris.contains(uri))
            .map(|(ip, _)| *ip)
        else {
            return false;
        };

        let Some(uris) = self.groups.get_mut(&ip) else {
            return false;
        };
        uris.remove(uri);
        if uris.is_empty() {
            self.groups.remove(&ip);
            return true;
        }
        false
    }

    pub fn ips(&self) -> impl Iterator<Item = &IpAddr> {
        self.groups.keys()
    }

    pub fn holders(&self, ip: &IpAddr) -> Option<&BTreeSet<Uri>> {
        self.groups.get(ip)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

pub fn write_multicast_groups<'a, I>(path: &Path, ips: I) -> Result<(), McastError>
where
    I: IntoIterator<Item = &'a IpAddr>,
{
    let file = McastFile { groups: ips.into_iter().copied().collect() };
    let data = serde_json::to_string_pretty(&file)
        .map_err(|err| McastError::Json { path: path.to_path_buf(), err })?;
    std::fs::write(path, data)
        .map_err(|err| McastError::Io { path: path.to_path_buf(), err })
}

fn try_read(path: &Path) -> Result<BTreeSet<IpAddr>, McastError> {
    let data = std::fs::read_to_string(path)
        .map_err(|err| McastError::Io { path: path.to_path_buf(), err })?;
    let file: McastFile = serde_json::from_str(&data)
        .map_err(|err| McastError::Json { path: path.to_path_buf(), err })?;
    Ok(file.groups.into_iter().collect())
}

/// Read a multicast group file. An unreadable or malformed file is
/// logged and read as no groups.
pub fn read_multicast_groups(log: &Logger, path: &Path) -> BTreeSet<IpAddr> {
    match try_read(path) {
        Ok(groups) => groups,
        Err(e) => {
            error!(log, "could not read multicast groups"; "err" => %e);
            BTreeSet::new()
        }
    }
}
