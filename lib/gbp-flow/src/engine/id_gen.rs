// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Stable small integer ids for policy objects and string keys.
//!
//! Ids are allocated per namespace, start at 1, and are never reused
//! while the namespace lives. Each namespace persists to
//! `<dir>/<namespace>.json` so that VNIDs and cookies survive a
//! restart of the agent.

use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

#[derive(Debug, thiserror::Error)]
pub enum IdGenError {
    #[error("failed to access {path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },

    #[error("malformed id file {path}: {err}")]
    Json { path: PathBuf, err: serde_json::Error },
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct Namespace {
    next: u32,
    ids: BTreeMap<String, u32>,
    #[serde(skip)]
    dirty: bool,
}

impl Namespace {
    fn new() -> Self {
        Self { next: 1, ..Default::default() }
    }
}

pub struct IdGenerator {
    log: Logger,
    dir: Option<PathBuf>,
    namespaces: Mutex<BTreeMap<String, Namespace>>,
}

impl IdGenerator {
    /// Create a generator persisting to `dir`, or only in memory when
    /// `dir` is `None`.
    pub fn new(log: &Logger, dir: Option<PathBuf>) -> Self {
        Self {
            log: log.new(o!("component" => "id-gen")),
            dir,
            namespaces: Mutex::new(BTreeMap::new()),
        }
    }

    fn path(&self, ns: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{ns}.json")))
    }

    /// Create the namespace, loading its persisted ids if there are
    /// any. On error the namespace is still created, empty.
    pub fn init_namespace(&self, ns: &str) -> Result<(), IdGenError> {
        let loaded = match self.path(ns) {
            Some(path) if path.exists() => Some(read_namespace(&path)),
            _ => None,
        };

        let mut map = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        match loaded {
            Some(Ok(n)) => {
                debug!(self.log, "loaded ids";
                    "namespace" => ns, "count" => n.ids.len());
                map.insert(ns.to_string(), n);
                Ok(())
            }
            Some(Err(e)) => {
                map.entry(ns.to_string()).or_insert_with(Namespace::new);
                Err(e)
            }
            None => {
                map.entry(ns.to_string()).or_insert_with(Namespace::new);
                Ok(())
            }
        }
    }

    /// Get the id for `key`, allocating one if needed.
    pub fn get_id(&self, ns: &str, key: &str) -> u32 {
        let mut map = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        let n = map.entry(ns.to_string()).or_insert_with(Namespace::new);
        if let Some(id) = n.ids.get(key) {
            return *id;
        }

        let id = n.next;
        n.next += 1;
        n.ids.insert(key.to_string(), id);
        n.dirty = true;
        id
    }

    /// Get the id for `key` if one was already allocated.
    pub fn get_id_no_alloc(&self, ns: &str, key: &str) -> Option<u32> {
        let map = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(ns).and_then(|n| n.ids.get(key).copied())
    }

    /// The key an id was allocated for.
    pub fn get_key(&self, ns: &str, id: u32) -> Option<String> {
        let map = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(ns)?
            .ids
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.clone())
    }

    pub fn erase(&self, ns: &str, key: &str) {
        let mut map = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(n) = map.get_mut(ns) {
            if n.ids.remove(key).is_some() {
                n.dirty = true;
            }
        }
    }

    /// Drop every id in `ns` whose key `keep` rejects.
    pub fn collect_garbage<F>(&self, ns: &str, keep: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut map = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(n) = map.get_mut(ns) else {
            return 0;
        };
        let before = n.ids.len();
        n.ids.retain(|k, _| keep(k));
        let removed = before - n.ids.len();
        if removed > 0 {
            n.dirty = true;
            debug!(self.log, "collected ids"; "namespace" => ns, "count" => removed);
        }
        removed
    }

    /// Write every changed namespace to disk.
    pub fn persist(&self) -> Result<(), IdGenError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)
            .map_err(|err| IdGenError::Io { path: dir.clone(), err })?;

        let mut map = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        for (ns, n) in map.iter_mut().filter(|(_, n)| n.dirty) {
            let path = dir.join(format!("{ns}.json"));
            write_namespace(&path, n)?;
            n.dirty = false;
        }
        Ok(())
    }
}

fn read_namespace(path: &Path) -> Result<Namespace, IdGenError> {
    let data = fs::read_to_string(path)
        .map_err(|err| IdGenError::Io { path: path.to_path_buf(), err })?;
    serde_json::from_str(&data)
        .map_err(|err| IdGenError::Json { path: path.to_path_buf(), err })
}

fn write_namespace(path: &Path, n: &Namespace) -> Result<(), IdGenError> {
    let data = serde_json::to_string_pretty(n)
        .map_err(|err| IdGenError::Json { path: path.to_path_buf(), err })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)
        .map_err(|err| IdGenError::Io { path: tmp.clone(), err })?;
    fs::rename(&tmp, path)
        .map_err(|err| IdGenError::Io { path: path.to_path_buf(), err })
}

#[cfg(test)]
mod test {
    use super::*;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("gbp-id-gen-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn stable_ids() {
        let g = IdGenerator::new(&log(), None);
        g.init_namespace("bridgeDomain").unwrap();
        let a = g.get_id("bridgeDomain", "/bd/a");
        let b = g.get_id("bridgeDomain", "/bd/b");
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(g.get_id("bridgeDomain", "/bd/a"), 1);
        assert_eq!(g.get_id_no_alloc("bridgeDomain", "/bd/c"), None);
        assert_eq!(g.get_key("bridgeDomain", 2).as_deref(), Some("/bd/b"));

        // Erased ids are not reused.
        g.erase("bridgeDomain", "/bd/a");
        assert_eq!(g.get_id("bridgeDomain", "/bd/c"), 3);
        assert_eq!(g.get_id("bridgeDomain", "/bd/a"), 4);
    }

    #[test]
    fn garbage_collection() {
        let g = IdGenerator::new(&log(), None);
        g.get_id("service", "keep");
        g.get_id("service", "drop");
        assert_eq!(g.collect_garbage("service", |k| k == "keep"), 1);
        assert_eq!(g.get_id_no_alloc("service", "drop"), None);
        assert_eq!(g.get_id_no_alloc("service", "keep"), Some(1));
    }

    #[test]
    fn survives_restart() {
        let dir = scratch("restart");
        let key = "ingress:svc-nh:00000000-0000-0000-0000-000000000001:10.0.0.1";
        let id = {
            let g = IdGenerator::new(&log(), Some(dir.clone()));
            g.init_namespace("svcstats").unwrap();
            g.get_id("svcstats", "first");
            let id = g.get_id("svcstats", key);
            g.persist().unwrap();
            id
        };

        let g = IdGenerator::new(&log(), Some(dir.clone()));
        g.init_namespace("svcstats").unwrap();
        assert_eq!(g.get_id_no_alloc("svcstats", key), Some(id));
        assert_eq!(g.get_id("svcstats", "new"), 3);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_file() {
        let dir = scratch("malformed");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("service.json"), "not json").unwrap();
        let g = IdGenerator::new(&log(), Some(dir.clone()));
        assert!(matches!(
            g.init_namespace("service"),
            Err(IdGenError::Json { .. })
        ));
        assert_eq!(g.get_id("service", "a"), 1);
        let _ = fs::remove_dir_all(&dir);
    }
}
