// Copyright 2024 mftfs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Mounts configured earlier, keyed by their absolute mount path, so that
//! `remount` can bring them back.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use mftfs_backend::{BackendConfig, BackendKind};
use mftfs_fuse::DispatchConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Whatever};
use tracing::debug;

const REGISTRY_FILE: &str = "info.json";
const ID_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    pub id:       String,
    pub path:     PathBuf,
    pub kind:     BackendKind,
    pub backend:  BackendConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Registry {
    path_to_id:  BTreeMap<PathBuf, String>,
    id_to_entry: BTreeMap<String, MountEntry>,
}

impl Registry {
    pub fn default_path() -> Result<PathBuf, Whatever> {
        Ok(mftfs_utils::env::home_dir()?.join(REGISTRY_FILE))
    }

    /// Reads the registry at `path`; a missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self, Whatever> {
        if !path.exists() {
            debug!("no registry at {}", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_whatever_context(|e| format!("failed to read {}: {e}", path.display()))?;
        serde_json::from_str(&raw)
            .with_whatever_context(|e| format!("malformed registry {}: {e}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<(), Whatever> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_whatever_context(|e| format!("failed to create {}: {e}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self)
            .with_whatever_context(|e| format!("failed to encode registry: {e}"))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .with_whatever_context(|e| format!("failed to write {}: {e}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_whatever_context(|e| format!("failed to replace {}: {e}", path.display()))
    }

    pub fn get(&self, path: &Path) -> Option<&MountEntry> {
        self.path_to_id
            .get(path)
            .and_then(|id| self.id_to_entry.get(id))
    }

    pub fn entries(&self) -> impl Iterator<Item = &MountEntry> { self.id_to_entry.values() }

    /// Records the configuration mounted at `path`. A path registered before
    /// keeps its id.
    pub fn register(
        &mut self,
        path: &Path,
        backend: BackendConfig,
        dispatch: DispatchConfig,
    ) -> String {
        let id = match self.path_to_id.get(path) {
            Some(id) => id.clone(),
            None => self.new_id(&mut rand::thread_rng()),
        };
        let entry = MountEntry {
            id: id.clone(),
            path: path.to_path_buf(),
            kind: backend.kind(),
            backend,
            dispatch,
        };
        self.path_to_id.insert(path.to_path_buf(), id.clone());
        self.id_to_entry.insert(id.clone(), entry);
        id
    }

    pub fn unregister(&mut self, path: &Path) -> Option<MountEntry> {
        let id = self.path_to_id.remove(path)?;
        self.id_to_entry.remove(&id)
    }

    fn new_id<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        loop {
            let id: String = (0..ID_LEN)
                .map(|_| rng.gen_range(b'A'..=b'Z') as char)
                .collect();
            if !self.id_to_entry.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn local(root: &str) -> BackendConfig {
        BackendConfig::Local {
            root: PathBuf::from(root),
        }
    }

    #[test]
    fn ids_are_upper_case_letters() {
        let mut reg = Registry::default();
        let id = reg.register(Path::new("/mnt/a"), local("/data"), DispatchConfig::default());
        assert_eq!(id.len(), ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_uppercase()));
    }

    #[test]
    fn same_path_keeps_its_id() {
        let mut reg = Registry::default();
        let first = reg.register(Path::new("/mnt/a"), local("/x"), DispatchConfig::default());
        let again = reg.register(Path::new("/mnt/a"), local("/y"), DispatchConfig::default());
        assert_eq!(first, again);
        assert_eq!(reg.entries().count(), 1);
        assert_eq!(reg.get(Path::new("/mnt/a")).unwrap().backend, local("/y"));

        let removed = reg.unregister(Path::new("/mnt/a")).unwrap();
        assert_eq!(removed.id, first);
        assert!(reg.get(Path::new("/mnt/a")).is_none());
        assert!(reg.unregister(Path::new("/mnt/a")).is_none());
    }

    #[test]
    fn colliding_id_is_drawn_again() {
        let mut reg = Registry::default();
        let taken = reg.new_id(&mut StdRng::seed_from_u64(7));
        reg.id_to_entry.insert(taken.clone(), MountEntry {
            id:       taken.clone(),
            path:     PathBuf::from("/mnt/a"),
            kind:     BackendKind::Local,
            backend:  local("/x"),
            dispatch: DispatchConfig::default(),
        });
        let next = reg.new_id(&mut StdRng::seed_from_u64(7));
        assert_ne!(next, taken);
    }

    #[test]
    fn survives_a_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(REGISTRY_FILE);
        assert_eq!(Registry::load(&path).unwrap().entries().count(), 0);

        let mut reg = Registry::default();
        reg.register(Path::new("/mnt/a"), local("/x"), DispatchConfig::default());
        reg.register(
            Path::new("/mnt/b"),
            BackendConfig::Remote(Default::default()),
            DispatchConfig::default(),
        );
        reg.save(&path).unwrap();

        let back = Registry::load(&path).unwrap();
        assert_eq!(back.entries().count(), 2);
        assert_eq!(back.get(Path::new("/mnt/b")).unwrap().kind, BackendKind::Remote);
        assert_eq!(back.get(Path::new("/mnt/a")), reg.get(Path::new("/mnt/a")));
    }
}
