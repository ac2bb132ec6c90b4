// src/core/computed_files.rs

//! Per-machine generation of synthetic files whose content depends on MDB
//! fields rather than on image bytes. A machine's hostname tag file and
//! its owner-group file are the two built-in generators; additional
//! generators register by source name and are looked up when an image
//! references a `ComputedFile` inode.

use crate::core::hash::Hash;
use crate::core::mdb::Machine;
use dashmap::DashMap;
use std::sync::Arc;

/// One computed file's resolved content and hash, cached per machine per
/// source until the next MDB-driven recomputation.
#[derive(Debug, Clone)]
pub struct ComputedFile {
    pub source: String,
    pub content: Arc<[u8]>,
    pub hash: Hash,
}

/// A function from a machine's MDB record to file content. Generators are
/// pure and stateless; everything they need is on the `Machine`.
pub trait ComputedFileGenerator: Send + Sync {
    fn source(&self) -> &str;
    fn generate(&self, machine: &Machine) -> Vec<u8>;
}

/// Registers generators by source name and caches their per-machine
/// output, recomputing whenever a machine's record changes.
pub struct ComputedFilesManager {
    generators: Vec<Box<dyn ComputedFileGenerator>>,
    cache: DashMap<(String, String), ComputedFile>,
}

impl Default for ComputedFilesManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputedFilesManager {
    pub fn new() -> Self {
        ComputedFilesManager {
            generators: vec![Box::new(HostnameGenerator), Box::new(OwnerGroupGenerator)],
            cache: DashMap::new(),
        }
    }

    pub fn register(&mut self, generator: Box<dyn ComputedFileGenerator>) {
        self.generators.push(generator);
    }

    /// Registers or refreshes a machine's computed files. Called from MDB
    /// ingest whenever a Sub is created or its record changes.
    pub fn update_machine(&self, machine: &Machine) {
        for generator in &self.generators {
            let content: Arc<[u8]> = generator.generate(machine).into();
            let hash = Hash::of(&content);
            self.cache.insert(
                (machine.hostname.clone(), generator.source().to_string()),
                ComputedFile {
                    source: generator.source().to_string(),
                    content,
                    hash,
                },
            );
        }
    }

    pub fn remove_machine(&self, hostname: &str) {
        self.cache.retain(|(h, _), _| h != hostname);
    }

    /// Resolves the current computed file for `hostname`/`source`, if the
    /// machine has been registered.
    pub fn get(&self, hostname: &str, source: &str) -> Option<ComputedFile> {
        self.cache
            .get(&(hostname.to_string(), source.to_string()))
            .map(|r| r.clone())
    }
}

struct HostnameGenerator;
impl ComputedFileGenerator for HostnameGenerator {
    fn source(&self) -> &str {
        "hostname"
    }
    fn generate(&self, machine: &Machine) -> Vec<u8> {
        let mut bytes = machine.hostname.clone().into_bytes();
        bytes.push(b'\n');
        bytes
    }
}

struct OwnerGroupGenerator;
impl ComputedFileGenerator for OwnerGroupGenerator {
    fn source(&self) -> &str {
        "owner-group"
    }
    fn generate(&self, machine: &Machine) -> Vec<u8> {
        let mut bytes = machine.owner_group.clone().into_bytes();
        bytes.push(b'\n');
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(hostname: &str, owner_group: &str) -> Machine {
        Machine {
            hostname: hostname.to_string(),
            owner_group: owner_group.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn update_machine_populates_both_builtin_generators() {
        let manager = ComputedFilesManager::new();
        manager.update_machine(&machine("h1", "infra"));

        let hostname_file = manager.get("h1", "hostname").unwrap();
        assert_eq!(&*hostname_file.content, b"h1\n");

        let owner_file = manager.get("h1", "owner-group").unwrap();
        assert_eq!(&*owner_file.content, b"infra\n");
    }

    #[test]
    fn recomputation_changes_the_hash() {
        let manager = ComputedFilesManager::new();
        manager.update_machine(&machine("h1", "infra"));
        let before = manager.get("h1", "owner-group").unwrap().hash;

        manager.update_machine(&machine("h1", "platform"));
        let after = manager.get("h1", "owner-group").unwrap().hash;

        assert_ne!(before, after);
    }

    #[test]
    fn remove_machine_clears_its_entries() {
        let manager = ComputedFilesManager::new();
        manager.update_machine(&machine("h1", "infra"));
        manager.remove_machine("h1");
        assert!(manager.get("h1", "hostname").is_none());
    }
}
