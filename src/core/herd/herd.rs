// src/core/herd/herd.rs

use crate::core::computed_files::ComputedFilesManager;
use crate::core::cpu_sharer::CpuSharer;
use crate::core::errors::{HerdError, HerdResult};
use crate::core::image::ImageManager;
use crate::core::mdb::{Machine, Mdb};
use crate::core::reverse_dialer::ReverseDialer;
use crate::core::sub::{Sub, SubStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::installer::InstallerQueue;

/// Configuration pushed verbatim to subs: scan exclusion list and CPU
/// limits. Opaque to the Herd beyond carrying it along.
#[derive(Debug, Clone, Default)]
pub struct SubConfiguration {
    pub scan_exclusion_list: Vec<String>,
    pub cpu_percent_limit: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdatesDisabled {
    pub reason: String,
    pub by: String,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MdbIngestStats {
    pub num_new: usize,
    pub num_changed: usize,
    pub num_deleted: usize,
}

/// Fleet-wide registry of Subs: MDB ingestion, the scan loop's cursor and
/// counters, semaphore pools, default-image arbitration, and the
/// installer escalation queue.
pub struct Herd {
    subs_by_name: DashMap<String, Arc<Sub>>,
    subs_by_index: parking_lot::RwLock<Vec<Arc<Sub>>>,

    default_image_name: parking_lot::RwLock<Option<String>>,
    next_default_image_name: parking_lot::RwLock<Option<String>>,

    updates_disabled: parking_lot::RwLock<Option<UpdatesDisabled>>,
    configuration_for_subs: parking_lot::RwLock<SubConfiguration>,

    scan_counter: AtomicU64,
    total_scan_duration: parking_lot::Mutex<Duration>,
    previous_scan_duration: parking_lot::Mutex<Duration>,
    current_scan_start_time: parking_lot::Mutex<Option<DateTime<Utc>>>,
    next_sub_to_poll: AtomicUsize,

    pub poll_semaphore: Arc<Semaphore>,
    pub push_semaphore: Arc<Semaphore>,
    pub fast_update_semaphore: Arc<Semaphore>,

    pub cpu_sharer: Arc<CpuSharer>,
    pub reverse_dialer: Arc<ReverseDialer>,
    pub image_manager: Arc<ImageManager>,
    pub computed_files: Arc<ComputedFilesManager>,

    installer_queue: InstallerQueue,
}

impl Herd {
    pub fn new(
        cpu_sharer: Arc<CpuSharer>,
        reverse_dialer: Arc<ReverseDialer>,
        image_manager: Arc<ImageManager>,
        computed_files: Arc<ComputedFilesManager>,
        poll_slots_per_cpu: u32,
        disable_updates_at_startup: bool,
    ) -> Self {
        let cpus = num_cpus::get().max(1) as u32;
        let poll_slots = (cpus * poll_slots_per_cpu.max(1)) as usize;
        let updates_disabled = if disable_updates_at_startup {
            Some(UpdatesDisabled {
                reason: "by default".to_string(),
                by: "startup".to_string(),
                time: Some(Utc::now()),
            })
        } else {
            None
        };
        Herd {
            subs_by_name: DashMap::new(),
            subs_by_index: parking_lot::RwLock::new(Vec::new()),
            default_image_name: parking_lot::RwLock::new(None),
            next_default_image_name: parking_lot::RwLock::new(None),
            updates_disabled: parking_lot::RwLock::new(updates_disabled),
            configuration_for_subs: parking_lot::RwLock::new(SubConfiguration::default()),
            scan_counter: AtomicU64::new(0),
            total_scan_duration: parking_lot::Mutex::new(Duration::ZERO),
            previous_scan_duration: parking_lot::Mutex::new(Duration::ZERO),
            current_scan_start_time: parking_lot::Mutex::new(None),
            next_sub_to_poll: AtomicUsize::new(0),
            poll_semaphore: Arc::new(Semaphore::new(poll_slots)),
            push_semaphore: Arc::new(Semaphore::new(cpus as usize)),
            fast_update_semaphore: Arc::new(Semaphore::new(cpus as usize)),
            cpu_sharer,
            reverse_dialer,
            image_manager,
            computed_files,
            installer_queue: InstallerQueue::new(),
        }
    }

    pub fn get_sub(&self, hostname: &str) -> Option<Arc<Sub>> {
        self.subs_by_name.get(hostname).map(|r| Arc::clone(&r))
    }

    pub fn sub_count(&self) -> usize {
        self.subs_by_name.len()
    }

    pub fn scan_counter(&self) -> u64 {
        self.scan_counter.load(Ordering::SeqCst)
    }

    pub fn previous_scan_duration(&self) -> Duration {
        *self.previous_scan_duration.lock()
    }

    pub(crate) fn installer_queue(&self) -> &InstallerQueue {
        &self.installer_queue
    }

    pub(crate) fn subs_by_index_snapshot(&self) -> Vec<Arc<Sub>> {
        self.subs_by_index.read().clone()
    }

    pub fn updates_disabled_reason(&self) -> Option<String> {
        self.updates_disabled.read().as_ref().map(|d| d.reason.clone())
    }

    /// The image name a sub should converge to: its own `required_image`
    /// if set, otherwise the Herd's current default image. `None` when
    /// neither is set, meaning the sub has no image to converge to.
    pub fn effective_image_name(&self, machine: &Machine) -> Option<String> {
        if !machine.required_image.is_empty() {
            Some(machine.required_image.clone())
        } else {
            self.default_image_name.read().clone()
        }
    }

    /// The single mutation that reshapes the fleet from a new MDB
    /// snapshot. Deletions, creations, and generation bumps are all
    /// computed under one write section so the scheduler never observes
    /// a half-applied generation.
    pub fn mdb_update(&self, new_mdb: Mdb) -> MdbIngestStats {
        let mut stats = MdbIngestStats::default();
        let mut subs_to_delete: HashSet<String> = self.subs_by_name.iter().map(|r| r.key().clone()).collect();
        let mut wanted_images: HashSet<String> = HashSet::new();

        if let Some(name) = self.default_image_name.read().clone() {
            wanted_images.insert(name);
        }
        if let Some(name) = self.next_default_image_name.read().clone() {
            wanted_images.insert(name);
        }

        for machine in &new_mdb.machines {
            if machine.hostname.is_empty() {
                warn!("mdb record with empty hostname skipped");
                continue;
            }
            if !machine.required_image.is_empty() {
                wanted_images.insert(machine.required_image.clone());
            }
            if !machine.planned_image.is_empty() {
                wanted_images.insert(machine.planned_image.clone());
            }

            subs_to_delete.remove(&machine.hostname);

            match self.subs_by_name.get(&machine.hostname) {
                None => {
                    let sub = Arc::new(Sub::new(machine.clone()));
                    self.computed_files.update_machine(machine);
                    self.subs_by_name.insert(machine.hostname.clone(), sub);
                    stats.num_new += 1;
                }
                Some(existing) => {
                    let old = existing.mdb();
                    if !machine_equal(&old, machine) {
                        let required_image_changed = old.required_image != machine.required_image;
                        self.computed_files.update_machine(machine);
                        existing.update_mdb(machine.clone(), required_image_changed);
                        stats.num_changed += 1;
                    }
                    existing.set_have_planned_image(!machine.planned_image.is_empty());
                }
            }
        }

        let mut closing = Vec::new();
        for hostname in &subs_to_delete {
            self.installer_queue.remove(hostname);
            if let Some((_, sub)) = self.subs_by_name.remove(hostname) {
                self.computed_files.remove_machine(hostname);
                closing.push(sub);
                stats.num_deleted += 1;
            }
        }

        wanted_images.remove("");
        self.image_manager.set_image_interest_list(wanted_images, false);

        let mut index: Vec<Arc<Sub>> = new_mdb
            .machines
            .iter()
            .filter(|m| !m.hostname.is_empty())
            .filter_map(|m| self.subs_by_name.get(&m.hostname).map(|r| Arc::clone(&r)))
            .collect();
        index.dedup_by(|a, b| a.hostname() == b.hostname());
        *self.subs_by_index.write() = index;

        for sub in closing {
            tokio::spawn(async move {
                sub.mark_deleting().await;
            });
        }

        info!(
            num_new = stats.num_new,
            num_changed = stats.num_changed,
            num_deleted = stats.num_deleted,
            "mdb ingest complete"
        );
        stats
    }

    /// `set_default_image` arbitration. Validation happens before the
    /// swap; any failure between fetch and swap clears
    /// `next_default_image_name` so a half-attempted change never lingers.
    pub async fn set_default_image(&self, name: &str) -> HerdResult<()> {
        if name.is_empty() {
            *self.default_image_name.write() = None;
            *self.next_default_image_name.write() = None;
            self.cancel_unassigned_subs(SubStatus::ImageUndefined);
            return Ok(());
        }

        if self.default_image_name.read().as_deref() == Some(name) {
            return Ok(());
        }

        *self.next_default_image_name.write() = Some(name.to_string());

        let result = self.validate_default_image_candidate(name).await;
        match result {
            Ok(()) => {
                *self.default_image_name.write() = Some(name.to_string());
                *self.next_default_image_name.write() = None;
                self.cancel_unassigned_subs(SubStatus::WaitingToPoll);
                Ok(())
            }
            Err(e) => {
                *self.next_default_image_name.write() = None;
                Err(e)
            }
        }
    }

    async fn validate_default_image_candidate(&self, name: &str) -> HerdResult<()> {
        let image = self
            .image_manager
            .get(name, true, Some(Duration::from_secs(30)))
            .await
            .map_err(|e| HerdError::AdminRejected(e.to_string()))?
            .ok_or_else(|| HerdError::UnknownImage(name.to_string()))?;

        if !image.is_sparse() {
            return Err(HerdError::AdminRejected(
                "only sparse images can be set as default".to_string(),
            ));
        }
        if image.inodes.len() > 100 {
            return Err(HerdError::AdminRejected(format!(
                "default image candidate {name} has {} inodes, exceeding the 100-inode cap",
                image.inodes.len()
            )));
        }
        Ok(())
    }

    fn cancel_unassigned_subs(&self, new_status: SubStatus) {
        for entry in self.subs_by_name.iter() {
            let sub = entry.value();
            if sub.mdb().required_image.is_empty() {
                sub.cancel_for_default_image_change(new_status);
            }
        }
        debug!("cancelled unassigned subs after default image change");
    }

    /// `disable_updates(by, reason)`. An empty reason is always rejected.
    pub fn disable_updates(&self, by: &str, reason: &str) -> HerdResult<()> {
        if reason.is_empty() {
            return Err(HerdError::AdminRejected("no reason given".to_string()));
        }
        *self.updates_disabled.write() = Some(UpdatesDisabled {
            reason: reason.to_string(),
            by: by.to_string(),
            time: Some(Utc::now()),
        });
        Ok(())
    }

    pub fn enable_updates(&self) {
        *self.updates_disabled.write() = None;
    }

    pub(crate) fn begin_scan_if_wrapped(&self, wrapped: bool) {
        if !wrapped {
            return;
        }
        let now = Utc::now();
        let start = self.current_scan_start_time.lock().replace(now);
        if let Some(start) = start {
            let elapsed = (now - start).to_std().unwrap_or(Duration::ZERO);
            *self.previous_scan_duration.lock() = elapsed;
            *self.total_scan_duration.lock() += elapsed;
        }
        self.scan_counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn next_sub_to_poll_index(&self) -> &AtomicUsize {
        &self.next_sub_to_poll
    }
}

/// Field-wise equality covering every Machine attribute that should force
/// a re-poll when it changes. Kept in one place so adding a field updates
/// one site.
fn machine_equal(a: &Machine, b: &Machine) -> bool {
    a.hostname == b.hostname
        && a.ip_address == b.ip_address
        && a.required_image == b.required_image
        && a.planned_image == b.planned_image
        && a.disable_updates == b.disable_updates
        && a.owner_group == b.owner_group
        && a.aws_metadata == b.aws_metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::image::{HttpImageServerClient, ImageManager};

    fn test_herd() -> Herd {
        let cpu_sharer = Arc::new(CpuSharer::new(1.0));
        let dialer = Arc::new(ReverseDialer::new(cpu_sharer.clone(), None, None));
        let image_client = Arc::new(HttpImageServerClient::new(url::Url::parse("http://localhost/").unwrap()));
        let image_manager = Arc::new(ImageManager::new(image_client));
        let computed_files = Arc::new(ComputedFilesManager::new());
        Herd::new(cpu_sharer, dialer, image_manager, computed_files, 100, false)
    }

    fn machine(hostname: &str, required_image: &str) -> Machine {
        Machine {
            hostname: hostname.to_string(),
            required_image: required_image.to_string(),
            ..Default::default()
        }
    }

    // Testable property 1, S1.
    #[test]
    fn mdb_update_creates_subs_for_new_hostnames() {
        let herd = test_herd();
        let stats = herd.mdb_update(Mdb::sorted(vec![machine("h1", "img-A")]));
        assert_eq!(stats.num_new, 1);
        assert!(herd.get_sub("h1").is_some());
        assert_eq!(herd.subs_by_index_snapshot().len(), 1);
    }

    // Testable property 7: applying the same mdb_update twice is a no-op
    // on the second application (no new/changed/deleted).
    #[test]
    fn repeated_mdb_update_is_idempotent() {
        let herd = test_herd();
        let mdb = Mdb::sorted(vec![machine("h1", "img-A"), machine("h2", "img-B")]);
        let first = herd.mdb_update(mdb.clone());
        assert_eq!(first.num_new, 2);

        let second = herd.mdb_update(mdb);
        assert_eq!(second.num_new, 0);
        assert_eq!(second.num_changed, 0);
        assert_eq!(second.num_deleted, 0);
    }

    // Required image changes.
    #[test]
    fn required_image_change_marks_changed_and_resets_generation() {
        let herd = test_herd();
        herd.mdb_update(Mdb::sorted(vec![machine("h1", "img-A")]));
        let sub = herd.get_sub("h1").unwrap();
        sub.update_mdb(machine("h1", "img-A"), false);
        // Force into synced to exercise the synced -> waiting_to_poll transition.
        // (status field is private to this module's crate boundary; exercised
        // indirectly via update_mdb's required_image_changed branch.)

        let stats = herd.mdb_update(Mdb::sorted(vec![machine("h1", "img-B")]));
        assert_eq!(stats.num_changed, 1);
        assert_eq!(herd.get_sub("h1").unwrap().mdb().required_image, "img-B");
    }

    // Deletion removes a sub no longer present in the MDB.
    #[test]
    fn mdb_update_deletes_absent_hostnames() {
        let herd = test_herd();
        herd.mdb_update(Mdb::sorted(vec![machine("h1", "img-A"), machine("h2", "img-B")]));
        let stats = herd.mdb_update(Mdb::sorted(vec![machine("h1", "img-A")]));
        assert_eq!(stats.num_deleted, 1);
        assert!(herd.get_sub("h2").is_none());
    }

    // Disable updates requires a reason.
    #[test]
    fn disable_updates_rejects_empty_reason() {
        let herd = test_herd();
        let err = herd.disable_updates("alice", "").unwrap_err();
        assert_eq!(err.to_string(), "no reason given");
        assert!(herd.updates_disabled_reason().is_none());
    }

    #[test]
    fn disable_updates_accepts_nonempty_reason() {
        let herd = test_herd();
        herd.disable_updates("alice", "maintenance window").unwrap();
        assert_eq!(herd.updates_disabled_reason().as_deref(), Some("maintenance window"));
    }

    // Default image rejected when dense.
    #[tokio::test]
    async fn set_default_image_rejects_dense_image() {
        struct DenseOnlyClient;
        #[async_trait::async_trait]
        impl crate::core::image::ImageServerClient for DenseOnlyClient {
            async fn get(
                &self,
                name: &str,
                _wait: bool,
                _timeout: Option<Duration>,
            ) -> anyhow::Result<Option<crate::core::image::Image>> {
                Ok(Some(crate::core::image::Image {
                    name: name.to_string(),
                    inodes: Default::default(),
                    filter: Some(vec![]),
                    triggers: Vec::new(),
                }))
            }
            async fn check_directory(&self, _name: &str) -> anyhow::Result<bool> {
                Ok(true)
            }
            async fn subscribe_updates(&self) -> anyhow::Result<tokio::sync::mpsc::Receiver<crate::core::image::ImageUpdate>> {
                let (_tx, rx) = tokio::sync::mpsc::channel(1);
                Ok(rx)
            }
        }

        let cpu_sharer = Arc::new(CpuSharer::new(1.0));
        let dialer = Arc::new(ReverseDialer::new(cpu_sharer.clone(), None, None));
        let image_manager = Arc::new(ImageManager::new(Arc::new(DenseOnlyClient)));
        let computed_files = Arc::new(ComputedFilesManager::new());
        let herd = Herd::new(cpu_sharer, dialer, image_manager, computed_files, 100, false);

        let err = herd.set_default_image("img-dense").await.unwrap_err();
        assert_eq!(err.to_string(), "only sparse images can be set as default");
    }

    // Testable property 8: setting the same default image twice is a no-op
    // the second time.
    #[tokio::test]
    async fn set_default_image_twice_is_noop_second_time() {
        struct SparseClient;
        #[async_trait::async_trait]
        impl crate::core::image::ImageServerClient for SparseClient {
            async fn get(
                &self,
                name: &str,
                _wait: bool,
                _timeout: Option<Duration>,
            ) -> anyhow::Result<Option<crate::core::image::Image>> {
                Ok(Some(crate::core::image::Image {
                    name: name.to_string(),
                    inodes: Default::default(),
                    filter: None,
                    triggers: Vec::new(),
                }))
            }
            async fn check_directory(&self, _name: &str) -> anyhow::Result<bool> {
                Ok(true)
            }
            async fn subscribe_updates(&self) -> anyhow::Result<tokio::sync::mpsc::Receiver<crate::core::image::ImageUpdate>> {
                let (_tx, rx) = tokio::sync::mpsc::channel(1);
                Ok(rx)
            }
        }

        let cpu_sharer = Arc::new(CpuSharer::new(1.0));
        let dialer = Arc::new(ReverseDialer::new(cpu_sharer.clone(), None, None));
        let image_manager = Arc::new(ImageManager::new(Arc::new(SparseClient)));
        let computed_files = Arc::new(ComputedFilesManager::new());
        let herd = Herd::new(cpu_sharer, dialer, image_manager, computed_files, 100, false);

        herd.set_default_image("img-sparse").await.unwrap();
        herd.set_default_image("img-sparse").await.unwrap();
    }
}
