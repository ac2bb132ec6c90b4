// src/core/sub/sub.rs

use super::cancel::CancelEpoch;
use super::rpc::{FileSystem, PollReply, SubRpcClient, TriggerOutcome, UpdateManifest};
use super::state::SubStatus;
use crate::core::computed_files::ComputedFilesManager;
use crate::core::errors::{HerdError, HerdResult};
use crate::core::hash::Hash;
use crate::core::image::Image;
use crate::core::mdb::Machine;
use crate::core::reverse_dialer::ReverseDialer;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Per-machine runtime state and the unit of scheduling. A Sub drives one
/// machine through poll, delta computation, fetch, update, and
/// cancellation.
pub struct Sub {
    hostname: String,
    mdb: parking_lot::RwLock<Machine>,
    status: parking_lot::RwLock<SubStatus>,
    busy: AtomicBool,
    generation_count: AtomicU64,
    client_resource: AsyncMutex<Option<Arc<dyn SubRpcClient>>>,
    have_planned_image: AtomicBool,
    cancel: CancelEpoch,
    deleting: AtomicBool,
    deleting_flag_mutex: AsyncMutex<()>,
    last_poll_succeeded: parking_lot::Mutex<Option<DateTime<Utc>>>,
    last_update_succeeded: parking_lot::Mutex<Option<DateTime<Utc>>>,
    last_connect_attempt: parking_lot::Mutex<Option<DateTime<Utc>>>,
    consecutive_unreachable: AtomicU64,
}

const UNREACHABLE_GRACE_FAILURES: u64 = 3;

impl Sub {
    pub fn new(mdb: Machine) -> Self {
        Sub {
            hostname: mdb.hostname.clone(),
            mdb: parking_lot::RwLock::new(mdb),
            status: parking_lot::RwLock::new(SubStatus::Unknown),
            busy: AtomicBool::new(false),
            generation_count: AtomicU64::new(0),
            client_resource: AsyncMutex::new(None),
            have_planned_image: AtomicBool::new(false),
            cancel: CancelEpoch::new(),
            deleting: AtomicBool::new(false),
            deleting_flag_mutex: AsyncMutex::new(()),
            last_poll_succeeded: parking_lot::Mutex::new(None),
            last_update_succeeded: parking_lot::Mutex::new(None),
            last_connect_attempt: parking_lot::Mutex::new(None),
            consecutive_unreachable: AtomicU64::new(0),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn status(&self) -> SubStatus {
        *self.status.read()
    }

    fn set_status(&self, status: SubStatus) {
        *self.status.write() = status;
    }

    pub fn mdb(&self) -> Machine {
        self.mdb.read().clone()
    }

    pub fn have_planned_image(&self) -> bool {
        self.have_planned_image.load(Ordering::SeqCst)
    }

    pub fn generation_count(&self) -> u64 {
        self.generation_count.load(Ordering::SeqCst)
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::SeqCst)
    }

    /// Advisory lock-free read of the busy flag, used by the scan loop to
    /// avoid scheduling an already-running Sub without taking a lock.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Atomically claims the busy flag via compare-and-swap. Returns false
    /// if another caller already holds it; a false positive from
    /// `is_busy` merely causes a declined scheduling attempt, never a
    /// double-schedule.
    pub fn try_make_busy(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn make_unbusy(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Replaces the MDB record, forcing a full (not delta) poll on the
    /// next cycle and firing cancellation for any in-flight operation.
    /// Called from MDB ingest under the Herd write lock.
    pub fn update_mdb(&self, new_mdb: Machine, required_image_changed: bool) {
        *self.mdb.write() = new_mdb;
        self.generation_count.store(0, Ordering::SeqCst);
        self.cancel.bump();
        if required_image_changed && self.status() == SubStatus::Synced {
            self.set_status(SubStatus::WaitingToPoll);
        }
    }

    /// Cancels any in-flight operation and forces `new_status`, used by
    /// default-image arbitration on subs with no `required_image` of their
    /// own. Only applies when the sub is currently `synced` or
    /// `image_undefined`, matching the set of states default-image changes
    /// may touch.
    pub fn cancel_for_default_image_change(&self, new_status: SubStatus) {
        let current = self.status();
        if current == SubStatus::Synced || current == SubStatus::ImageUndefined {
            self.cancel.bump();
            self.set_status(new_status);
        }
    }

    pub fn set_have_planned_image(&self, have: bool) {
        self.have_planned_image.store(have, Ordering::SeqCst);
    }

    /// Marks the Sub for removal. Must be called under
    /// `deleting_flag_mutex` so `deleting` and `client_resource` are
    /// observed atomically by anyone racing to start a new operation.
    pub async fn mark_deleting(&self) -> Option<Arc<dyn SubRpcClient>> {
        let _guard = self.deleting_flag_mutex.lock().await;
        self.deleting.store(true, Ordering::SeqCst);
        self.cancel.bump();
        self.client_resource.lock().await.take()
    }

    fn current_epoch(&self) -> u64 {
        self.cancel.current()
    }

    fn cancelled_since(&self, epoch: u64) -> bool {
        self.cancel.is_cancelled(epoch)
    }

    /// Scheduler entry point: dials, polls, computes a delta against
    /// `desired_image`, and if non-empty drives an update. Returns
    /// whether a retry is reasonable on failure (transient vs. not).
    pub async fn connect_and_poll(
        &self,
        dialer: &ReverseDialer,
        rpc_factory: impl FnOnce(Box<dyn crate::core::reverse_dialer::DialedStream>) -> Arc<dyn SubRpcClient>,
        desired_image: Option<Arc<Image>>,
        computed_files: &ComputedFilesManager,
        updates_disabled: bool,
    ) -> HerdResult<bool> {
        let _guard = self.deleting_flag_mutex.lock().await;
        if self.deleting.load(Ordering::SeqCst) {
            return Err(HerdError::UnknownSub(self.hostname.clone()));
        }
        drop(_guard);

        let epoch = self.current_epoch();
        self.set_status(SubStatus::Polling);

        let ip = self.mdb.read().ip_address.clone();
        *self.last_connect_attempt.lock() = Some(Utc::now());
        let connect_result = dialer.dial(&ip, crate::config::SUB_RPC_PORT).await;
        let stream = match connect_result {
            Ok(s) => s,
            Err(e) => {
                self.on_connect_failure();
                return Err(e);
            }
        };
        let client = rpc_factory(stream);
        *self.client_resource.lock().await = Some(Arc::clone(&client));

        if self.cancelled_since(epoch) {
            return Ok(true);
        }

        let generation_count = self.generation_count.load(Ordering::SeqCst);
        let reply = client
            .poll(generation_count, desired_image.is_some())
            .await
            .map_err(|e| HerdError::Transient(e.to_string()))?;

        *self.last_poll_succeeded.lock() = Some(Utc::now());
        self.consecutive_unreachable.store(0, Ordering::SeqCst);

        let Some(image) = desired_image else {
            self.set_status(SubStatus::ImageUndefined);
            return Ok(false);
        };

        let snapshot = match reply {
            PollReply::Unchanged => {
                self.set_status(SubStatus::Synced);
                return Ok(false);
            }
            PollReply::Snapshot { filesystem, object_hashes, .. } => {
                self.generation_count.fetch_add(1, Ordering::SeqCst);
                (filesystem, object_hashes)
            }
        };

        let (sub_fs, sub_objects) = snapshot;
        let update_set = compute_update_set(&image, computed_files, &self.hostname, &sub_fs);

        if update_set.is_empty() {
            self.set_status(SubStatus::Synced);
            *self.last_update_succeeded.lock() = Some(Utc::now());
            return Ok(false);
        }

        if updates_disabled {
            // Poll-only: a delta exists but pushing it is administratively
            // forbidden. Stay in waiting_to_poll rather than progressing.
            self.set_status(SubStatus::WaitingToPoll);
            return Ok(false);
        }

        self.set_status(SubStatus::ComputingUpdate);
        let sub_has: HashSet<Hash> = sub_objects.into_iter().collect();
        let objects_to_send = compute_objects_to_send(&update_set, &sub_has);

        if self.cancelled_since(epoch) {
            return Ok(true);
        }

        self.do_update(&client, &update_set, &objects_to_send, epoch).await?;
        Ok(false)
    }

    fn on_connect_failure(&self) {
        let failures = self.consecutive_unreachable.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= UNREACHABLE_GRACE_FAILURES {
            self.set_status(SubStatus::Unreachable);
        }
    }

    /// Uploads required objects in ascending-hash order, then sends the
    /// manifest. Stops at the next object boundary if cancelled.
    async fn do_update(
        &self,
        client: &Arc<dyn SubRpcClient>,
        update_set: &HashMap<String, Hash>,
        objects_to_send: &HashSet<Hash>,
        epoch: u64,
    ) -> HerdResult<()> {
        self.set_status(SubStatus::SendingUpdate);

        let mut ordered: Vec<Hash> = objects_to_send.iter().copied().collect();
        ordered.sort();

        for hash in &ordered {
            if self.cancelled_since(epoch) {
                debug!(hostname = %self.hostname, "update cancelled between object uploads");
                return Ok(());
            }
            client
                .fetch(std::slice::from_ref(hash))
                .await
                .map_err(|e| HerdError::Transient(e.to_string()))?;
        }

        let manifest = UpdateManifest {
            files_to_materialize: update_set.clone(),
            files_to_delete: Vec::new(),
            symlinks: HashMap::new(),
            directories_to_create: Vec::new(),
            directories_to_delete: Vec::new(),
            triggers_to_evaluate: Vec::new(),
        };

        self.set_status(SubStatus::Updating);
        let outcomes = client
            .update(&manifest)
            .await
            .map_err(|e| HerdError::Transient(e.to_string()))?;
        log_trigger_outcomes(&self.hostname, &outcomes);

        *self.last_update_succeeded.lock() = Some(Utc::now());
        self.set_status(SubStatus::WaitingToPoll);
        Ok(())
    }

    /// Administrative fast-path update, bypassing scheduler fairness.
    /// `timeout < 1ms` is coerced to 15 minutes, the documented floor.
    pub async fn fast_update(
        &self,
        client: Arc<dyn SubRpcClient>,
        update_set: HashMap<String, Hash>,
        objects_to_send: HashSet<Hash>,
        timeout: std::time::Duration,
    ) -> HerdResult<Vec<TriggerOutcome>> {
        let timeout = if timeout < std::time::Duration::from_millis(1) {
            std::time::Duration::from_secs(15 * 60)
        } else {
            timeout
        };
        let epoch = self.current_epoch();

        let run = async {
            let mut ordered: Vec<Hash> = objects_to_send.into_iter().collect();
            ordered.sort();
            for hash in &ordered {
                if self.cancelled_since(epoch) {
                    anyhow::bail!("fast update cancelled");
                }
                client.fetch(std::slice::from_ref(hash)).await?;
            }
            let manifest = UpdateManifest {
                files_to_materialize: update_set,
                ..Default::default()
            };
            Ok(client.update(&manifest).await?)
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(outcomes)) => Ok(outcomes),
            Ok(Err(e)) => Err(HerdError::Transient(e.to_string())),
            Err(_) => Err(HerdError::Transient(format!("fast update timed out after {timeout:?}"))),
        }
    }

    /// Sub-initiated refusal of further updates. Only clearable by an
    /// authenticated admin call.
    pub fn trip_safety_shutoff(&self) {
        warn!(hostname = %self.hostname, "sub tripped safety shutoff");
        self.set_status(SubStatus::SafetyShutoff);
    }

    pub fn clear_safety_shutoff(&self) -> HerdResult<()> {
        if self.status() != SubStatus::SafetyShutoff {
            return Err(HerdError::AdminRejected(format!(
                "{} is not in safety_shutoff",
                self.hostname
            )));
        }
        self.set_status(SubStatus::WaitingToPoll);
        info!(hostname = %self.hostname, "safety shutoff cleared by admin");
        Ok(())
    }
}

fn log_trigger_outcomes(hostname: &str, outcomes: &[TriggerOutcome]) {
    for outcome in outcomes {
        if !outcome.succeeded {
            warn!(hostname, trigger = %outcome.trigger, message = ?outcome.message, "trigger failed");
        }
    }
}

/// Files in the desired image whose content hash differs from the sub's
/// snapshot, unioned with computed files required by
/// `ComputedFilesManager` whose hash differs. The result maps path to the
/// hash the sub must end up with.
pub fn compute_update_set(
    image: &Image,
    computed_files: &ComputedFilesManager,
    hostname: &str,
    sub_snapshot: &FileSystem,
) -> HashMap<String, Hash> {
    use crate::core::image::Inode;

    let mut update_set = HashMap::new();
    for (path, inode) in &image.inodes {
        if image.is_filtered(path) {
            continue;
        }
        let required_hash = match inode {
            Inode::RegularFile { hash, .. } => *hash,
            Inode::ComputedFile { source } => match computed_files.get(hostname, source) {
                Some(cf) => cf.hash,
                None => continue,
            },
            Inode::Directory | Inode::Symlink { .. } => continue,
        };
        let matches = sub_snapshot.files.get(path) == Some(&required_hash);
        if !matches {
            update_set.insert(path.clone(), required_hash);
        }
    }
    update_set
}

/// The update-set hashes not already present on the sub.
pub fn compute_objects_to_send(update_set: &HashMap<String, Hash>, sub_has: &HashSet<Hash>) -> HashSet<Hash> {
    update_set
        .values()
        .filter(|h| !sub_has.contains(h))
        .copied()
        .collect()
}
