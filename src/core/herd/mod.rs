// src/core/herd/mod.rs

#[allow(clippy::module_inception)]
pub mod herd;
pub mod installer;
pub mod scan;

pub use herd::{Herd, MdbIngestStats, SubConfiguration, UpdatesDisabled};
pub use installer::{ExternalProcessInstaller, InstallerEscalationTask, InstallerQueue, SubdInstaller};
pub use scan::ScanLoopTask;
