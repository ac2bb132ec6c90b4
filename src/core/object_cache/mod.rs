// src/core/object_cache/mod.rs

pub mod cache;
pub mod client;

pub use cache::{ExternalOldRootMounter, ObjectCache, OldRootMounter, ScanStats};
pub use client::{HttpObjectServerClient, ObjectServerClient};
