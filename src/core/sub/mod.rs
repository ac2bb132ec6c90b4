// src/core/sub/mod.rs

pub mod cancel;
pub mod rpc;
pub mod state;
#[allow(clippy::module_inception)]
pub mod sub;

pub use rpc::{FileSystem, FramedSubRpcClient, PollReply, SubRpcClient, TriggerOutcome, UpdateManifest};
pub use state::SubStatus;
pub use sub::{compute_objects_to_send, compute_update_set, Sub};
