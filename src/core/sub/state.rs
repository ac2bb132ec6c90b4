// src/core/sub/state.rs

use strum_macros::EnumIter;

/// A sub's place in the convergence protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum SubStatus {
    Unknown,
    WaitingToPoll,
    Polling,
    ComputingUpdate,
    SendingUpdate,
    Updating,
    Synced,
    ImageUndefined,
    SafetyShutoff,
    Unreachable,
    UnsupportedSubd,
}

impl SubStatus {
    /// The wire/log text for this status. Stable across releases: this
    /// text is persisted in the installer queue and in log lines.
    pub fn marshal_text(&self) -> &'static str {
        match self {
            SubStatus::Unknown => "unknown",
            SubStatus::WaitingToPoll => "waiting-to-poll",
            SubStatus::Polling => "polling",
            SubStatus::ComputingUpdate => "computing-update",
            SubStatus::SendingUpdate => "sending-update",
            SubStatus::Updating => "updating",
            SubStatus::Synced => "synced",
            SubStatus::ImageUndefined => "image-undefined",
            SubStatus::SafetyShutoff => "safety-shutoff",
            SubStatus::Unreachable => "unreachable",
            SubStatus::UnsupportedSubd => "unsupported-subd",
        }
    }

    pub fn unmarshal_text(s: &str) -> Option<Self> {
        Some(match s {
            "unknown" => SubStatus::Unknown,
            "waiting-to-poll" => SubStatus::WaitingToPoll,
            "polling" => SubStatus::Polling,
            "computing-update" => SubStatus::ComputingUpdate,
            "sending-update" => SubStatus::SendingUpdate,
            "updating" => SubStatus::Updating,
            "synced" => SubStatus::Synced,
            "image-undefined" => SubStatus::ImageUndefined,
            "safety-shutoff" => SubStatus::SafetyShutoff,
            "unreachable" => SubStatus::Unreachable,
            "unsupported-subd" => SubStatus::UnsupportedSubd,
            _ => return None,
        })
    }

    /// States from which the scheduler will offer a fresh scheduling
    /// opportunity.
    pub fn is_pollable(&self) -> bool {
        matches!(
            self,
            SubStatus::Unknown
                | SubStatus::Synced
                | SubStatus::ImageUndefined
                | SubStatus::Unreachable
                | SubStatus::UnsupportedSubd
        )
    }
}
