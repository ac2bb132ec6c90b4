// src/core/image/types.rs

use crate::core::hash::Hash;
use regex::Regex;
use std::collections::HashMap;

/// One file, directory entry, symlink, or computed-file placeholder in an
/// image's filesystem tree, keyed by path.
#[derive(Debug, Clone)]
pub enum Inode {
    RegularFile { hash: Hash, len: u64 },
    Directory,
    Symlink { target: String },
    /// A placeholder whose content is synthesized per-machine by
    /// ComputedFilesManager rather than shipped as image bytes.
    ComputedFile { source: String },
}

/// A named, immutable filesystem description plus optional filter and
/// triggers. Never mutated after construction; `ImageManager` hands out
/// shared references.
#[derive(Debug, Clone)]
pub struct Image {
    pub name: String,
    pub inodes: HashMap<String, Inode>,
    /// Paths matching any of these are exempt from convergence. `None`
    /// marks a sparse image, eligible as the default image.
    pub filter: Option<Vec<Regex>>,
    /// Services to restart when specific paths change.
    pub triggers: Vec<Trigger>,
}

#[derive(Debug, Clone)]
pub struct Trigger {
    pub paths: Vec<String>,
    pub service: String,
}

impl Image {
    pub fn is_sparse(&self) -> bool {
        self.filter.is_none()
    }

    pub fn is_filtered(&self, path: &str) -> bool {
        match &self.filter {
            None => false,
            Some(patterns) => patterns.iter().any(|p| p.is_match(path)),
        }
    }
}

/// One change from the image server's update subscription.
#[derive(Debug, Clone)]
pub struct ImageUpdate {
    pub name: String,
    pub directory: String,
    pub op: ImageUpdateOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageUpdateOp {
    AddImage,
    DeleteImage,
    MakeDirectory,
}
