//! Request identity: derived objects and their parent chains.
//!
//! A [`DerivedObject`] names one requested artifact: a bucket, a canonical
//! key, an ordered transform chain and an optional parent. Chains are
//! declared child-first and terminate in a root object with no transforms.
//! Objects are immutable after parsing; deadlines travel separately.

mod parser;
mod transform;

pub use parser::{ParseError, parse_request};
pub use transform::{Gravity, OutputFormat, Transform, TransformChain};

/// Which of a bucket's storage backends holds the object's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTarget {
    /// Originals uploaded by clients.
    Basic,
    /// Derived artifacts produced by the engine.
    Transform,
}

/// Identity of a requested artifact.
#[derive(Debug, Clone)]
pub struct DerivedObject {
    /// Bucket the object belongs to.
    pub bucket: String,
    /// Canonical key, stable across identical requests. Empty for bucket
    /// listing requests.
    pub key: String,
    /// Where produced bytes are persisted.
    pub storage_target: StorageTarget,
    /// Operations this object applies to its parent. Empty for originals.
    pub transforms: TransformChain,
    /// Parent in the derivation chain, if any. Finite and acyclic by
    /// construction.
    pub parent: Option<Box<DerivedObject>>,
    /// Gate serving of a cached child on a successful parent HEAD.
    pub check_parent: bool,
    /// Suppress the placeholder on error.
    pub debug: bool,
}

impl DerivedObject {
    /// Plain object with no transforms and no parent.
    pub fn plain(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            storage_target: StorageTarget::Basic,
            transforms: TransformChain::empty(),
            parent: None,
            check_parent: false,
            debug: false,
        }
    }

    /// Whether this object applies any transforms.
    pub fn has_transforms(&self) -> bool {
        !self.transforms.is_empty()
    }

    /// Whether this object derives from a parent.
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// The root of the parent chain: the node with no parent.
    pub fn root(&self) -> &DerivedObject {
        let mut current = self;
        while let Some(parent) = current.parent.as_deref() {
            current = parent;
        }
        current
    }
}
