//! The opaque operation record.
//!
//! This crate does not interpret the contents of an operation beyond two
//! seams: copy-attribute operations that need pre-resolution against a
//! backend (and may only appear at the head of a batch), and upload-file
//! operations that carry either a source path or a temp-file name inside
//! the processor's upload directory. Everything else is an opaque
//! `serde_json::Value` round-tripped verbatim.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Generate a collision-resistant name for a file copied into a
/// processor's upload directory before an `UploadFile` operation is
/// enqueued. Concurrent uploads across runs must not collide in a shared
/// temp directory.
pub fn new_temp_file_name(extension: &str) -> String {
    format!("{}.{extension}", uuid::Uuid::new_v4())
}

/// Where an upload-file operation's bytes currently live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadSource {
    /// A path the caller supplied directly; stable for the operation's
    /// lifetime.
    Path(PathBuf),
    /// A file name inside the owning processor's upload directory. The
    /// multi-backend replicator copies this file into each secondary
    /// processor's own upload directory before enqueueing the operation
    /// there.
    TempFile(String),
}

/// The subset of operation shapes this crate's core must recognize.
/// Everything else round-trips through `fields` untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Must appear only at the head of a batch; needs pre-resolution
    /// against a backend before it can be sent.
    CopyAttribute,
    /// Carries a reference to file bytes, not the bytes themselves.
    UploadFile(UploadSource),
    /// Any other attribute/series/metadata write. Opaque to this crate.
    Other,
}

/// An opaque operation produced by higher layers, round-tripped through a
/// stable dictionary serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    /// The operation's full payload, as the caller constructed it. This
    /// crate never inspects fields beyond `kind`.
    pub fields: serde_json::Value,
}

impl Operation {
    /// Construct an operation with no special kind — the common case for
    /// ordinary attribute/series writes.
    pub fn new(fields: serde_json::Value) -> Self {
        Self {
            kind: OperationKind::Other,
            fields,
        }
    }

    /// Construct a copy-attribute operation.
    pub fn copy_attribute(fields: serde_json::Value) -> Self {
        Self {
            kind: OperationKind::CopyAttribute,
            fields,
        }
    }

    /// Construct an upload-file operation.
    pub fn upload_file(source: UploadSource, fields: serde_json::Value) -> Self {
        Self {
            kind: OperationKind::UploadFile(source),
            fields,
        }
    }

    /// Stable dictionary serialization.
    pub fn to_dict(&self) -> crate::error::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Inverse of [`Operation::to_dict`].
    pub fn from_dict(value: serde_json::Value) -> crate::error::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Whether this operation must be pre-resolved and may only appear at
    /// the head of a batch.
    pub fn is_copy_attribute(&self) -> bool {
        matches!(self.kind, OperationKind::CopyAttribute)
    }

    /// The temp-file name this operation references, if it is an
    /// upload-file operation sourced from the processor's upload directory.
    pub fn temp_file_name(&self) -> Option<&str> {
        match &self.kind {
            OperationKind::UploadFile(UploadSource::TempFile(name)) => Some(name),
            _ => None,
        }
    }
}
