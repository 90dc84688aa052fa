//! Pending metadata operations and their write-back to image files.
//!
//! Edits are appended to the `pending_operations` log by [`MetadataService`],
//! reduced by the [`conflation`] pass and applied to disk by a
//! [`MetadataWriter`], normally [`ExifToolWriter`].

pub mod conflation;
pub mod edit;
pub mod exiftool;
pub mod service;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use conflation::{conflate, ConflatedOperation, Conflation, ConflationEngine, ImageBatch};
pub use edit::{FaceRegion, FieldEdit};
pub use exiftool::{ExifToolWriter, MetadataWriter, WriteError};
pub use service::MetadataService;

/// Which piece of image metadata an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldKind {
    Keyword,
    Caption,
    Description,
    Rating,
    Copyright,
    FaceRegion,
    Rotation,
}

/// How operations on a field kind reduce during conflation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Each payload is an independent member of a set; latest op per payload wins.
    SetValued,
    /// The field holds one value; latest op across all payloads wins.
    SingleValued,
    /// Every op is kept.
    AppendOnly,
}

impl FieldKind {
    pub const ALL: [FieldKind; 7] = [
        FieldKind::Keyword,
        FieldKind::Caption,
        FieldKind::Description,
        FieldKind::Rating,
        FieldKind::Copyright,
        FieldKind::FaceRegion,
        FieldKind::Rotation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Keyword => "keyword",
            FieldKind::Caption => "caption",
            FieldKind::Description => "description",
            FieldKind::Rating => "rating",
            FieldKind::Copyright => "copyright",
            FieldKind::FaceRegion => "face_region",
            FieldKind::Rotation => "rotation",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "keyword" => Some(FieldKind::Keyword),
            "caption" => Some(FieldKind::Caption),
            "description" => Some(FieldKind::Description),
            "rating" => Some(FieldKind::Rating),
            "copyright" => Some(FieldKind::Copyright),
            "face_region" => Some(FieldKind::FaceRegion),
            "rotation" => Some(FieldKind::Rotation),
            _ => None,
        }
    }

    pub fn reduction(&self) -> Reduction {
        match self {
            FieldKind::Keyword => Reduction::SetValued,
            FieldKind::Caption
            | FieldKind::Description
            | FieldKind::Rating
            | FieldKind::Copyright
            | FieldKind::Rotation => Reduction::SingleValued,
            FieldKind::FaceRegion => Reduction::AppendOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Add,
    Remove,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Add => "add",
            OperationType::Remove => "remove",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "add" => Some(OperationType::Add),
            "remove" => Some(OperationType::Remove),
            _ => None,
        }
    }
}

/// Lifecycle of a pending operation. Only moves forward out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    Pending,
    Written,
    Discarded,
    Failed,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::Written => "written",
            OperationState::Discarded => "discarded",
            OperationState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OperationState::Pending),
            "written" => Some(OperationState::Written),
            "discarded" => Some(OperationState::Discarded),
            "failed" => Some(OperationState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationState::Pending)
    }
}

/// A row of the pending-operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub id: i64,
    pub image_id: i64,
    pub field: FieldKind,
    pub op: OperationType,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    pub actor_id: Option<i64>,
    pub state: OperationState,
}

impl PendingOperation {
    /// True when applying `other` would have the same end effect as `self`.
    pub fn same_effect(&self, other: &PendingOperation) -> bool {
        self.field == other.field && self.op == other.op && self.payload == other.payload
    }
}

/// An operation not yet assigned an id.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub image_id: i64,
    pub field: FieldKind,
    pub op: OperationType,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    pub actor_id: Option<i64>,
}

/// A field/value pair as submitted by an editing surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValue {
    pub field: FieldKind,
    pub value: String,
}

impl FieldValue {
    pub fn new(field: FieldKind, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }

    pub fn keyword(value: impl Into<String>) -> Self {
        Self::new(FieldKind::Keyword, value)
    }

    /// Parse `field=value`, e.g. `keyword=sunset` or `rating=4`.
    pub fn parse(s: &str) -> Result<Self, OperationError> {
        let (field, value) = s
            .split_once('=')
            .ok_or_else(|| OperationError::MalformedFieldValue(s.to_string()))?;
        let field = FieldKind::from_str(field.trim())
            .ok_or_else(|| OperationError::UnknownField(field.trim().to_string()))?;
        Ok(Self::new(field, value))
    }
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("unknown field kind: {0}")]
    UnknownField(String),

    #[error("expected FIELD=VALUE, got {0:?}")]
    MalformedFieldValue(String),

    #[error("rating must be an integer between 0 and 5, got {0:?}")]
    InvalidRating(String),

    #[error("rotation must be one of 0, 90, 180, 270, got {0:?}")]
    InvalidRotation(String),

    #[error("invalid face region payload: {0}")]
    InvalidFaceRegion(#[from] serde_json::Error),

    #[error("keyword must not be empty")]
    EmptyKeyword,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_kind_roundtrip() {
        for kind in FieldKind::ALL {
            assert_eq!(FieldKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(FieldKind::from_str("Keyword"), None);
    }

    #[test]
    fn test_reduction_by_kind() {
        assert_eq!(FieldKind::Keyword.reduction(), Reduction::SetValued);
        assert_eq!(FieldKind::Rating.reduction(), Reduction::SingleValued);
        assert_eq!(FieldKind::Rotation.reduction(), Reduction::SingleValued);
        assert_eq!(FieldKind::FaceRegion.reduction(), Reduction::AppendOnly);
    }

    #[test]
    fn test_state_terminal() {
        assert!(!OperationState::Pending.is_terminal());
        assert!(OperationState::Written.is_terminal());
        assert!(OperationState::Discarded.is_terminal());
        assert!(OperationState::Failed.is_terminal());
    }

    #[test]
    fn test_parse_field_value() {
        let fv = FieldValue::parse("keyword=Sunset at sea").unwrap();
        assert_eq!(fv, FieldValue::keyword("Sunset at sea"));

        let fv = FieldValue::parse("caption=a=b").unwrap();
        assert_eq!(fv.value, "a=b");

        assert!(matches!(
            FieldValue::parse("colour=red"),
            Err(OperationError::UnknownField(_))
        ));
        assert!(matches!(
            FieldValue::parse("keyword"),
            Err(OperationError::MalformedFieldValue(_))
        ));
    }
}
