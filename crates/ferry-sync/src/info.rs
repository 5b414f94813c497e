//! The persisted per-file record.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cid::Cid;
use ferry_meta::{FieldValue, Record};
use ferry_types::{FileId, FullFileId, cid_set};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lifecycle state of a file. Discriminants are persisted and indexed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileState {
    #[default]
    PendingUpload = 0,
    Uploading = 1,
    Limited = 2,
    PendingDeletion = 3,
    Done = 4,
    Deleted = 5,
}

impl FileState {
    /// Value stored in the `state` index.
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Whether a processing step may move a file from `self` to `next`.
    ///
    /// Re-entering the same state is allowed (rescheduling). Any state may
    /// move to `PendingDeletion`; `Done` and `Deleted` allow nothing else.
    pub fn can_transition_to(self, next: FileState) -> bool {
        use FileState::*;
        if self == next || next == PendingDeletion {
            return true;
        }
        matches!(
            (self, next),
            (PendingUpload, Uploading | Limited | Done)
                | (Uploading, Done | PendingUpload | Limited)
                | (Limited, PendingUpload)
                | (PendingDeletion, Deleted | Done)
        )
    }

    /// Whether no worker picks the file up in this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Done | FileState::Deleted)
    }
}

/// Queue payload describing one file and its residual remote work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Queue key: the object the file belongs to.
    pub object_id: String,
    pub file_id: FileId,
    pub space_id: String,
    pub state: FileState,
    /// Unix milliseconds before which no worker touches the item.
    pub scheduled_at: i64,
    /// Unix milliseconds of the last processing step.
    pub handled_at: i64,
    /// Extra roots walked before `file_id`.
    pub variants: Vec<FileId>,
    pub added_by_user: bool,
    pub imported: bool,
    /// Bytes the last availability check found missing from the space.
    pub bytes_to_upload_or_bind: u64,
    #[serde(with = "cid_set")]
    pub cids_to_upload: BTreeSet<Cid>,
    #[serde(with = "cid_set")]
    pub cids_to_bind: BTreeSet<Cid>,
}

impl FileInfo {
    /// A fresh record in `state`, scheduled now.
    pub fn new(object_id: impl Into<String>, file: FullFileId, state: FileState) -> Self {
        Self {
            object_id: object_id.into(),
            file_id: file.file_id,
            space_id: file.space_id,
            state,
            scheduled_at: unix_ms(SystemTime::now()),
            handled_at: 0,
            variants: Vec::new(),
            added_by_user: false,
            imported: false,
            bytes_to_upload_or_bind: 0,
            cids_to_upload: BTreeSet::new(),
            cids_to_bind: BTreeSet::new(),
        }
    }

    pub fn full_file_id(&self) -> FullFileId {
        FullFileId::new(self.space_id.clone(), self.file_id)
    }

    pub fn scheduled_at(&self) -> SystemTime {
        from_unix_ms(self.scheduled_at)
    }

    /// Make the item eligible `delay` from now.
    pub fn schedule_in(&mut self, delay: Duration) {
        self.scheduled_at = unix_ms(SystemTime::now() + delay);
    }

    pub(crate) fn touch(&mut self) {
        self.handled_at = unix_ms(SystemTime::now());
    }

    /// Move to `next`, logging transitions outside the lifecycle graph.
    pub fn set_state(&mut self, next: FileState) {
        if !self.state.can_transition_to(next) {
            warn!(
                object_id = %self.object_id,
                from = ?self.state,
                to = ?next,
                "unexpected file state transition"
            );
        }
        self.state = next;
    }
}

impl Record for FileInfo {
    const INDEXED: &'static [&'static str] = &["state", "space_id", "scheduled_at"];

    fn id(&self) -> &str {
        &self.object_id
    }

    fn set_id(&mut self, id: &str) {
        self.object_id = id.to_string();
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "state" => Some(self.state.code().into()),
            "space_id" => Some(self.space_id.as_str().into()),
            "scheduled_at" => Some(self.scheduled_at.into()),
            "handled_at" => Some(self.handled_at.into()),
            "file_id" => Some(self.file_id.to_string().into()),
            "bytes_to_upload_or_bind" => Some(self.bytes_to_upload_or_bind.into()),
            _ => None,
        }
    }
}

pub(crate) fn unix_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub(crate) fn from_unix_ms(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}
