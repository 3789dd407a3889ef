//! Non-fatal notes collected during a flow and attached to its result.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentKind {
    Information,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub kind: CommentKind,
    pub text: String,
}

/// Thread-safe collector shared by every component of a flow.
#[derive(Debug, Clone, Default)]
pub struct CommentCollector {
    inner: Arc<Mutex<Vec<Comment>>>,
}

impl CommentCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: CommentKind, text: impl Into<String>) {
        let text = text.into();
        match kind {
            CommentKind::Information => info!(comment = %text, "flow note"),
            CommentKind::Warning => warn!(comment = %text, "flow warning"),
        }
        // A poisoned lock still holds valid comments.
        let mut comments = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        comments.push(Comment { kind, text });
    }

    pub fn information(&self, text: impl Into<String>) {
        self.add(CommentKind::Information, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.add(CommentKind::Warning, text);
    }

    pub fn comments(&self) -> Vec<Comment> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Drain every comment collected so far.
    pub fn take(&self) -> Vec<Comment> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn has_warnings(&self) -> bool {
        self.comments()
            .iter()
            .any(|c| c.kind == CommentKind::Warning)
    }
}
