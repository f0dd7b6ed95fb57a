//! Cooperative halt/resume subsystem.
//!
//! Halt has two triggers: a STOP file at the planning-directory root and
//! the `halt.requested` flag in state. Workers never observe halt; the
//! scheduler polls `check_halt` at batch boundaries, finishes the in-flight
//! batch, then calls `confirm_halt`. `resume` clears both triggers.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::errors::{CoreError, CoreResult};
use crate::state::document::{HaltState, TaskStatus};
use crate::state::store::StateStore;

/// Name of the halt-signal file.
pub const STOP_FILE: &str = "STOP";

/// Snapshot of the halt subsystem for `halt-status`.
#[derive(Debug, serde::Serialize)]
pub struct HaltStatus {
    pub halted: bool,
    pub stop_file_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<chrono::DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_at: Option<chrono::DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_task: Option<String>,
}

/// Halt/resume operations bound to a planning directory.
pub struct HaltController<'a> {
    store: &'a StateStore,
}

impl<'a> HaltController<'a> {
    pub fn new(store: &'a StateStore) -> Self {
        Self { store }
    }

    fn stop_path(&self) -> PathBuf {
        self.store.dir().join(STOP_FILE)
    }

    /// Record an explicit halt request in state.
    pub fn request_halt(&self, reason: &str, requested_by: &str) -> CoreResult<()> {
        let reason = reason.to_string();
        let requested_by = requested_by.to_string();
        self.store.update(move |doc| {
            doc.halt = Some(HaltState {
                requested: true,
                reason: reason.clone(),
                requested_at: Utc::now(),
                requested_by: requested_by.clone(),
                halted_at: None,
                active_task: None,
            });
            doc.append_event(
                "halt_requested",
                None,
                serde_json::json!({ "reason": reason, "requested_by": requested_by }),
            );
            info!(%reason, "halt requested");
            Ok(())
        })
    }

    /// Check both halt triggers. Polled by the scheduler at batch
    /// boundaries; a positive reading means no new batch may spawn.
    pub fn check_halt(&self) -> CoreResult<bool> {
        if self.stop_path().exists() {
            return Ok(true);
        }
        let doc = self.store.load()?;
        Ok(doc.halt.as_ref().is_some_and(|h| h.requested))
    }

    /// Acknowledge the halt after the in-flight batch has drained.
    ///
    /// Records `halted_at` and the first still-running task, if any. A
    /// STOP-file halt with no prior `halt` request gets a synthesized
    /// halt record so `halt-status` has something to report.
    pub fn confirm_halt(&self) -> CoreResult<()> {
        self.store.update(move |doc| {
            let active_task = doc
                .tasks
                .values()
                .find(|t| t.status == TaskStatus::Running)
                .map(|t| t.id.clone());

            let halt = doc.halt.get_or_insert_with(|| HaltState {
                requested: true,
                reason: "STOP file".to_string(),
                requested_at: Utc::now(),
                requested_by: "stop-file".to_string(),
                halted_at: None,
                active_task: None,
            });
            halt.requested = true;
            halt.halted_at = Some(Utc::now());
            halt.active_task = active_task.clone();

            doc.append_event(
                "halt_confirmed",
                active_task.as_deref(),
                serde_json::Value::Null,
            );
            info!("halt confirmed");
            Ok(())
        })
    }

    /// Clear both triggers and emit `execution_resumed`.
    pub fn resume(&self) -> CoreResult<()> {
        let stop = self.stop_path();
        if stop.exists() {
            fs::remove_file(&stop).map_err(|source| CoreError::IoWriteFailed {
                path: stop.clone(),
                source,
            })?;
        }
        self.store.update(move |doc| {
            if let Some(halt) = doc.halt.as_mut() {
                halt.requested = false;
            }
            doc.append_event("execution_resumed", None, serde_json::Value::Null);
            info!("execution resumed");
            Ok(())
        })
    }

    /// Snapshot for `halt-status`.
    pub fn halt_status(&self) -> CoreResult<HaltStatus> {
        let doc = self.store.load()?;
        let stop_file_present = self.stop_path().exists();
        let halt = doc.halt.as_ref();
        Ok(HaltStatus {
            halted: stop_file_present || halt.is_some_and(|h| h.requested),
            stop_file_present,
            reason: halt.map(|h| h.reason.clone()),
            requested_by: halt.map(|h| h.requested_by.clone()),
            requested_at: halt.map(|h| h.requested_at),
            halted_at: halt.and_then(|h| h.halted_at),
            active_task: halt.and_then(|h| h.active_task.clone()),
        })
    }
}
