//! RAII guard for workspace lifecycle.
//!
//! A workspace must be reclaimed on every exit path of an attempt,
//! including early returns and panics inside the attempt's task.

use events::{Event, EventBus};
use std::sync::Arc;
use tracing::{debug, warn};
use vcs::{JobWorkspace, WorkspaceAllocator};

use crate::error::Result;

/// Owns an allocated workspace until it is reclaimed.
///
/// Call [`WorkspaceGuard::reclaim`] on the normal path. When the guard is
/// dropped while still holding the workspace, reclamation is spawned on the
/// current runtime.
///
/// # Example
///
/// ```ignore
/// let guard = WorkspaceGuard::new(allocator.clone(), allocated, None);
/// let attempt = worker.execute(job, guard.workspace(), None).await?;
/// guard.reclaim().await?;
/// ```
pub struct WorkspaceGuard {
    allocator: Arc<WorkspaceAllocator>,
    workspace: Option<JobWorkspace>,
    event_bus: Option<EventBus>,
}

impl WorkspaceGuard {
    pub fn new(
        allocator: Arc<WorkspaceAllocator>,
        workspace: JobWorkspace,
        event_bus: Option<EventBus>,
    ) -> Self {
        debug!(
            job_id = %workspace.job_id,
            attempt = workspace.attempt.get(),
            "Workspace guard created"
        );
        Self {
            allocator,
            workspace: Some(workspace),
            event_bus,
        }
    }

    /// The guarded workspace.
    pub fn workspace(&self) -> &JobWorkspace {
        self.workspace
            .as_ref()
            .expect("workspace is only taken by reclaim or drop")
    }

    /// Reclaim now and disarm the guard.
    pub async fn reclaim(mut self) -> Result<()> {
        match self.workspace.take() {
            Some(mut workspace) => {
                let result = self.allocator.reclaim(&mut workspace).await;
                emit_reclaimed(self.event_bus.as_ref(), &workspace);
                result.map_err(Into::into)
            }
            None => Ok(()),
        }
    }
}

fn emit_reclaimed(bus: Option<&EventBus>, workspace: &JobWorkspace) {
    if let Some(bus) = bus {
        bus.emit(Event::WorkspaceReclaimed {
            job_id: workspace.job_id.to_string(),
            attempt: workspace.attempt.get(),
        });
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        let Some(mut workspace) = self.workspace.take() else {
            return;
        };

        warn!(
            job_id = %workspace.job_id,
            attempt = workspace.attempt.get(),
            "Workspace guard dropped without reclaim - spawning cleanup"
        );

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(path = %workspace.path().display(), "No runtime available; workspace left behind");
            return;
        };

        // Cannot await in Drop
        let allocator = Arc::clone(&self.allocator);
        let bus = self.event_bus.take();
        handle.spawn(async move {
            if let Err(e) = allocator.reclaim(&mut workspace).await {
                warn!(
                    job_id = %workspace.job_id,
                    error = %e,
                    "Failed to reclaim workspace in Drop"
                );
            }
            emit_reclaimed(bus.as_ref(), &workspace);
        });
    }
}
