use kubeserver_core::{IdentityError, IdentityService, RoleAssignments};
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Holds a snapshot of every role assignment known to the identity service.
pub struct RoleAssignmentCache {
    service: Arc<dyn IdentityService>,
    snapshot: RwLock<RoleAssignments>,
}

impl RoleAssignmentCache {
    /// Creates an empty cache. The first snapshot is loaded by [`Self::reset`].
    pub fn new(service: Arc<dyn IdentityService>) -> Self {
        Self {
            service,
            snapshot: RwLock::new(RoleAssignments::default()),
        }
    }

    pub fn snapshot(&self) -> RoleAssignments {
        self.snapshot.read().clone()
    }

    pub fn get_role_assignments(&self, user_id: &str) -> RoleAssignments {
        self.snapshot.read().for_user(user_id)
    }

    /// Replaces the snapshot with the identity service's current assignments.
    ///
    /// On failure the previous snapshot is kept.
    pub async fn reset(&self) -> Result<usize, IdentityError> {
        let assignments = RoleAssignments::from(self.service.list_role_assignments().await?);
        let len = assignments.len();
        *self.snapshot.write() = assignments;
        debug!(assignments = len, "Refreshed role assignments");
        Ok(len)
    }

    /// Refreshes the snapshot every `interval` until shutdown is signaled.
    ///
    /// The first refresh happens immediately.
    pub async fn run(self: Arc<Self>, interval: Duration, drain: drain::Watch) {
        let mut ticks = time::interval(interval);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    if let Err(error) = self.reset().await {
                        warn!(%error, "Failed to refresh role assignments");
                    }
                }
                _ = &mut shutdown => {
                    info!("Stopping role assignment refresh");
                    return;
                }
            }
        }
    }
}
