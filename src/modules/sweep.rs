//! Unmounting: single attempts, the idle sweep, shutdown, reconciliation
//! with the system mount table and full re-initialisation.

use anyhow::Result;
use log::{debug, info, warn};
use std::time::SystemTime;

use super::controller::Controller;
use super::error::ControllerError;
use super::mount::UnmountOutcome;
use super::namespace::{MountState, VnodeId};

/// Outcome of an unmount attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountStatus {
    /// The node was not mounted
    AlreadyUnmounted,
    /// The filesystem was unmounted
    Unmounted,
    /// The node, or something below it, is in use
    Busy,
    /// The unmount helper failed
    Failed,
}

impl Controller {
    /// Tries to unmount node `id` without force.
    ///
    /// A transient node that ends up unmounted and childless is destroyed.
    pub fn attempt_unmount(&mut self, id: VnodeId) -> Result<UnmountStatus> {
        let status = self.unmount_vnode(id, false)?;
        if status == UnmountStatus::Unmounted {
            self.reap(id)?;
        }
        Ok(status)
    }

    /// Runs the unmount helper for a mounted node.
    ///
    /// On anything but success the node goes back to the state it had.
    pub(crate) fn unmount_vnode(&mut self, id: VnodeId, force: bool) -> Result<UnmountStatus> {
        let node = self
            .node_table
            .get(&id)
            .ok_or(ControllerError::NoSuchNode(id))?;
        let previous = node.state;
        match previous {
            MountState::Unmounted => return Ok(UnmountStatus::AlreadyUnmounted),
            MountState::MountInProgress { .. } | MountState::Unmounting => {
                return Ok(UnmountStatus::Busy)
            }
            MountState::Mounted { .. } => {}
        }
        let mount_point = node.mount_point.clone();
        if self.has_active_descendants(id) {
            debug!("Node {} has active descendants, not unmounting", id);
            return Ok(UnmountStatus::Busy);
        }

        self.vnode_mut(id)?.state = MountState::Unmounting;
        let outcome = self.helper.unmount(&mount_point, force);
        let node = self.vnode_mut(id)?;
        match outcome {
            UnmountOutcome::Unmounted => {
                node.state = MountState::Unmounted;
                info!(
                    "Unmounted {}{}",
                    mount_point.display(),
                    if force { " (forced)" } else { "" }
                );
                Ok(UnmountStatus::Unmounted)
            }
            UnmountOutcome::Busy => {
                node.state = previous;
                debug!("{} is busy", mount_point.display());
                Ok(UnmountStatus::Busy)
            }
            UnmountOutcome::Failed(reason) => {
                node.state = previous;
                warn!("Failed to unmount {}: {}", mount_point.display(), reason);
                Ok(UnmountStatus::Failed)
            }
        }
    }

    /// Destroys `id` if it is an unmounted leaf nobody asked to keep, then
    /// does the same for each ancestor it leaves childless.
    pub(crate) fn reap(&mut self, id: VnodeId) -> Result<bool> {
        let mut reaped = false;
        let mut next = Some(id);
        while let Some(id) = next {
            let Some(node) = self.node_table.get(&id) else {
                break;
            };
            if id == self.root
                || node.persistent
                || node.is_map_root()
                || node.is_active()
                || !node.children.is_empty()
            {
                break;
            }
            next = node.parent;
            self.destroy_vnode(id)?;
            reaped = true;
        }
        Ok(reaped)
    }

    /// Unmounts every mounted node, deepest first.
    ///
    /// With `use_force`, mounts that are busy are unmounted forcibly.
    /// Returns the number of filesystems unmounted.
    pub fn unmount_automounts(&mut self, use_force: bool) -> usize {
        let mut unmounted = 0;
        for id in self.post_order(self.root) {
            if !self.node_table.get(&id).is_some_and(|node| node.is_mounted()) {
                continue;
            }
            let mut status = self.unmount_vnode(id, false);
            if use_force && matches!(status, Ok(UnmountStatus::Busy)) {
                warn!("Forcing unmount of node {}", id);
                status = self.unmount_vnode(id, true);
            }
            match status {
                Ok(UnmountStatus::Unmounted) => {
                    unmounted += 1;
                    if let Err(e) = self.reap(id) {
                        warn!("Could not release node {}: {:#}", id, e);
                    }
                }
                Ok(other) => warn!("Node {} stays mounted: {:?}", id, other),
                Err(e) => warn!("Unmount of node {} failed: {:#}", id, e),
            }
        }
        unmounted
    }

    /// Unmounts every mount that has been idle for at least the idle timeout.
    pub fn check_for_unmounts(&mut self) -> usize {
        let now = SystemTime::now();
        let idle_timeout = self.config.idle_timeout();
        let mut unmounted = 0;

        for id in self.post_order(self.root) {
            let Some(node) = self.node_table.get(&id) else {
                continue;
            };
            if !node.is_mounted() || node.idle_for(now) < idle_timeout {
                continue;
            }
            match self.attempt_unmount(id) {
                Ok(UnmountStatus::Unmounted) => unmounted += 1,
                Ok(status) => debug!("Idle node {} not unmounted: {:?}", id, status),
                Err(e) => warn!("Idle unmount of node {} failed: {:#}", id, e),
            }
        }
        unmounted
    }

    /// Periodic idle sweep.
    pub fn timeout(&mut self) -> usize {
        let unmounted = self.check_for_unmounts();
        if unmounted > 0 {
            info!("Idle sweep unmounted {} filesystem(s)", unmounted);
        }
        unmounted
    }

    /// Reconciles node states with the system mount table.
    ///
    /// Returns the number of nodes whose state was corrected.
    pub fn validate(&mut self) -> usize {
        let mounted = match self.helper.mounted_paths() {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Cannot read the system mount table: {:#}", e);
                return 0;
            }
        };
        let now = SystemTime::now();
        let ids: Vec<VnodeId> = self.node_table.keys().copied().collect();
        let mut corrected = 0;
        let mut vanished = Vec::new();

        for id in ids {
            let Some(node) = self.node_table.get_mut(&id) else {
                continue;
            };
            let present = mounted.contains(&node.mount_point);
            match node.state {
                MountState::Mounted { .. } if !present => {
                    warn!("{} was unmounted externally", node.mount_point.display());
                    node.state = MountState::Unmounted;
                    vanished.push(id);
                    corrected += 1;
                }
                MountState::Unmounted if present && node.source.is_some() => {
                    warn!("{} was mounted externally", node.mount_point.display());
                    node.state = MountState::Mounted { since: now };
                    node.last_activity = now;
                    corrected += 1;
                }
                _ => {}
            }
        }
        for id in vanished {
            if let Err(e) = self.reap(id) {
                warn!("Could not release node {}: {:#}", id, e);
            }
        }
        corrected
    }

    /// Drops all state and rebuilds the namespace from the current maps.
    ///
    /// Mounts still running are abandoned; their helpers' exits are ignored.
    pub fn re_init(&mut self) -> Result<()> {
        info!("Re-initialising the automount namespace");
        self.unmount_automounts(true);

        for (pid, id) in self.pending.drain() {
            warn!("Abandoning mount of node {} (helper {})", id, pid);
        }
        let leftover = self
            .node_table
            .values()
            .filter(|node| node.is_mounted())
            .count();
        if leftover > 0 {
            warn!("Forgetting {} filesystem(s) that are still mounted", leftover);
        }

        self.node_table.clear();
        self.server_table.clear();
        self.map_table.clear();
        self.init_namespace()
    }
}
