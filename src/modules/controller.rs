//! The automount controller.
//!
//! Owns the namespace tree and the node, server and map tables, turns lookups
//! into NFS mounts and correlates mount helper exits with the nodes waiting
//! on them. A `Controller` is not thread-safe by itself; the session runs it
//! on a single thread and funnels every request through that thread.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use nix::unistd::{chown, geteuid, Uid};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::config::Config;
use super::constants::*;
use super::error::ControllerError;
use super::host::HostInfo;
use super::map::{AutomountMap, MapEntry, MapKind, MapLoader, MapTarget};
use super::mount::{MountHelper, MountRequest};
use super::namespace::{
    is_valid_name, join_path, path_components, MountSource, MountState, Vnode, VnodeId,
};
use super::server::Server;
use super::sweep::UnmountStatus;
use super::table::Table;

/// A row of the map table.
#[derive(Debug, Clone)]
pub struct MapTableEntry {
    /// Map name, the table key
    pub name: String,
    /// Namespace directory the map was first mounted at
    pub dir: String,
    /// On-disk directory its mounts live under
    pub mountdir: PathBuf,
    /// The shared map
    pub map: Arc<AutomountMap>,
}

/// Per-request mount arguments supplied by the RPC layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountArgs {
    /// Owner of newly created mount points
    pub uid: Option<u32>,
    /// Extra mount options
    pub options: Vec<String>,
}

/// Outcome of [`Controller::automount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomountStatus {
    /// A mount helper is running for the node
    Mounting {
        /// Node being mounted
        node: VnodeId,
        /// Helper process id
        pid: u32,
    },
    /// The directory is usable now: nothing to mount, or the mount finished
    Mounted(VnodeId),
    /// The node was already mounted
    AlreadyMounted(VnodeId),
    /// No map entry matches; the lookup should fail with "no such file"
    NoEntry,
    /// Resolution or the mount failed
    Failed {
        /// Node involved, when one was reached
        node: Option<VnodeId>,
        /// Human-readable cause
        reason: String,
    },
}

/// Outcome of [`Controller::nfsmount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NfsMountStatus {
    /// A helper was launched with this pid
    Started(u32),
    /// A helper with this pid was already running; nothing was launched
    InProgress(u32),
    /// The node is already mounted
    AlreadyMounted,
}

/// A mount helper exit that was matched to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountCompletion {
    /// Node the helper was mounting
    pub node: VnodeId,
    /// Helper exit status
    pub exit_status: i32,
}

impl MountCompletion {
    /// Whether the helper exited with status 0.
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

/// The automount controller.
pub struct Controller {
    pub(crate) config: Config,
    root_map: Arc<AutomountMap>,
    mount_directory: PathBuf,
    pub(crate) root: VnodeId,
    pub(crate) node_table: Table<VnodeId, Vnode>,
    pub(crate) server_table: Table<String, Arc<Server>>,
    pub(crate) map_table: Table<String, MapTableEntry>,
    node_id: VnodeId,
    /// Helper pid -> node waiting on it
    pub(crate) pending: HashMap<u32, VnodeId>,
    host: HostInfo,
    loader: Box<dyn MapLoader + Send>,
    pub(crate) helper: Box<dyn MountHelper + Send>,
}

impl Controller {
    /// Creates a controller and builds the initial namespace.
    ///
    /// # Arguments
    ///
    /// * `config` - Mount directory, master maps and timers
    /// * `host` - Host identity used for map variable substitution
    /// * `loader` - Source of automount maps
    /// * `helper` - Launches mount and unmount helpers
    ///
    /// # Returns
    ///
    /// * `Ok(Controller)` once the root node exists and every loadable master
    ///   map has been mounted
    /// * `Err` if the mount directory cannot be created
    pub fn new(
        config: Config,
        host: HostInfo,
        loader: Box<dyn MapLoader + Send>,
        helper: Box<dyn MountHelper + Send>,
    ) -> Result<Self> {
        make_mount_point(&config.mount_directory, None)?;
        // Mount tables list absolute paths with symlinks resolved.
        let mount_directory = fs::canonicalize(&config.mount_directory).with_context(|| {
            format!(
                "failed to resolve mount directory {}",
                config.mount_directory.display()
            )
        })?;

        let mut controller = Self {
            root_map: Arc::new(build_root_map(&config)),
            config,
            mount_directory,
            root: ROOT_VNODE_ID,
            node_table: Table::new(),
            server_table: Table::new(),
            map_table: Table::new(),
            node_id: ROOT_VNODE_ID,
            pending: HashMap::new(),
            host,
            loader,
            helper,
        };
        controller.init_namespace()?;
        Ok(controller)
    }

    /// Registers the root node and root map, then mounts every master entry.
    pub(crate) fn init_namespace(&mut self) -> Result<()> {
        self.root_map = Arc::new(build_root_map(&self.config));

        let mut root = Vnode::new("/", "/", self.mount_directory.clone(), None);
        root.map = Some(ROOT_MAP_NAME.to_string());
        root.persistent = true;
        self.root = self.register_vnode(root)?;
        self.map_table.insert(
            ROOT_MAP_NAME.to_string(),
            MapTableEntry {
                name: ROOT_MAP_NAME.to_string(),
                dir: "/".to_string(),
                mountdir: self.mount_directory.clone(),
                map: Arc::clone(&self.root_map),
            },
        );

        let root_map = Arc::clone(&self.root_map);
        for entry in &root_map.entries {
            if let MapTarget::Map { name } = &entry.target {
                let dir = join_path("/", &entry.key);
                let mountdir = self.mount_directory.join(&entry.key);
                match self.mountmap(name, &dir, &mountdir) {
                    Ok(id) => debug!("Master map {} at {} is node {}", name, dir, id),
                    Err(e) => warn!("Skipping map {} at {}: {:#}", name, dir, e),
                }
            }
        }
        info!(
            "Namespace ready at {} ({} nodes)",
            self.mount_directory.display(),
            self.node_table.len()
        );
        Ok(())
    }

    /// The mount directory, absolute and with symlinks resolved.
    pub fn mount_directory(&self) -> &Path {
        &self.mount_directory
    }

    /// Id of the namespace root.
    pub fn root_vnode(&self) -> VnodeId {
        self.root
    }

    /// The map backing the top of the namespace.
    pub fn root_map(&self) -> Arc<AutomountMap> {
        Arc::clone(&self.root_map)
    }

    /// Host identity used for map substitution.
    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    /// The configuration the controller was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of nodes in the namespace, the root included.
    pub fn node_count(&self) -> usize {
        self.node_table.len()
    }

    /// Number of distinct servers referenced so far.
    pub fn server_count(&self) -> usize {
        self.server_table.len()
    }

    /// Number of maps in the map table.
    pub fn map_count(&self) -> usize {
        self.map_table.len()
    }

    /// Looks up a map table row by map name.
    pub fn map_table_entry(&self, name: &str) -> Option<&MapTableEntry> {
        self.map_table.get(name)
    }

    // ---------------------------------------------------------------------
    // Node table and tree navigation
    // ---------------------------------------------------------------------

    /// Assigns the next id to `vnode`, stores it and links it to its parent.
    ///
    /// Fails if the parent is unknown or already has a child of that name.
    pub fn register_vnode(&mut self, mut vnode: Vnode) -> Result<VnodeId> {
        if let Some(parent) = vnode.parent {
            if !self.node_table.contains(&parent) {
                return Err(ControllerError::NoSuchNode(parent).into());
            }
            if self.find_child(parent, &vnode.name).is_some() {
                return Err(ControllerError::DuplicateName {
                    parent,
                    name: vnode.name.clone(),
                }
                .into());
            }
        }

        let id = self.node_id;
        self.node_id += 1;
        vnode.id = id;
        let parent = vnode.parent;
        self.node_table.insert(id, vnode);
        if let Some(parent) = parent.and_then(|p| self.node_table.get_mut(&p)) {
            parent.children.push(id);
        }
        Ok(id)
    }

    /// Whether a node with this id exists.
    pub fn vnode_is_registered(&self, id: VnodeId) -> bool {
        self.node_table.contains(&id)
    }

    /// The node registered under `id`, or `None` once it has been destroyed.
    pub fn vnode_with_id(&self, id: VnodeId) -> Option<&Vnode> {
        self.node_table.get(&id)
    }

    pub(crate) fn vnode_mut(&mut self, id: VnodeId) -> Result<&mut Vnode> {
        self.node_table
            .get_mut(&id)
            .ok_or_else(|| ControllerError::NoSuchNode(id).into())
    }

    /// Child of `parent` called `name`.
    pub fn find_child(&self, parent: VnodeId, name: &str) -> Option<VnodeId> {
        let parent = self.node_table.get(&parent)?;
        parent.children.iter().copied().find(|child| {
            self.node_table
                .get(child)
                .is_some_and(|node| node.name == name)
        })
    }

    /// Node at namespace path `path`, if it exists.
    pub fn lookup_path(&self, path: &str) -> Option<VnodeId> {
        let mut current = self.root;
        for name in path_components(path).ok()? {
            current = self.find_child(current, name)?;
        }
        Some(current)
    }

    /// Detaches a childless node from its parent and from the node table.
    ///
    /// The node is handed back intact; nothing on disk is touched.
    pub fn remove_vnode(&mut self, id: VnodeId) -> Result<Vnode> {
        if id == self.root {
            return Err(ControllerError::RootNode.into());
        }
        let node = self
            .node_table
            .get(&id)
            .ok_or(ControllerError::NoSuchNode(id))?;
        if !node.children.is_empty() {
            return Err(ControllerError::HasChildren(id).into());
        }
        let parent = node.parent;

        let mut vnode = self
            .node_table
            .remove(&id)
            .ok_or(ControllerError::NoSuchNode(id))?;
        if let Some(parent) = parent.and_then(|p| self.node_table.get_mut(&p)) {
            parent.children.retain(|child| *child != id);
        }
        vnode.parent = None;
        Ok(vnode)
    }

    /// Releases what a detached node still holds: its pid correlation, its
    /// map (when no other node uses it) and its mount-point directory.
    pub fn free_vnode(&mut self, vnode: Vnode) {
        self.pending.retain(|_, node| *node != vnode.id);

        if let Some(map) = vnode.map.as_deref() {
            let in_use = map == ROOT_MAP_NAME
                || self
                    .node_table
                    .values()
                    .any(|node| node.map.as_deref() == Some(map));
            if !in_use {
                self.map_table.remove(map);
                debug!("Released map {}", map);
            }
        }

        if vnode.mount_point != self.mount_directory {
            if let Err(e) = fs::remove_dir(&vnode.mount_point) {
                debug!(
                    "Left mount point {} in place: {}",
                    vnode.mount_point.display(),
                    e
                );
            }
        }
    }

    /// Tears down `id` and everything below it: unmount, detach, free.
    pub fn destroy_vnode(&mut self, id: VnodeId) -> Result<()> {
        if id == self.root {
            return Err(ControllerError::RootNode.into());
        }
        let children = self
            .node_table
            .get(&id)
            .ok_or(ControllerError::NoSuchNode(id))?
            .children
            .clone();
        for child in children {
            self.destroy_vnode(child)?;
        }

        match self.node_table.get(&id).map(|node| node.state) {
            Some(MountState::Mounted { .. }) => {
                if self.unmount_vnode(id, false)? != UnmountStatus::Unmounted {
                    return Err(ControllerError::Busy(id).into());
                }
            }
            Some(MountState::MountInProgress { .. }) | Some(MountState::Unmounting) => {
                return Err(ControllerError::Busy(id).into());
            }
            _ => {}
        }

        let vnode = self.remove_vnode(id)?;
        info!("Destroyed node {} ({})", id, vnode.path);
        self.free_vnode(vnode);
        Ok(())
    }

    /// Ids of `start` and its descendants, children before parents.
    pub(crate) fn post_order(&self, start: VnodeId) -> Vec<VnodeId> {
        let mut order = Vec::new();
        let mut stack = vec![(start, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if let Some(node) = self.node_table.get(&id) {
                stack.push((id, true));
                for child in node.children.iter().rev() {
                    stack.push((*child, false));
                }
            }
        }
        order
    }

    /// `true` if any node strictly below `id` is mounted or mid-transition.
    pub(crate) fn has_active_descendants(&self, id: VnodeId) -> bool {
        self.post_order(id)
            .into_iter()
            .filter(|node| *node != id)
            .any(|node| self.node_table.get(&node).is_some_and(Vnode::is_active))
    }

    // ---------------------------------------------------------------------
    // Paths, maps and servers
    // ---------------------------------------------------------------------

    /// Ensures every component of `path` exists as a node and a directory.
    pub fn create_path(&mut self, path: &str) -> Result<VnodeId> {
        self.create_path_with_uid(path, None)
    }

    /// Like [`create_path`](Self::create_path), with new directories owned by
    /// `uid`.
    ///
    /// Stops at the first directory that cannot be created. Ancestors created
    /// before that point stay registered.
    pub fn create_path_with_uid(&mut self, path: &str, uid: Option<u32>) -> Result<VnodeId> {
        let mut current = self.root;
        let mut current_path = String::from("/");

        for name in path_components(path)? {
            current_path = join_path(&current_path, name);
            if let Some(child) = self.find_child(current, name) {
                current = child;
                continue;
            }

            let mount_point = self
                .node_table
                .get(&current)
                .ok_or(ControllerError::NoSuchNode(current))?
                .mount_point
                .join(name);
            make_mount_point(&mount_point, uid)?;

            let mut vnode = Vnode::new(name, current_path.clone(), mount_point, Some(current));
            vnode.uid = uid;
            current = self.register_vnode(vnode)?;
            debug!("Created {} as node {}", current_path, current);
        }
        Ok(current)
    }

    /// The shared record for server `name`, created on first use.
    pub fn server_with_name(&mut self, name: &str) -> Arc<Server> {
        if let Some(server) = self.server_table.get(name) {
            return Arc::clone(server);
        }
        let server = Arc::new(Server::new(name));
        self.server_table
            .insert(name.to_string(), Arc::clone(&server));
        debug!("Registered server {}", name);
        server
    }

    /// Mounts `map` under the name `name` at namespace directory `dir`.
    ///
    /// A map already in the map table under `name` is reused instead of
    /// `map`. Direct map entries get their nodes right away.
    ///
    /// # Returns
    ///
    /// The id of the node at `dir`.
    pub fn auto_map(
        &mut self,
        map: Arc<AutomountMap>,
        name: &str,
        dir: &str,
        mountdir: &Path,
    ) -> Result<VnodeId> {
        self.auto_map_nested(map, name, dir, mountdir, 0)
    }

    fn auto_map_nested(
        &mut self,
        map: Arc<AutomountMap>,
        name: &str,
        dir: &str,
        mountdir: &Path,
        depth: usize,
    ) -> Result<VnodeId> {
        if depth > MAX_MAP_NESTING {
            return Err(anyhow!(
                "maps nested more than {} deep at {}",
                MAX_MAP_NESTING,
                dir
            ));
        }
        let mountdir = canonical_path(mountdir)?;
        let mountdir = mountdir.as_path();

        let map = match self.map_table.get(name) {
            Some(entry) => Arc::clone(&entry.map),
            None => {
                self.map_table.insert(
                    name.to_string(),
                    MapTableEntry {
                        name: name.to_string(),
                        dir: dir.to_string(),
                        mountdir: mountdir.to_path_buf(),
                        map: Arc::clone(&map),
                    },
                );
                map
            }
        };

        let id = self.create_path(dir)?;
        if id == self.root {
            return Err(ControllerError::InvalidPath(dir.to_string()).into());
        }
        {
            let node = self.vnode_mut(id)?;
            if node.map.as_deref() == Some(name) {
                return Ok(id);
            }
            node.map = Some(name.to_string());
            node.persistent = true;
            if node.mount_point != mountdir {
                if node.children.is_empty() {
                    make_mount_point(mountdir, None)?;
                    node.mount_point = mountdir.to_path_buf();
                } else {
                    warn!(
                        "{} already has children; keeping mount point {}",
                        dir,
                        node.mount_point.display()
                    );
                }
            }
        }
        info!("Mounted map {} at {} (node {})", name, dir, id);

        if map.is_direct() {
            for entry in &map.entries {
                let path = join_path(dir, &entry.key);
                let target = entry.resolve(&entry.key, &self.host);
                match self.materialize(&path, target, None, depth + 1) {
                    Ok(child) => self.vnode_mut(child)?.persistent = true,
                    Err(e) => warn!("Skipping {} in map {}: {:#}", entry.key, name, e),
                }
            }
        }
        Ok(id)
    }

    /// Mounts the map called `mapname` at `dir`, loading it on first use.
    pub fn mountmap(&mut self, mapname: &str, dir: &str, mountdir: &Path) -> Result<VnodeId> {
        self.mountmap_nested(mapname, dir, mountdir, 0)
    }

    fn mountmap_nested(
        &mut self,
        mapname: &str,
        dir: &str,
        mountdir: &Path,
        depth: usize,
    ) -> Result<VnodeId> {
        let map = match self.map_table.get(mapname) {
            Some(entry) => Arc::clone(&entry.map),
            None => {
                let loaded = self
                    .loader
                    .load(mapname)
                    .with_context(|| format!("failed to load map {}", mapname))?
                    .ok_or_else(|| ControllerError::NoSuchMap(mapname.to_string()))?;
                debug!("Loaded map {} ({} entries)", mapname, loaded.len());
                Arc::new(loaded)
            }
        };
        self.auto_map_nested(map, mapname, dir, mountdir, depth)
    }

    /// Creates the node for a resolved map entry at `path`.
    fn materialize(
        &mut self,
        path: &str,
        target: MapTarget,
        uid: Option<u32>,
        depth: usize,
    ) -> Result<VnodeId> {
        match target {
            MapTarget::Nfs {
                server,
                path: export,
                options,
            } => {
                let id = self.create_path_with_uid(path, uid)?;
                self.server_with_name(&server);
                self.vnode_mut(id)?.source = Some(MountSource {
                    server,
                    path: export,
                    options,
                });
                Ok(id)
            }
            MapTarget::Map { name } => {
                let mountdir = self.mount_point_for(path)?;
                self.mountmap_nested(&name, path, &mountdir, depth)
            }
        }
    }

    /// Where `create_path(path)` puts its last directory, without creating it.
    fn mount_point_for(&self, path: &str) -> Result<PathBuf> {
        let mut current = Some(self.root);
        let mut mount_point = self.mount_directory.clone();
        for name in path_components(path)? {
            current = current.and_then(|id| self.find_child(id, name));
            match current.and_then(|id| self.node_table.get(&id)) {
                Some(node) => mount_point = node.mount_point.clone(),
                None => mount_point.push(name),
            }
        }
        Ok(mount_point)
    }

    // ---------------------------------------------------------------------
    // Lookups and mounts
    // ---------------------------------------------------------------------

    /// Resolves a lookup of `dir` inside node `id` and mounts what it names.
    ///
    /// This is the entry point for the RPC service. Errors never escape; they
    /// are reported as [`AutomountStatus::Failed`].
    pub fn automount(&mut self, id: VnodeId, dir: &str, args: &MountArgs) -> AutomountStatus {
        match self.resolve_lookup(id, dir, args) {
            Ok(status) => status,
            Err(e) => {
                warn!("Lookup of {} in node {} failed: {:#}", dir, id, e);
                AutomountStatus::Failed {
                    node: None,
                    reason: format!("{:#}", e),
                }
            }
        }
    }

    fn resolve_lookup(
        &mut self,
        id: VnodeId,
        dir: &str,
        args: &MountArgs,
    ) -> Result<AutomountStatus> {
        let parent = self
            .node_table
            .get(&id)
            .ok_or(ControllerError::NoSuchNode(id))?;
        if !is_valid_name(dir) {
            return Ok(AutomountStatus::NoEntry);
        }
        let parent_path = parent.path.clone();
        let parent_map = parent.map.clone();

        let child = match self.find_child(id, dir) {
            Some(child) => child,
            None => {
                let Some(map_name) = parent_map else {
                    return Ok(AutomountStatus::NoEntry);
                };
                let map = self
                    .map_table
                    .get(&map_name)
                    .map(|entry| Arc::clone(&entry.map))
                    .ok_or(ControllerError::NoSuchMap(map_name))?;
                // Direct map entries were created when the map was mounted.
                if map.is_direct() {
                    return Ok(AutomountStatus::NoEntry);
                }
                let Some(entry) = map.lookup(dir) else {
                    debug!("No entry for {} in map {}", dir, map.name);
                    return Ok(AutomountStatus::NoEntry);
                };
                let target = entry.resolve(dir, &self.host);
                self.materialize(&join_path(&parent_path, dir), target, args.uid, 0)?
            }
        };
        Ok(self.mount_resolved(child, args))
    }

    fn mount_resolved(&mut self, id: VnodeId, args: &MountArgs) -> AutomountStatus {
        let mountable = self
            .node_table
            .get(&id)
            .is_some_and(|node| node.source.is_some());
        if !mountable {
            return AutomountStatus::Mounted(id);
        }

        match self.nfsmount_with_options(id, args.uid, &args.options) {
            Ok(NfsMountStatus::AlreadyMounted) => {
                self.touch_vnode(id);
                AutomountStatus::AlreadyMounted(id)
            }
            Ok(NfsMountStatus::Started(pid)) | Ok(NfsMountStatus::InProgress(pid)) => {
                AutomountStatus::Mounting { node: id, pid }
            }
            Err(e) => {
                if let Err(reap_error) = self.reap(id) {
                    warn!("Could not release node {}: {:#}", id, reap_error);
                }
                AutomountStatus::Failed {
                    node: Some(id),
                    reason: format!("{:#}", e),
                }
            }
        }
    }

    /// Starts an NFS mount for node `id`.
    ///
    /// A node that is already mounted or being mounted is left alone, so a
    /// second call never launches a second helper.
    pub fn nfsmount(&mut self, id: VnodeId, uid: Option<u32>) -> Result<NfsMountStatus> {
        self.nfsmount_with_options(id, uid, &[])
    }

    fn nfsmount_with_options(
        &mut self,
        id: VnodeId,
        uid: Option<u32>,
        extra_options: &[String],
    ) -> Result<NfsMountStatus> {
        let node = self
            .node_table
            .get(&id)
            .ok_or(ControllerError::NoSuchNode(id))?;
        match node.state {
            MountState::Mounted { .. } => return Ok(NfsMountStatus::AlreadyMounted),
            MountState::MountInProgress { pid, .. } => return Ok(NfsMountStatus::InProgress(pid)),
            MountState::Unmounting => return Err(ControllerError::Busy(id).into()),
            MountState::Unmounted => {}
        }
        let source = node
            .source
            .clone()
            .ok_or(ControllerError::NotMountable(id))?;
        let mount_point = node.mount_point.clone();
        make_mount_point(&mount_point, uid)?;

        let mut options = source.options.clone();
        for option in self.config.default_options.iter().chain(extra_options) {
            if !options.contains(option) {
                options.push(option.clone());
            }
        }
        let request = MountRequest {
            server: source.server.clone(),
            source: source.path.clone(),
            mount_point,
            options,
        };

        let server = self.server_with_name(&source.server);
        match self.helper.spawn_mount(&request) {
            Ok(pid) => {
                server.record_mount();
                if uid.is_some() {
                    self.vnode_mut(id)?.uid = uid;
                }
                self.record_mount_in_progress(id, pid)?;
                info!(
                    "Mounting {} on {} (helper {})",
                    request.remote(),
                    request.mount_point.display(),
                    pid
                );
                Ok(NfsMountStatus::Started(pid))
            }
            Err(e) => {
                self.vnode_mut(id)?.last_failure = Some(SPAWN_FAILURE_STATUS);
                error!("Could not launch mount helper for node {}: {:#}", id, e);
                Err(e)
            }
        }
    }

    /// Marks node `id` as being mounted by helper `pid`.
    pub fn record_mount_in_progress(&mut self, id: VnodeId, pid: u32) -> Result<()> {
        let node = self.vnode_mut(id)?;
        node.state = MountState::MountInProgress {
            pid,
            started: SystemTime::now(),
        };
        node.last_failure = None;
        self.pending.insert(pid, id);
        Ok(())
    }

    /// Applies the exit of mount helper `pid` to the node waiting on it.
    ///
    /// Exits that match no waiting node are ignored and return `None`.
    pub fn complete_mount_in_progress(
        &mut self,
        pid: u32,
        exit_status: i32,
    ) -> Option<MountCompletion> {
        let Some(id) = self.pending.remove(&pid) else {
            debug!("Ignoring exit of unknown helper {} ({})", pid, exit_status);
            return None;
        };
        let Some(node) = self.node_table.get_mut(&id) else {
            debug!("Helper {} finished for node {} which is gone", pid, id);
            return None;
        };
        match node.state {
            MountState::MountInProgress { pid: waiting, .. } if waiting == pid => {}
            other => {
                debug!("Node {} is {}, ignoring helper {}", id, other, pid);
                return None;
            }
        }

        let now = SystemTime::now();
        if exit_status == 0 {
            node.state = MountState::Mounted { since: now };
            node.last_activity = now;
            node.last_failure = None;
            info!("Mounted {} (node {})", node.path, id);
        } else {
            node.state = MountState::Unmounted;
            node.last_failure = Some(exit_status);
            warn!(
                "Mount of {} failed with status {} (node {})",
                node.path, exit_status, id
            );
            if let Err(e) = self.reap(id) {
                warn!("Could not release node {}: {:#}", id, e);
            }
        }
        Some(MountCompletion {
            node: id,
            exit_status,
        })
    }

    /// Records a use of node `id` for the idle sweep.
    pub fn touch_vnode(&mut self, id: VnodeId) {
        if let Some(node) = self.node_table.get_mut(&id) {
            node.last_activity = SystemTime::now();
        }
    }

    // ---------------------------------------------------------------------
    // Diagnostics
    // ---------------------------------------------------------------------

    /// The whole tree, one node per line, indented by depth.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        self.print_node(self.root, 0, &mut out);
        out
    }

    /// Logs the tree dump.
    pub fn print_tree(&self) {
        for line in self.render_tree().lines() {
            info!("{}", line);
        }
    }

    /// Appends node `id` and its subtree to `out`, starting at depth `level`.
    pub fn print_node(&self, id: VnodeId, level: usize, out: &mut String) {
        let Some(node) = self.node_table.get(&id) else {
            return;
        };
        let _ = write!(
            out,
            "{:indent$}{} [{}] {} {}",
            "",
            node.name,
            node.id,
            node.state,
            node.mount_point.display(),
            indent = level * 2
        );
        if let Some(source) = &node.source {
            let _ = write!(out, " <- {}", source.remote());
        }
        if let Some(map) = &node.map {
            let _ = write!(out, " (map {})", map);
        }
        out.push('\n');
        for child in &node.children {
            self.print_node(*child, level + 1, out);
        }
    }
}

fn build_root_map(config: &Config) -> AutomountMap {
    config.maps.iter().fold(
        AutomountMap::new(ROOT_MAP_NAME, MapKind::Indirect),
        |map, entry| map.with_entry(MapEntry::map(entry.directory.trim_matches('/'), &entry.map)),
    )
}

/// `path` made absolute with symlinks resolved, as far as it exists.
///
/// Components that do not exist yet are appended unchanged.
fn canonical_path(path: &Path) -> Result<PathBuf> {
    for ancestor in path.ancestors() {
        let existing = if ancestor.as_os_str().is_empty() {
            Path::new(".")
        } else {
            ancestor
        };
        if let Ok(resolved) = fs::canonicalize(existing) {
            let rest = path.strip_prefix(ancestor).unwrap_or(Path::new(""));
            return Ok(if rest.as_os_str().is_empty() {
                resolved
            } else {
                resolved.join(rest)
            });
        }
    }
    Err(anyhow!("cannot resolve {}", path.display()))
}

/// Creates `path` (and missing parents) as a mount point owned by `uid`.
pub(crate) fn make_mount_point(path: &Path, uid: Option<u32>) -> Result<()> {
    let failed = |source: io::Error| ControllerError::CreateDirectory {
        path: path.to_path_buf(),
        source,
    };
    DirBuilder::new()
        .recursive(true)
        .mode(DEFAULT_PERMISSION)
        .create(path)
        .map_err(failed)?;
    if let Some(uid) = uid {
        if uid != geteuid().as_raw() {
            chown(path, Some(Uid::from_raw(uid)), None)
                .map_err(|errno| failed(io::Error::from(errno)))?;
        }
    }
    Ok(())
}
