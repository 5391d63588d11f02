use anyhow::Result;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use super::error::ControllerError;

/// Process-unique node id. Ids increase monotonically and are never reused.
pub type VnodeId = u64;

/// Mount lifecycle of a namespace node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// Nothing is mounted on the node
    Unmounted,
    /// A mount helper is running for the node
    MountInProgress {
        /// Process id of the helper; the join key for its completion
        pid: u32,
        /// Wall-clock launch time
        started: SystemTime,
    },
    /// The remote filesystem is mounted
    Mounted {
        /// When the mount completed
        since: SystemTime,
    },
    /// An unmount helper is running for the node
    Unmounting,
}

impl MountState {
    /// Short label used in tree dumps.
    pub fn label(&self) -> &'static str {
        match self {
            MountState::Unmounted => "unmounted",
            MountState::MountInProgress { .. } => "mounting",
            MountState::Mounted { .. } => "mounted",
            MountState::Unmounting => "unmounting",
        }
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Remote filesystem a node mounts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSource {
    /// Server hostname, also the key into the server table
    pub server: String,
    /// Exported path on the server
    pub path: String,
    /// Mount options passed to the helper
    pub options: Vec<String>,
}

impl MountSource {
    /// `server:path` as handed to the mount helper.
    pub fn remote(&self) -> String {
        format!("{}:{}", self.server, self.path)
    }
}

/// A node of the automount namespace.
///
/// Parent and child links hold ids into the controller's node table; the
/// parent link is a back-reference and the child list is owned by the node.
/// Only the controller's tree operations change them.
#[derive(Debug, Clone)]
pub struct Vnode {
    pub(crate) id: VnodeId,
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) mount_point: PathBuf,
    pub(crate) parent: Option<VnodeId>,
    pub(crate) children: Vec<VnodeId>,
    pub(crate) map: Option<String>,
    pub(crate) source: Option<MountSource>,
    pub(crate) persistent: bool,
    pub(crate) state: MountState,
    pub(crate) uid: Option<u32>,
    pub(crate) last_activity: SystemTime,
    pub(crate) last_failure: Option<i32>,
}

impl Vnode {
    /// Creates an unregistered node. The id is assigned on registration.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        mount_point: impl Into<PathBuf>,
        parent: Option<VnodeId>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            path: path.into(),
            mount_point: mount_point.into(),
            parent,
            children: Vec::new(),
            map: None,
            source: None,
            persistent: false,
            state: MountState::Unmounted,
            uid: None,
            last_activity: SystemTime::now(),
            last_failure: None,
        }
    }

    /// Node id.
    pub fn id(&self) -> VnodeId {
        self.id
    }

    /// Last path component; `/` for the root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute namespace path, e.g. `/net/host/share`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// On-disk directory the remote filesystem is mounted on.
    pub fn mount_point(&self) -> &std::path::Path {
        &self.mount_point
    }

    /// Parent id; `None` for the root.
    pub fn parent(&self) -> Option<VnodeId> {
        self.parent
    }

    /// Child ids in creation order.
    pub fn children(&self) -> &[VnodeId] {
        &self.children
    }

    /// Name of the map rooted at this node, if any.
    pub fn map(&self) -> Option<&str> {
        self.map.as_deref()
    }

    /// What gets mounted here, if anything.
    pub fn source(&self) -> Option<&MountSource> {
        self.source.as_ref()
    }

    /// Current mount state.
    pub fn state(&self) -> MountState {
        self.state
    }

    /// Owner uid of the mount point, when one was requested.
    pub fn uid(&self) -> Option<u32> {
        self.uid
    }

    /// Exit status of the last failed mount attempt.
    pub fn last_failure(&self) -> Option<i32> {
        self.last_failure
    }

    /// Last lookup or mount, used by the idle sweep.
    pub fn last_activity(&self) -> SystemTime {
        self.last_activity
    }

    /// Whether a map is mounted at this node.
    pub fn is_map_root(&self) -> bool {
        self.map.is_some()
    }

    /// Whether a filesystem is mounted here.
    pub fn is_mounted(&self) -> bool {
        matches!(self.state, MountState::Mounted { .. })
    }

    /// Mounted or in the middle of a mount/unmount.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, MountState::Unmounted)
    }

    /// Time since the node was last mounted or looked up.
    pub fn idle_for(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_activity).unwrap_or_default()
    }
}

/// Splits a namespace path into its components.
///
/// Empty and `.` components are skipped; `..` is rejected so a path can never
/// climb out of the namespace.
pub fn path_components(path: &str) -> Result<Vec<&str>> {
    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(ControllerError::InvalidPath(path.to_string()).into()),
            name => components.push(name),
        }
    }
    Ok(components)
}

/// Appends `name` to the namespace path `base`.
pub fn join_path(base: &str, name: &str) -> String {
    let name = name.trim_matches('/');
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Returns `true` if `name` can be used as a single directory name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_vnode_is_unmounted() {
        let node = Vnode::new("share", "/net/host/share", "/automount/net/host/share", Some(3));

        assert_eq!(node.state(), MountState::Unmounted);
        assert_eq!(node.parent(), Some(3));
        assert!(node.children().is_empty());
        assert!(!node.is_map_root());
        assert!(!node.is_active());
    }

    #[test]
    fn test_path_components() -> Result<()> {
        assert_eq!(path_components("/net/host/share")?, vec!["net", "host", "share"]);
        assert_eq!(path_components("net//host/./")?, vec!["net", "host"]);
        assert!(path_components("/").map(|c| c.is_empty())?);
        Ok(())
    }

    #[test]
    fn test_path_components_rejects_parent() {
        let err = path_components("/net/../etc").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ControllerError>(),
            Some(ControllerError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "net"), "/net");
        assert_eq!(join_path("/net", "host"), "/net/host");
        assert_eq!(join_path("/net/", "/host"), "/net/host");
    }

    #[test]
    fn test_is_valid_name() {
        assert!(is_valid_name("share"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name(".."));
        assert!(!is_valid_name("a/b"));
    }

    #[test]
    fn test_idle_for() {
        let mut node = Vnode::new("a", "/a", "/tmp/a", None);
        node.last_activity = SystemTime::now() - Duration::from_secs(30);
        assert!(node.idle_for(SystemTime::now()) >= Duration::from_secs(30));
    }

    #[test]
    fn test_mount_source_remote() {
        let source = MountSource {
            server: "fs1".into(),
            path: "/export/home".into(),
            options: vec![],
        };
        assert_eq!(source.remote(), "fs1:/export/home");
    }
}
