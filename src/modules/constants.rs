use std::time::Duration;

// Namespace defaults
/// Root of the automounted namespace on disk.
pub const DEFAULT_MOUNT_DIRECTORY: &str = "/automount";
/// Where map files are looked up by name.
pub const DEFAULT_MAP_DIRECTORY: &str = "/etc/automount";
/// Pid file written by the daemon.
pub const DEFAULT_PID_FILE: &str = "/var/run/automountd.pid";
/// Mode of newly created mount points.
pub const DEFAULT_PERMISSION: u32 = 0o755;

/// First node id handed out. Ids only grow and are never reused, even across
/// re-initialisation.
pub const ROOT_VNODE_ID: u64 = 1;
/// Name of the map built from the master entries.
pub const ROOT_MAP_NAME: &str = "-root";

// Map syntax
/// Map key matching any name.
pub const WILDCARD_KEY: &str = "*";
/// Replaced by the looked-up key in a map location.
pub const KEY_SUBSTITUTION: char = '&';
/// Deepest chain of maps referring to maps.
pub const MAX_MAP_NESTING: usize = 8;

// Timers
/// Idle time after which a mount is unmounted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
/// Period of the validation and idle sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Time allowed to an unmount helper.
pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(10);

// Mount helpers
/// Mount helper program.
pub const DEFAULT_MOUNT_COMMAND: &str = "/sbin/mount";
/// Unmount helper program.
pub const DEFAULT_UMOUNT_COMMAND: &str = "/sbin/umount";
/// Filesystem type passed to the mount helper.
pub const NFS_FSTYPE: &str = "nfs";

/// Exit status recorded when a helper could not be launched at all.
pub const SPAWN_FAILURE_STATUS: i32 = -1;
