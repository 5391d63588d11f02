#![doc(html_root_url = "https://docs.rs/automountd/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! automountd: an on-demand NFS automounter
//!
//! Presents a directory tree whose entries are mounted from NFS servers the
//! first time they are looked up, and unmounted again after they sit idle.
//!
//! ## Features
//!
//! - Direct and indirect automount maps, nested maps and `*` wildcards
//! - `&` key substitution and host variables (`${HOST}`, `${ARCH}`, ...)
//! - Asynchronous mount helpers, correlated with nodes by process id
//! - Idle sweep, reconciliation with the system mount table and reload
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use automountd::{AutomountMap, Controller, Config, HostInfo, MapEntry, MapKind, MountArgs};
//! use automountd::{CommandHelper, StaticMapLoader};
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut config = Config::default();
//! config.add_map("/home", "auto_home");
//!
//! let loader = StaticMapLoader::new();
//! loader.insert(
//!     AutomountMap::new("auto_home", MapKind::Indirect)
//!         .with_entry(MapEntry::nfs("*", "fileserver", "/export/home/&")),
//! );
//! let helper = CommandHelper::new(&config, Arc::new(|pid, status| {
//!     println!("helper {} exited with {}", pid, status);
//! }));
//!
//! let mut controller = Controller::new(
//!     config,
//!     HostInfo::from_system()?,
//!     Box::new(loader),
//!     Box::new(helper),
//! )?;
//!
//! // A lookup of /home/alice starts `mount fileserver:/export/home/alice`.
//! let home = controller.lookup_path("/home").expect("master map mounted");
//! let status = controller.automount(home, "alice", &MountArgs::default());
//! println!("{:?}", status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Node States
//!
//! - `Unmounted`: nothing is mounted on the node
//! - `MountInProgress`: a mount helper is running for it
//! - `Mounted`: the filesystem is mounted
//! - `Unmounting`: an unmount helper is running for it

pub mod modules;

pub use modules::config::{Config, MasterEntry};
pub use modules::controller::{AutomountStatus, Controller, MountArgs, NfsMountStatus};
pub use modules::daemon::Daemon;
pub use modules::error::ControllerError;
pub use modules::host::HostInfo;
pub use modules::map::{AutomountMap, JsonMapLoader, MapEntry, MapKind, MapLoader, MapTarget, StaticMapLoader};
pub use modules::mount::{CommandHelper, ExitNotifier, MountHelper};
pub use modules::session::{run_timer, Session, SessionHandle};
pub use modules::sweep::UnmountStatus;

// Re-export commonly used types
pub use modules::namespace::{MountState, Vnode, VnodeId};
