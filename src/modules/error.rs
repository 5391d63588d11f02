//! Error taxonomy of the controller.
//!
//! Fallible operations return `anyhow::Result`; the variants below are the
//! typed causes callers can recover with `downcast_ref::<ControllerError>()`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::namespace::VnodeId;

/// Errors raised by namespace, map and mount operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// No node is registered under the id.
    #[error("no such node: {0}")]
    NoSuchNode(VnodeId),

    /// The map loader has no map with this name.
    #[error("no such map: {0}")]
    NoSuchMap(String),

    /// A namespace path contained `..` or was otherwise unusable.
    #[error("invalid namespace path: {0:?}")]
    InvalidPath(String),

    /// The node has no server/path to mount from.
    #[error("node {0} has no mount source")]
    NotMountable(VnodeId),

    /// The node (or something below it) is in use.
    #[error("node {0} is busy")]
    Busy(VnodeId),

    /// The namespace root can never be detached or destroyed.
    #[error("the namespace root cannot be removed")]
    RootNode,

    /// The node still owns children and cannot be detached on its own.
    #[error("node {0} still has children")]
    HasChildren(VnodeId),

    /// A sibling with the same name already exists.
    #[error("{name:?} already exists under node {parent}")]
    DuplicateName {
        /// Parent node id
        parent: VnodeId,
        /// Conflicting name
        name: String,
    },

    /// The on-disk mount point could not be created.
    #[error("failed to create mount point {}: {source}", path.display())]
    CreateDirectory {
        /// Directory that could not be created
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}
