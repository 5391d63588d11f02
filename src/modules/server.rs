use std::sync::atomic::{AtomicUsize, Ordering};

/// A remote NFS server, shared by every node that mounts from it.
#[derive(Debug)]
pub struct Server {
    name: String,
    mounts: AtomicUsize,
}

impl Server {
    /// Creates a record for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mounts: AtomicUsize::new(0),
        }
    }

    /// Hostname of the server.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of mounts launched against this server.
    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::Relaxed)
    }

    pub(crate) fn record_mount(&self) {
        self.mounts.fetch_add(1, Ordering::Relaxed);
    }
}
