//! Test doubles shared by the unit tests.

use anyhow::{bail, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use super::config::Config;
use super::controller::Controller;
use super::host::HostInfo;
use super::map::{AutomountMap, MapEntry, MapKind, StaticMapLoader};
use super::mount::{ExitNotifier, MountHelper, MountRequest, UnmountOutcome};

/// Recorded calls and scripted behaviour of a [`FakeHelper`].
pub(crate) struct FakeState {
    pub next_pid: u32,
    pub mounts: Vec<(u32, MountRequest)>,
    pub unmounts: Vec<(PathBuf, bool)>,
    /// What `mounted_paths` reports. Mounts that exit with status 0 on their
    /// own are added here; tests add the rest with `mark_mounted`.
    pub mounted: HashSet<PathBuf>,
    /// Unmounts of these paths report busy unless forced
    pub busy: HashSet<PathBuf>,
    pub fail_unmount: HashSet<PathBuf>,
    pub fail_spawn: bool,
    /// Exit status reported through `notifier` right after each spawn
    pub auto_exit: Option<i32>,
    pub notifier: Option<ExitNotifier>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            next_pid: 1000,
            mounts: Vec::new(),
            unmounts: Vec::new(),
            mounted: HashSet::new(),
            busy: HashSet::new(),
            fail_unmount: HashSet::new(),
            fail_spawn: false,
            auto_exit: None,
            notifier: None,
        }
    }
}

/// A [`MountHelper`] that mounts nothing and records every call.
#[derive(Clone, Default)]
pub(crate) struct FakeHelper {
    state: Arc<Mutex<FakeState>>,
}

impl FakeHelper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A helper whose mounts "exit" with `status` as soon as they start.
    pub fn exiting_with(notifier: ExitNotifier, status: i32) -> Self {
        let helper = Self::new();
        {
            let mut state = helper.state();
            state.notifier = Some(notifier);
            state.auto_exit = Some(status);
        }
        helper
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock()
    }

    pub fn mount_count(&self) -> usize {
        self.state().mounts.len()
    }

    /// Makes the system mount table list `path`.
    pub fn mark_mounted(&self, path: &Path) {
        self.state().mounted.insert(path.to_path_buf());
    }

    pub fn set_busy(&self, path: &Path) {
        self.state().busy.insert(path.to_path_buf());
    }
}

impl MountHelper for FakeHelper {
    fn spawn_mount(&mut self, request: &MountRequest) -> Result<u32> {
        let mut state = self.state();
        if state.fail_spawn {
            bail!("no such file or directory: mount");
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        state.mounts.push((pid, request.clone()));
        if state.notifier.is_some() && state.auto_exit == Some(0) {
            state.mounted.insert(request.mount_point.clone());
        }
        let exit = state.notifier.clone().zip(state.auto_exit);
        drop(state);

        if let Some((notifier, status)) = exit {
            notifier(pid, status);
        }
        Ok(pid)
    }

    fn unmount(&mut self, mount_point: &Path, force: bool) -> UnmountOutcome {
        let mut state = self.state();
        state.unmounts.push((mount_point.to_path_buf(), force));
        if state.fail_unmount.contains(mount_point) {
            return UnmountOutcome::Failed("umount: I/O error".to_string());
        }
        if state.busy.contains(mount_point) && !force {
            return UnmountOutcome::Busy;
        }
        state.mounted.remove(mount_point);
        UnmountOutcome::Unmounted
    }

    fn mounted_paths(&mut self) -> Result<HashSet<PathBuf>> {
        Ok(self.state().mounted.clone())
    }
}

/// A controller over a temporary mount directory.
pub(crate) struct Fixture {
    pub dir: TempDir,
    pub controller: Controller,
    pub helper: FakeHelper,
    pub loader: StaticMapLoader,
}

pub(crate) fn test_host() -> HostInfo {
    HostInfo::new("client.example.com", "x86_64", "Linux", "6.8.0")
}

/// Configuration with every mount immediately idle.
pub(crate) fn test_config(dir: &Path, masters: &[(&str, &str)]) -> Config {
    let mut config = Config {
        mount_directory: dir.join("automount"),
        map_directory: dir.join("maps"),
        idle_timeout_secs: 0,
        ..Config::default()
    };
    for (directory, map) in masters {
        config.add_map(directory, map);
    }
    config
}

/// `auto_home`: every user maps to `fs1:/export/home/<user>`.
pub(crate) fn home_map() -> AutomountMap {
    AutomountMap::new("auto_home", MapKind::Indirect)
        .with_entry(MapEntry::nfs("*", "fs1", "/export/home/&"))
}

pub(crate) fn fixture(masters: &[(&str, &str)], maps: Vec<AutomountMap>) -> Result<Fixture> {
    fixture_with(|_| {}, masters, maps)
}

pub(crate) fn fixture_with(
    configure: impl FnOnce(&mut Config),
    masters: &[(&str, &str)],
    maps: Vec<AutomountMap>,
) -> Result<Fixture> {
    let dir = TempDir::new()?;
    let mut config = test_config(dir.path(), masters);
    configure(&mut config);

    let loader = StaticMapLoader::new();
    for map in maps {
        loader.insert(map);
    }
    let helper = FakeHelper::new();
    let controller = Controller::new(
        config,
        test_host(),
        Box::new(loader.clone()),
        Box::new(helper.clone()),
    )?;
    Ok(Fixture {
        dir,
        controller,
        helper,
        loader,
    })
}
