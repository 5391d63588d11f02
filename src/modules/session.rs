//! Session management for the automount controller.
//!
//! This module provides the `Session` type, which owns the [`Controller`] on a
//! dedicated message thread. Lookups, helper exits, timer ticks and signals
//! all arrive as messages, so controller state only ever changes on that one
//! thread.

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

use super::controller::{AutomountStatus, Controller, MountArgs};
use super::mount::ExitNotifier;
use super::namespace::VnodeId;

/// Messages that can be sent to the session handler thread.
enum SessionMessage {
    /// Resolve a lookup and mount what it names
    Automount {
        /// Node the lookup happens in
        node: VnodeId,
        /// Name looked up
        directory: String,
        /// Per-request mount arguments
        args: MountArgs,
        /// Receives the final status once any mount has finished
        reply: Sender<AutomountStatus>,
    },
    /// A mount helper exited
    HelperExited {
        /// Helper process id
        pid: u32,
        /// Exit status
        status: i32,
    },
    /// Run the idle sweep
    Timeout,
    /// Reconcile with the system mount table
    Validate,
    /// Rebuild the namespace from the maps
    ReInit,
    /// Unmount everything
    UnmountAll {
        /// Escalate busy mounts to forced unmounts
        force: bool,
        /// Receives the number of filesystems unmounted
        reply: Sender<usize>,
    },
    /// Resolve a namespace path to a node id
    Resolve {
        /// Namespace path
        path: String,
        /// Receives the node id, if any
        reply: Sender<Option<VnodeId>>,
    },
    /// Render the namespace tree
    PrintTree {
        /// Receives the rendered tree
        reply: Sender<String>,
    },
    /// Shutdown the session
    Shutdown,
}

/// Cloneable sender side of a session.
///
/// Every method queues a message for the session thread. Methods that return
/// a value block until the session answers.
#[derive(Clone)]
pub struct SessionHandle {
    message_tx: Sender<SessionMessage>,
}

impl SessionHandle {
    fn send(&self, message: SessionMessage) -> Result<()> {
        self.message_tx
            .send(message)
            .map_err(|_| anyhow!("automount session has shut down"))
    }

    /// Looks up `directory` inside `node`, waiting for any mount it starts.
    ///
    /// # Arguments
    ///
    /// * `node` - Node the lookup happens in
    /// * `directory` - Name being looked up
    /// * `args` - Owner and extra options for a new mount
    ///
    /// # Returns
    ///
    /// * `Ok(AutomountStatus)` once the lookup is fully resolved
    /// * `Err` if the session is gone
    pub fn automount(
        &self,
        node: VnodeId,
        directory: &str,
        args: MountArgs,
    ) -> Result<AutomountStatus> {
        let (reply, response) = channel();
        self.send(SessionMessage::Automount {
            node,
            directory: directory.to_string(),
            args,
            reply,
        })?;
        Ok(response.recv()?)
    }

    /// Reports that mount helper `pid` exited with `status`.
    pub fn helper_exited(&self, pid: u32, status: i32) -> Result<()> {
        self.send(SessionMessage::HelperExited { pid, status })
    }

    /// Callback for mount helpers, forwarding exits to this session.
    pub fn exit_notifier(&self) -> ExitNotifier {
        let handle = self.clone();
        Arc::new(move |pid, status| {
            if let Err(e) = handle.helper_exited(pid, status) {
                debug!("Dropping exit of helper {}: {}", pid, e);
            }
        })
    }

    /// Queues an idle sweep.
    pub fn timeout(&self) -> Result<()> {
        self.send(SessionMessage::Timeout)
    }

    /// Queues a reconciliation with the system mount table.
    pub fn validate(&self) -> Result<()> {
        self.send(SessionMessage::Validate)
    }

    /// Queues a reload of every map.
    pub fn re_init(&self) -> Result<()> {
        self.send(SessionMessage::ReInit)
    }

    /// Unmounts every automounted filesystem and waits for the result.
    pub fn unmount_all(&self, force: bool) -> Result<usize> {
        let (reply, response) = channel();
        self.send(SessionMessage::UnmountAll { force, reply })?;
        Ok(response.recv()?)
    }

    /// Node at namespace path `path`.
    pub fn resolve(&self, path: &str) -> Result<Option<VnodeId>> {
        let (reply, response) = channel();
        self.send(SessionMessage::Resolve {
            path: path.to_string(),
            reply,
        })?;
        Ok(response.recv()?)
    }

    /// The namespace tree as text.
    pub fn print_tree(&self) -> Result<String> {
        let (reply, response) = channel();
        self.send(SessionMessage::PrintTree { reply })?;
        Ok(response.recv()?)
    }

    /// Asks the session thread to stop.
    pub fn shutdown(&self) -> Result<()> {
        self.send(SessionMessage::Shutdown)
    }
}

/// Lookups waiting for a mount helper, keyed by the node being mounted.
type Waiters = HashMap<VnodeId, Vec<Sender<AutomountStatus>>>;

/// The automount service.
///
/// # Example
///
/// ```no_run
/// use automountd::{CommandHelper, Config, Controller, HostInfo, JsonMapLoader, MountArgs, Session};
///
/// # fn main() -> anyhow::Result<()> {
/// let mut config = Config::default();
/// config.add_map("/home", "auto_home");
///
/// let session = Session::start(|notifier| {
///     let helper = CommandHelper::new(&config, notifier);
///     let loader = JsonMapLoader::new(&config.map_directory);
///     Controller::new(config.clone(), HostInfo::from_system()?, Box::new(loader), Box::new(helper))
/// })?;
///
/// let handle = session.handle();
/// if let Some(home) = handle.resolve("/home")? {
///     println!("{:?}", handle.automount(home, "alice", MountArgs::default())?);
/// }
/// session.shutdown()?;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    handle: SessionHandle,
    /// Handle to the message processing thread
    message_thread: Option<JoinHandle<()>>,
}

impl Session {
    /// Starts a session around the controller returned by `build`.
    ///
    /// `build` receives the exit notifier its mount helper must report to.
    ///
    /// # Returns
    ///
    /// * `Ok(Session)` once the message thread is running
    /// * `Err` if `build` fails or the thread cannot be started
    pub fn start<F>(build: F) -> Result<Self>
    where
        F: FnOnce(ExitNotifier) -> Result<Controller>,
    {
        let (message_tx, message_rx) = channel();
        let handle = SessionHandle { message_tx };
        let controller = build(handle.exit_notifier())?;

        let message_thread = thread::Builder::new()
            .name("automount-session".to_string())
            .spawn(move || Self::run_message_handler(message_rx, controller))?;

        info!("Automount session started");
        Ok(Self {
            handle,
            message_thread: Some(message_thread),
        })
    }

    /// A new handle to this session.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    fn run_message_handler(message_rx: Receiver<SessionMessage>, mut controller: Controller) {
        let mut waiters = Waiters::new();

        while let Ok(message) = message_rx.recv() {
            match message {
                SessionMessage::Automount {
                    node,
                    directory,
                    args,
                    reply,
                } => match controller.automount(node, &directory, &args) {
                    AutomountStatus::Mounting { node, pid } => {
                        debug!("Lookup of {} waits for helper {}", directory, pid);
                        waiters.entry(node).or_default().push(reply);
                    }
                    status => {
                        let _ = reply.send(status);
                    }
                },
                SessionMessage::HelperExited { pid, status } => {
                    if let Some(completion) = controller.complete_mount_in_progress(pid, status) {
                        let answer = if completion.succeeded() {
                            AutomountStatus::Mounted(completion.node)
                        } else {
                            AutomountStatus::Failed {
                                node: Some(completion.node),
                                reason: format!("mount helper exited with status {}", status),
                            }
                        };
                        for reply in waiters.remove(&completion.node).unwrap_or_default() {
                            let _ = reply.send(answer.clone());
                        }
                    }
                }
                SessionMessage::Timeout => {
                    controller.timeout();
                }
                SessionMessage::Validate => {
                    controller.validate();
                }
                SessionMessage::ReInit => {
                    fail_waiters(&mut waiters, "namespace re-initialised");
                    if let Err(e) = controller.re_init() {
                        error!("Re-initialisation failed: {:#}", e);
                    }
                }
                SessionMessage::UnmountAll { force, reply } => {
                    let _ = reply.send(controller.unmount_automounts(force));
                }
                SessionMessage::Resolve { path, reply } => {
                    let _ = reply.send(controller.lookup_path(&path));
                }
                SessionMessage::PrintTree { reply } => {
                    controller.print_tree();
                    let _ = reply.send(controller.render_tree());
                }
                SessionMessage::Shutdown => {
                    info!("Received shutdown message");
                    break;
                }
            }
        }
        fail_waiters(&mut waiters, "automount session shut down");
    }

    /// Stops the message thread and waits for it to finish.
    pub fn shutdown(mut self) -> Result<()> {
        info!("Shutting down session");
        self.handle.shutdown()?;
        if let Some(thread) = self.message_thread.take() {
            thread
                .join()
                .map_err(|_| anyhow!("Failed to join message thread"))?;
        }
        Ok(())
    }
}

fn fail_waiters(waiters: &mut Waiters, reason: &str) {
    for (node, replies) in waiters.drain() {
        warn!("Failing {} waiting lookup(s) on node {}: {}", replies.len(), node, reason);
        for reply in replies {
            let _ = reply.send(AutomountStatus::Failed {
                node: Some(node),
                reason: reason.to_string(),
            });
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.message_thread.is_some() {
            if let Err(e) = self.handle.shutdown() {
                error!("Error sending shutdown message: {}", e);
            }
        }
    }
}

/// Drives the periodic work: a validation pass followed by the idle sweep,
/// once per `period`, until the session goes away.
pub async fn run_timer(handle: SessionHandle, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if handle.validate().is_err() || handle.timeout().is_err() {
            debug!("Session closed, stopping the idle timer");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::map::StaticMapLoader;
    use crate::modules::testing::{home_map, test_config, test_host, FakeHelper};
    use tempfile::TempDir;

    fn start(dir: &TempDir, exit_status: Option<i32>) -> Result<(Session, FakeHelper)> {
        let loader = StaticMapLoader::new();
        loader.insert(home_map());
        let config = test_config(dir.path(), &[("/home", "auto_home")]);

        let mut fake = None;
        let session = Session::start(|notifier| {
            let helper = match exit_status {
                Some(status) => FakeHelper::exiting_with(notifier, status),
                None => FakeHelper::new(),
            };
            fake = Some(helper.clone());
            Controller::new(config, test_host(), Box::new(loader), Box::new(helper))
        })?;
        Ok((session, fake.expect("helper built")))
    }

    #[test]
    fn test_automount_waits_for_helper() -> Result<()> {
        let dir = TempDir::new()?;
        let (session, helper) = start(&dir, Some(0))?;
        let handle = session.handle();
        let home = handle.resolve("/home")?.expect("home node");

        let status = handle.automount(home, "alice", MountArgs::default())?;

        let AutomountStatus::Mounted(alice) = status else {
            panic!("unexpected status {:?}", status);
        };
        assert_eq!(handle.resolve("/home/alice")?, Some(alice));
        assert_eq!(
            handle.automount(home, "alice", MountArgs::default())?,
            AutomountStatus::AlreadyMounted(alice)
        );
        assert_eq!(helper.mount_count(), 1);
        session.shutdown()
    }

    #[test]
    fn test_automount_reports_helper_failure() -> Result<()> {
        let dir = TempDir::new()?;
        let (session, _helper) = start(&dir, Some(32))?;
        let handle = session.handle();
        let home = handle.resolve("/home")?.expect("home node");

        let status = handle.automount(home, "bob", MountArgs::default())?;

        assert!(matches!(status, AutomountStatus::Failed { node: Some(_), .. }));
        assert_eq!(handle.resolve("/home/bob")?, None);
        assert!(!handle.print_tree()?.contains("bob"));
        session.shutdown()
    }

    #[test]
    fn test_re_init_fails_waiting_lookups() -> Result<()> {
        let dir = TempDir::new()?;
        let (session, helper) = start(&dir, None)?;
        let handle = session.handle();
        let home = handle.resolve("/home")?.expect("home node");

        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || handle.automount(home, "carol", MountArgs::default()))
        };
        while helper.mount_count() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        handle.re_init()?;

        let status = waiter.join().expect("waiter thread")?;
        assert!(matches!(status, AutomountStatus::Failed { .. }));
        assert_eq!(handle.resolve("/home/carol")?, None);
        session.shutdown()
    }

    #[test]
    fn test_unmount_all() -> Result<()> {
        let dir = TempDir::new()?;
        let (session, helper) = start(&dir, Some(0))?;
        let handle = session.handle();
        let home = handle.resolve("/home")?.expect("home node");
        handle.automount(home, "alice", MountArgs::default())?;
        handle.automount(home, "bob", MountArgs::default())?;

        assert_eq!(handle.unmount_all(true)?, 2);
        assert_eq!(helper.state().unmounts.len(), 2);
        session.shutdown()
    }

    #[test]
    fn test_timer_sweeps_idle_mounts() -> Result<()> {
        let dir = TempDir::new()?;
        let (session, helper) = start(&dir, Some(0))?;
        let handle = session.handle();
        let home = handle.resolve("/home")?.expect("home node");
        handle.automount(home, "alice", MountArgs::default())?;

        let timer = run_timer(handle.clone(), Duration::from_millis(20));
        let elapsed = tokio_test::block_on(async {
            tokio::time::timeout(Duration::from_millis(200), timer).await
        });
        assert!(elapsed.is_err(), "the timer runs until the session stops");

        // Round trip so every queued tick has been handled.
        handle.print_tree()?;
        assert_eq!(helper.state().unmounts.len(), 1);
        assert_eq!(handle.resolve("/home/alice")?, None);
        session.shutdown()
    }

    #[test]
    fn test_handle_fails_after_shutdown() -> Result<()> {
        let dir = TempDir::new()?;
        let (session, _helper) = start(&dir, Some(0))?;
        let handle = session.handle();
        session.shutdown()?;

        assert!(handle.print_tree().is_err());
        Ok(())
    }
}
