//! Start/stop/restart/disable/enable over instances whose state is always
//! re-derived from the disable marker and the live process table.

pub mod clean;
pub mod discovery;
pub mod state;

use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub use discovery::{HostProcessOps, ProcessOps};
pub use state::{InstanceState, Outcome};

use crate::{
    error::{FleetError, FleetResult},
    host::Host,
    instance::Instance,
};

/// Stop waits this many polls for a terminated process to go away before
/// sending one SIGKILL.
pub const STOP_POLL_ATTEMPTS: u32 = 10;
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Who is acting on the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: String,
    pub privileged: bool,
}

impl Caller {
    pub fn of(host: &Host) -> Self {
        Self {
            user: host.login_user().to_string(),
            privileged: host.is_privileged(),
        }
    }

    /// Allowed when privileged, when no user is configured, or when the
    /// configured user is the caller.
    pub fn may_control(&self, instance: &Instance) -> bool {
        self.privileged
            || instance
                .configured_user()
                .is_none_or(|user| user == self.user)
    }
}

pub struct Controller<'a> {
    ops: &'a dyn ProcessOps,
    caller: Option<Caller>,
    running_only: bool,
}

impl<'a> Controller<'a> {
    pub fn new(ops: &'a dyn ProcessOps) -> Self {
        Self {
            ops,
            caller: None,
            running_only: true,
        }
    }

    /// Act as `caller` instead of the host's login user.
    pub fn with_caller(mut self, caller: Caller) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Whether `restart` without `all` skips instances that were stopped.
    pub fn with_running_only(mut self, running_only: bool) -> Self {
        self.running_only = running_only;
        self
    }

    fn caller_for(&self, instance: &Instance) -> Caller {
        self.caller
            .clone()
            .unwrap_or_else(|| Caller::of(&instance.host))
    }

    fn check_permission(&self, instance: &Instance) -> FleetResult<()> {
        let caller = self.caller_for(instance);
        if caller.may_control(instance) {
            return Ok(());
        }
        Err(FleetError::PermissionDenied(format!(
            "{} belongs to {}, not {}",
            instance.display_name(),
            instance.configured_user().unwrap_or_default(),
            caller.user
        )))
    }

    pub async fn state(&self, instance: &Instance) -> FleetResult<InstanceState> {
        if !instance.host.exists(&instance.home()).await? {
            return Ok(InstanceState::Absent);
        }
        if let Some(entry) = self.ops.find(instance).await? {
            if self.caller_for(instance).may_control(instance) {
                return Ok(InstanceState::Running(entry.pid));
            }
            return Ok(InstanceState::Unauthorized(entry.pid));
        }
        if instance.is_disabled().await? {
            return Ok(InstanceState::Disabled);
        }
        Ok(InstanceState::Stopped)
    }

    pub async fn start(&self, instance: &Instance) -> FleetResult<Outcome> {
        if let Some(entry) = self.ops.find(instance).await? {
            debug!(instance = %instance.display_name(), pid = entry.pid, "already running");
            return Ok(Outcome::AlreadyRunning(entry.pid));
        }
        if instance.is_disabled().await? {
            return Err(FleetError::Disabled(instance.display_name()));
        }
        self.check_permission(instance)?;

        let program = instance.program();
        if !instance.host.exists(&program).await? {
            return Err(FleetError::not_found(instance.host.name(), &program));
        }

        let spec = instance.launch_spec();
        let pid = match self.ops.launch(instance, &spec).await? {
            Some(pid) => Some(pid),
            None => self.wait_for_pid(instance).await?,
        };
        match pid {
            Some(pid) => info!(instance = %instance.display_name(), pid, "started"),
            None => warn!(
                instance = %instance.display_name(),
                "launched but no matching process found yet"
            ),
        }
        Ok(Outcome::Started(pid))
    }

    /// Remote launches do not report a PID; poll discovery for one.
    async fn wait_for_pid(&self, instance: &Instance) -> FleetResult<Option<u32>> {
        for _ in 0..STOP_POLL_ATTEMPTS {
            sleep(STOP_POLL_INTERVAL).await;
            if let Some(entry) = self.ops.find(instance).await? {
                return Ok(Some(entry.pid));
            }
        }
        Ok(None)
    }

    /// SIGTERM, poll for exit, then a single SIGKILL. `kill` skips straight
    /// to SIGKILL.
    pub async fn stop(&self, instance: &Instance, kill: bool) -> FleetResult<Outcome> {
        let Some(entry) = self.ops.find(instance).await? else {
            debug!(instance = %instance.display_name(), "not running");
            return Ok(Outcome::NotRunning);
        };
        self.check_permission(instance)?;

        if kill {
            self.ops.signal(instance, entry.pid, Signal::SIGKILL).await?;
            info!(instance = %instance.display_name(), pid = entry.pid, "killed");
            return Ok(Outcome::Killed);
        }

        self.ops.signal(instance, entry.pid, Signal::SIGTERM).await?;
        for attempt in 1..=STOP_POLL_ATTEMPTS {
            sleep(STOP_POLL_INTERVAL).await;
            if self.ops.find(instance).await?.is_none() {
                info!(instance = %instance.display_name(), pid = entry.pid, attempt, "stopped");
                return Ok(Outcome::Stopped);
            }
        }

        self.ops.signal(instance, entry.pid, Signal::SIGKILL).await?;
        warn!(
            instance = %instance.display_name(),
            pid = entry.pid,
            "did not exit after SIGTERM, sent SIGKILL"
        );
        Ok(Outcome::Killed)
    }

    pub async fn restart(&self, instance: &Instance, all: bool) -> FleetResult<Outcome> {
        let was_running = !matches!(self.stop(instance, false).await?, Outcome::NotRunning);
        if !was_running && self.running_only && !all {
            debug!(instance = %instance.display_name(), "was not running, not starting");
            return Ok(Outcome::Skipped);
        }
        self.start(instance).await
    }

    /// Stop the instance and drop the disable marker, owned by the
    /// instance user when acting privileged.
    pub async fn disable(&self, instance: &Instance) -> FleetResult<Outcome> {
        if instance.is_disabled().await? {
            return Err(FleetError::Disabled(format!(
                "{} (already)",
                instance.display_name()
            )));
        }
        self.stop(instance, false).await?;

        let marker = instance.disabled_marker();
        instance.host.create_empty(&marker).await?;
        if let Some(user) = instance.configured_user() {
            if instance.host.is_privileged() {
                instance.host.chown(&marker, &user).await?;
            }
        }
        info!(instance = %instance.display_name(), "disabled");
        Ok(Outcome::Disabled)
    }

    pub async fn enable(&self, instance: &Instance, start: bool) -> FleetResult<Outcome> {
        match instance.host.remove(&instance.disabled_marker()).await {
            Ok(()) => info!(instance = %instance.display_name(), "enabled"),
            Err(error) if error.is_not_found() => {
                debug!(instance = %instance.display_name(), "was not disabled")
            }
            Err(error) => return Err(error),
        }
        if start {
            return self.start(instance).await;
        }
        Ok(Outcome::Enabled)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        host::{LaunchSpec, ProcessEntry},
        record,
        registry::PROBE,
        session::{
            FleetSession,
            testing::{self, current_user, session},
        },
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::Instant;

    /// In-memory process table. A `stubborn` process ignores SIGTERM. A
    /// `detached` launch reports no PID, as remote launches do.
    #[derive(Default)]
    pub(crate) struct FakeOps {
        pub running: Mutex<Option<u32>>,
        pub stubborn: bool,
        pub detached: bool,
        pub signals: Mutex<Vec<Signal>>,
        pub launches: Mutex<u32>,
        pub finds: Mutex<u32>,
    }

    impl FakeOps {
        pub(crate) fn running(pid: u32) -> Self {
            Self {
                running: Mutex::new(Some(pid)),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ProcessOps for FakeOps {
        async fn find(&self, _instance: &Instance) -> FleetResult<Option<ProcessEntry>> {
            *self.finds.lock() += 1;
            Ok((*self.running.lock()).map(|pid| ProcessEntry {
                pid,
                uid: None,
                argv: Vec::new(),
                started: None,
            }))
        }

        async fn signal(&self, _instance: &Instance, _pid: u32, signal: Signal) -> FleetResult<()> {
            self.signals.lock().push(signal);
            if signal == Signal::SIGKILL || !self.stubborn {
                *self.running.lock() = None;
            }
            Ok(())
        }

        async fn launch(&self, _instance: &Instance, _spec: &LaunchSpec) -> FleetResult<Option<u32>> {
            *self.launches.lock() += 1;
            *self.running.lock() = Some(4242);
            Ok((!self.detached).then_some(4242))
        }
    }

    pub(crate) fn fixture(root: &TempDir) -> (FleetSession, Instance) {
        let session = session(root.path());
        let instance = Instance::new(&session, session.local(), &PROBE, "p1");
        fs::create_dir_all(instance.home()).expect("instance dir");
        let program = instance.program();
        fs::create_dir_all(program.parent().expect("program dir")).expect("program dir");
        fs::write(&program, b"#!/bin/sh\n").expect("program");
        (session, instance)
    }

    fn as_owner() -> Caller {
        Caller {
            user: current_user(),
            privileged: false,
        }
    }

    #[tokio::test]
    async fn stop_on_stopped_instance_sends_nothing() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let (_session, instance) = fixture(&root);
        let ops = FakeOps::default();
        let controller = Controller::new(&ops).with_caller(as_owner());

        assert_eq!(controller.stop(&instance, false).await?, Outcome::NotRunning);
        assert!(ops.signals.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn start_on_running_instance_does_not_launch() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let (_session, instance) = fixture(&root);
        let ops = FakeOps::running(77);
        let controller = Controller::new(&ops).with_caller(as_owner());

        assert_eq!(controller.start(&instance).await?, Outcome::AlreadyRunning(77));
        assert_eq!(*ops.launches.lock(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn start_launches_and_reports_pid() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let (_session, instance) = fixture(&root);
        let ops = FakeOps::default();
        let controller = Controller::new(&ops).with_caller(as_owner());

        assert_eq!(controller.start(&instance).await?, Outcome::Started(Some(4242)));
        assert_eq!(
            controller.state(&instance).await?,
            InstanceState::Running(4242)
        );
        Ok(())
    }

    #[tokio::test]
    async fn start_requires_the_binary() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let (_session, instance) = fixture(&root);
        fs::remove_file(instance.program())?;
        let ops = FakeOps::default();
        let controller = Controller::new(&ops).with_caller(as_owner());

        let error = controller.start(&instance).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);
        assert_eq!(*ops.launches.lock(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn other_users_instances_are_refused() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let (_session, instance) = fixture(&root);
        let ops = FakeOps::running(88);
        let controller = Controller::new(&ops).with_caller(Caller {
            user: "mallory".to_string(),
            privileged: false,
        });

        let error = controller.stop(&instance, false).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::PermissionDenied);
        assert!(ops.signals.lock().is_empty());
        assert_eq!(
            controller.state(&instance).await?,
            InstanceState::Unauthorized(88)
        );

        let root_caller = Controller::new(&ops).with_caller(Caller {
            user: "root".to_string(),
            privileged: true,
        });
        assert_eq!(root_caller.stop(&instance, false).await?, Outcome::Stopped);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn launch_without_pid_is_found_by_polling() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let (_session, instance) = fixture(&root);
        let ops = FakeOps {
            detached: true,
            ..FakeOps::default()
        };
        let controller = Controller::new(&ops).with_caller(as_owner());

        let started = Instant::now();
        assert_eq!(controller.start(&instance).await?, Outcome::Started(Some(4242)));
        assert_eq!(started.elapsed(), STOP_POLL_INTERVAL);
        // one lookup before launching, one after the first poll interval
        assert_eq!(*ops.finds.lock(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn remote_login_user_controls_its_own_instances() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = session(root.path());
        let remote = testing::remote_host(root.path(), "ops");
        let instance = Instance::new(&session, &remote, &PROBE, "p1");
        let ops = FakeOps::running(61);
        let controller = Controller::new(&ops);

        assert_eq!(Caller::of(&remote).user, "ops");
        assert_eq!(controller.stop(&instance, false).await?, Outcome::Stopped);
        assert_eq!(*ops.signals.lock(), vec![Signal::SIGTERM]);

        let mut foreign = Instance::new(&session, &remote, &PROBE, "p2");
        foreign.record.set(record::USER, "alice");
        *ops.running.lock() = Some(62);
        let error = controller.stop(&foreign, false).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::PermissionDenied);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_process_gets_one_sigkill_after_polling() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let (_session, instance) = fixture(&root);
        let ops = FakeOps {
            running: Mutex::new(Some(99)),
            stubborn: true,
            ..FakeOps::default()
        };
        let controller = Controller::new(&ops).with_caller(as_owner());

        let started = Instant::now();
        assert_eq!(controller.stop(&instance, false).await?, Outcome::Killed);
        assert_eq!(started.elapsed(), STOP_POLL_INTERVAL * STOP_POLL_ATTEMPTS);
        assert_eq!(*ops.signals.lock(), vec![Signal::SIGTERM, Signal::SIGKILL]);
        // one lookup before SIGTERM, then one per poll
        assert_eq!(*ops.finds.lock(), 1 + STOP_POLL_ATTEMPTS);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cooperative_process_stops_without_sigkill() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let (_session, instance) = fixture(&root);
        let ops = FakeOps::running(55);
        let controller = Controller::new(&ops).with_caller(as_owner());

        assert_eq!(controller.stop(&instance, false).await?, Outcome::Stopped);
        assert_eq!(*ops.signals.lock(), vec![Signal::SIGTERM]);
        Ok(())
    }

    #[tokio::test]
    async fn disable_blocks_start_until_enabled() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let (_session, instance) = fixture(&root);
        let ops = FakeOps::default();
        let controller = Controller::new(&ops).with_caller(as_owner());

        assert_eq!(controller.disable(&instance).await?, Outcome::Disabled);
        assert!(instance.disabled_marker().exists());
        assert_eq!(controller.state(&instance).await?, InstanceState::Disabled);

        let error = controller.start(&instance).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Disabled);
        let again = controller.disable(&instance).await.unwrap_err();
        assert_eq!(again.kind(), ErrorKind::Disabled);

        assert_eq!(controller.enable(&instance, false).await?, Outcome::Enabled);
        assert_eq!(controller.enable(&instance, false).await?, Outcome::Enabled);
        assert_eq!(
            controller.start(&instance).await?,
            Outcome::Started(Some(4242))
        );
        Ok(())
    }

    #[tokio::test]
    async fn restart_policy_skips_stopped_instances() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let (_session, instance) = fixture(&root);
        let ops = FakeOps::default();
        let controller = Controller::new(&ops).with_caller(as_owner());

        assert_eq!(controller.restart(&instance, false).await?, Outcome::Skipped);
        assert_eq!(*ops.launches.lock(), 0);
        assert_eq!(
            controller.restart(&instance, true).await?,
            Outcome::Started(Some(4242))
        );

        let eager = Controller::new(&ops)
            .with_caller(as_owner())
            .with_running_only(false);
        *ops.running.lock() = None;
        assert_eq!(
            eager.restart(&instance, false).await?,
            Outcome::Started(Some(4242))
        );
        Ok(())
    }
}
