use std::path::Path;

use async_trait::async_trait;
use nix::sys::signal::Signal;

use crate::{
    error::FleetResult,
    host::{LaunchSpec, ProcessEntry},
    instance::Instance,
};

/// Process table access used by the controller. The host-backed
/// implementation scans `/proc`; tests substitute a fake.
#[async_trait]
pub trait ProcessOps: Send + Sync {
    /// The live process belonging to `instance`, if any. The oldest one
    /// wins when several match.
    async fn find(&self, instance: &Instance) -> FleetResult<Option<ProcessEntry>>;

    async fn signal(&self, instance: &Instance, pid: u32, signal: Signal) -> FleetResult<()>;

    /// Launch detached. Returns the PID when the host reports one.
    async fn launch(&self, instance: &Instance, spec: &LaunchSpec) -> FleetResult<Option<u32>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HostProcessOps;

#[async_trait]
impl ProcessOps for HostProcessOps {
    async fn find(&self, instance: &Instance) -> FleetResult<Option<ProcessEntry>> {
        let name = instance.name();
        let processes = instance.host.processes().await?;
        Ok(processes
            .into_iter()
            .filter(|entry| matches_instance(&entry.argv, instance.ct.tag, &name))
            .min_by_key(|entry| (entry.started, entry.pid)))
    }

    async fn signal(&self, instance: &Instance, pid: u32, signal: Signal) -> FleetResult<()> {
        instance.host.signal(pid, signal).await
    }

    async fn launch(&self, instance: &Instance, spec: &LaunchSpec) -> FleetResult<Option<u32>> {
        instance.host.run_detached(spec).await
    }
}

/// A command line belongs to an instance when the executable's base name
/// starts with the type tag and the instance name is one of the arguments.
pub fn matches_instance(argv: &[String], tag: &str, name: &str) -> bool {
    let Some((program, args)) = argv.split_first() else {
        return false;
    };
    let base = Path::new(program)
        .file_name()
        .and_then(|base| base.to_str())
        .unwrap_or(program);
    base.starts_with(tag) && args.iter().any(|arg| arg == name)
}
