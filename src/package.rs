//! Switching the version link a type's instances run from.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::{
    error::{FleetError, FleetResult},
    host::Host,
    instance::{self, Instance},
    lifecycle::{Controller, Outcome},
    record,
    registry::ComponentType,
    session::FleetSession,
};

pub const DEFAULT_BASE: &str = "active_prod";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// The link already pointed at the version.
    pub unchanged: bool,
    pub restarted: Vec<String>,
    pub failed: Vec<String>,
}

/// Point `root/packages/<type>/<base>` at `version` on `host`.
///
/// Instances running from `base` are stopped before the link changes and
/// started afterwards. An existing link to another version is only replaced
/// when `force` is set.
pub async fn update_to_version(
    session: &FleetSession,
    controller: &Controller<'_>,
    host: &Host,
    ct: &'static ComponentType,
    version: &str,
    base: &str,
    force: bool,
) -> FleetResult<UpdateReport> {
    let packages = host.root().join("packages").join(ct.tag);
    let target = packages.join(version);
    if !host.stat(&target).await?.is_dir {
        return Err(FleetError::NotSupported(format!(
            "{} is not a directory",
            target.display()
        )));
    }

    let link = packages.join(base);
    let current = match host.read_link(&link).await {
        Ok(current) => Some(current),
        Err(error) if error.is_not_found() => None,
        Err(error) => return Err(error),
    };
    if let Some(current) = &current {
        if current == &PathBuf::from(version) || current == &target {
            info!(kind = ct.tag, base, version, "already current");
            return Ok(UpdateReport {
                unchanged: true,
                ..UpdateReport::default()
            });
        }
        if !force {
            return Err(FleetError::AlreadyExists {
                host: host.name().to_string(),
                path: format!("{} -> {}", link.display(), current.display()),
            });
        }
    }

    let mut report = UpdateReport::default();
    let mut stopped = Vec::new();
    for name in instance::instance_names(host, ct).await? {
        let inst = match Instance::load(session, host, ct, &name).await {
            Ok(inst) => inst,
            Err(error) => {
                warn!(kind = ct.tag, name = %name, %error, "skipping instance during update");
                continue;
            }
        };
        if inst.record.string(record::VERSION) != base {
            continue;
        }
        match controller.stop(&inst, false).await {
            Ok(Outcome::NotRunning) => {}
            Ok(_) => stopped.push(inst),
            Err(error) => {
                warn!(instance = %inst.display_name(), %error, "cannot stop for update");
                report.failed.push(inst.display_name());
            }
        }
    }

    if current.is_some() {
        host.remove(&link).await?;
    }
    host.symlink(&PathBuf::from(version), &link).await?;
    info!(kind = ct.tag, host = host.name(), base, version, "updated version link");

    for inst in stopped {
        match controller.start(&inst).await {
            Ok(_) => report.restarted.push(inst.display_name()),
            Err(error) => {
                warn!(instance = %inst.display_name(), %error, "cannot restart after update");
                report.failed.push(inst.display_name());
            }
        }
    }
    Ok(report)
}
