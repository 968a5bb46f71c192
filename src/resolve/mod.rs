//! Turns a type, an instance name and a host into a resolved record.

pub mod legacy;
pub mod persist;
pub mod template;

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    error::{FleetError, FleetResult},
    host::{Host, HostName},
    record::{self, ConfigRecord, DERIVED_FIELDS},
    registry::{ComponentType, DefaultExpr, Registry},
};

pub use persist::write_config;

static VALID_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid instance name pattern")
});

/// `name` or `name@host` as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceName {
    pub name: String,
    pub host: HostName,
}

impl InstanceName {
    pub fn parse(raw: &str) -> Self {
        match raw.rsplit_once('@') {
            Some((name, host)) => Self {
                name: name.to_string(),
                host: HostName::parse(host),
            },
            None => Self {
                name: raw.to_string(),
                host: HostName::Local,
            },
        }
    }
}

/// Reject names outside the allowed character set. A name becomes a path
/// component, so this runs before any path is built from it.
pub fn check_name(name: &str) -> FleetResult<()> {
    if !VALID_NAME.is_match(name) {
        return Err(FleetError::NotSupported(format!(
            "invalid instance name '{name}'"
        )));
    }
    Ok(())
}

/// [`check_name`], plus names that collide with a type tag or alias.
pub fn validate_name(registry: &Registry, name: &str) -> FleetResult<()> {
    check_name(name)?;
    if registry.is_reserved(name) {
        return Err(FleetError::NotSupported(format!(
            "'{name}' is a reserved word"
        )));
    }
    Ok(())
}

/// Seed fields and evaluated defaults for an instance, without touching
/// disk. A default that cannot be evaluated is left empty.
pub fn defaults(ct: &ComponentType, root: &Path, name: &str, user: &str) -> ConfigRecord {
    layered(ct, root, name, user, &ConfigRecord::new())
}

/// Defaults with `stored` taking precedence field by field. Stored fields
/// are in place before the templates run, so a stored `Version` feeds the
/// computed `Program`. Template results are marked computed and are not
/// written back.
fn layered(
    ct: &ComponentType,
    root: &Path,
    name: &str,
    user: &str,
    stored: &ConfigRecord,
) -> ConfigRecord {
    let mut record = ConfigRecord::new();
    record.set(record::ROOT, root.display().to_string());
    record.set(record::USER, user);
    for (field, value) in ct.seeds {
        record.set(*field, *value);
    }
    persist::overlay(&mut record, stored);
    record.set(record::NAME, name);

    for expr in ct.defaults {
        if stored.contains(expr.field) && !DERIVED_FIELDS.contains(&expr.field) {
            continue;
        }
        evaluate_default(ct, &mut record, expr);
    }
    record
}

/// Re-run the templates of every computed field in declaration order, so an
/// explicit change (a new `Version`, a legacy `BASE`) reaches the fields
/// built from it.
pub fn refresh(ct: &ComponentType, record: &mut ConfigRecord) {
    for expr in ct.defaults {
        if record.is_computed(expr.field) {
            evaluate_default(ct, record, expr);
        }
    }
}

fn evaluate_default(ct: &ComponentType, record: &mut ConfigRecord, expr: &DefaultExpr) {
    match template::evaluate(expr.template, record) {
        Ok(value) => record.set_computed(expr.field, value),
        Err(error) => {
            warn!(
                kind = ct.tag,
                name = %record.string(record::NAME),
                field = expr.field,
                %error,
                "default could not be evaluated"
            );
            record.set_computed(expr.field, "");
        }
    }
}

/// Resolve an existing instance on `host`.
///
/// The stored JSON record overlays the defaults. Without one, a legacy
/// `.rc` file is migrated: the JSON form is written and the legacy file is
/// renamed to `.rc.orig`.
pub async fn resolve(
    host: &Host,
    ct: &ComponentType,
    name: &str,
    user: &str,
) -> FleetResult<ConfigRecord> {
    check_name(name)?;
    let mut record = defaults(ct, host.root(), name, user);
    let home = PathBuf::from(record.string(record::HOME));
    if !host.exists(&home).await? {
        return Err(FleetError::not_found(host.name(), &home));
    }

    let json_path = home.join(ct.config_file());
    if let Some(stored) = persist::read_config(host, &json_path).await? {
        return Ok(layered(ct, host.root(), name, user, &stored));
    }

    let rc_path = home.join(ct.legacy_file());
    let contents = match host.read_file(&rc_path).await {
        Ok(contents) => contents,
        Err(error) if error.is_not_found() => {
            debug!(kind = ct.tag, name, "no stored configuration, using defaults");
            return Ok(record);
        }
        Err(error) => return Err(error),
    };
    let entries = legacy::parse(&String::from_utf8_lossy(&contents), &rc_path)?;
    legacy::apply(ct, &mut record, entries);
    refresh(ct, &mut record);
    migrate(host, ct, &record, &rc_path).await?;
    Ok(record)
}

async fn migrate(
    host: &Host,
    ct: &ComponentType,
    record: &ConfigRecord,
    rc_path: &Path,
) -> FleetResult<()> {
    write_config(host, ct, record).await?;
    let mut orig = rc_path.as_os_str().to_owned();
    orig.push(".orig");
    host.rename(rc_path, Path::new(&orig)).await?;
    info!(
        kind = ct.tag,
        name = %record.string(record::NAME),
        host = host.name(),
        "migrated legacy configuration"
    );
    Ok(())
}
