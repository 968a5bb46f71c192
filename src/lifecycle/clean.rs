//! Removal of the disposable files an instance leaves in its directory.

use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::{debug, info};

use super::{Controller, Outcome};
use crate::{
    error::{FleetError, FleetResult},
    host::Host,
    instance::Instance,
    session::FleetSession,
};

/// Delete files under the instance directory matching the type's clean
/// globs. With `full`, the instance is stopped first, purge globs are
/// removed too, and it is started again if it had been running.
pub async fn clean(
    session: &FleetSession,
    controller: &Controller<'_>,
    instance: &Instance,
    full: bool,
) -> FleetResult<usize> {
    let mut patterns = session.clean_globs(instance.ct);
    if !full {
        return remove_matching(&instance.host, &instance.home(), &patterns).await;
    }

    let was_running = !matches!(controller.stop(instance, false).await?, Outcome::NotRunning);
    patterns.extend(session.purge_globs(instance.ct));
    let removed = remove_matching(&instance.host, &instance.home(), &patterns).await?;
    if was_running {
        controller.start(instance).await?;
    }
    Ok(removed)
}

/// Remove every regular file under `base` matched by one of `patterns`.
/// Patterns are relative and may contain `/`; each component is matched
/// against one directory level.
pub async fn remove_matching(host: &Host, base: &Path, patterns: &[String]) -> FleetResult<usize> {
    let mut removed = 0;
    for raw in patterns {
        for path in expand(host, base, raw).await? {
            host.remove(&path).await?;
            debug!(path = %path.display(), "removed");
            removed += 1;
        }
    }
    if removed > 0 {
        info!(dir = %base.display(), removed, "cleaned");
    }
    Ok(removed)
}

async fn expand(host: &Host, base: &Path, raw: &str) -> FleetResult<Vec<PathBuf>> {
    let components = raw
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| {
            Pattern::new(part).map_err(|error| {
                FleetError::invalid_config(base, format!("glob '{raw}': {}", error.msg))
            })
        })
        .collect::<FleetResult<Vec<_>>>()?;
    if components.is_empty() || raw.contains("..") {
        return Ok(Vec::new());
    }

    let last = components.len() - 1;
    let mut frontier = vec![base.to_path_buf()];
    for (depth, pattern) in components.iter().enumerate() {
        let mut next = Vec::new();
        for dir in &frontier {
            let entries = match host.read_dir(dir).await {
                Ok(entries) => entries,
                Err(error) if error.is_not_found() => continue,
                Err(error) => return Err(error),
            };
            next.extend(
                entries
                    .into_iter()
                    .filter(|entry| entry.is_dir == (depth != last))
                    .filter(|entry| pattern.matches(&entry.name))
                    .map(|entry| dir.join(entry.name)),
            );
        }
        frontier = next;
    }
    Ok(frontier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        host::LocalHost,
        lifecycle::tests::{FakeOps, fixture},
        session::testing::current_user,
        lifecycle::Caller,
    };
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn nested_patterns_match_one_level_each() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let base = root.path();
        fs::create_dir_all(base.join("logs/old"))?;
        fs::write(base.join("a.old"), "")?;
        fs::write(base.join("keep.txt"), "")?;
        fs::write(base.join("logs/web.log"), "")?;
        fs::write(base.join("logs/old/deep.log"), "")?;
        let host = Host::Local(LocalHost::new(base));

        let removed = remove_matching(
            &host,
            base,
            &["*.old".to_string(), "logs/*.log".to_string(), "missing/*".to_string()],
        )
        .await?;
        assert_eq!(removed, 2);
        assert!(!base.join("a.old").exists());
        assert!(!base.join("logs/web.log").exists());
        assert!(base.join("logs/old/deep.log").exists());
        assert!(base.join("keep.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn full_clean_purges_and_restarts_running_instance() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let (session, instance) = fixture(&root);
        fs::write(instance.home().join("probe.txt"), "log")?;
        fs::write(instance.home().join("x.old"), "")?;
        let ops = FakeOps::running(12);
        let controller = Controller::new(&ops).with_caller(Caller {
            user: current_user(),
            privileged: false,
        });

        assert_eq!(clean(&session, &controller, &instance, false).await?, 1);
        assert!(instance.home().join("probe.txt").exists());

        assert_eq!(clean(&session, &controller, &instance, true).await?, 1);
        assert!(!instance.home().join("probe.txt").exists());
        assert_eq!(*ops.launches.lock(), 1);
        Ok(())
    }
}
