//! Reader for the legacy `KEY=VALUE` instance file.

use std::path::Path;

use tracing::debug;

use crate::{
    error::{FleetError, FleetResult},
    record::{self, ConfigRecord},
    registry::ComponentType,
};

/// Parse a legacy file. Blank lines and `#` comments are skipped; any other
/// line without `=` makes the whole file invalid.
pub fn parse(contents: &str, path: &Path) -> FleetResult<Vec<(String, String)>> {
    let mut entries = Vec::new();
    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(FleetError::invalid_config(
                path,
                format!("line {}: expected KEY=VALUE", idx + 1),
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(FleetError::invalid_config(
                path,
                format!("line {}: empty key", idx + 1),
            ));
        }
        entries.push((key.to_string(), strip_quotes(value.trim())));
    }
    Ok(entries)
}

/// Apply parsed entries onto a record. Keys with the type's prefix set
/// fields; everything else becomes an environment entry.
pub fn apply(ct: &ComponentType, record: &mut ConfigRecord, entries: Vec<(String, String)>) {
    for (key, value) in entries {
        match ct.legacy_field(&key) {
            Some(record::HOME) => debug!(key = %key, "ignoring legacy home override"),
            Some(field @ (record::PORT | record::SSH_PORT)) => match value.parse::<i64>() {
                Ok(port) => record.set(field, port),
                Err(_) => record.set(field, value),
            },
            Some(field) => record.set(field, value),
            None => record.push_list(record::ENV, format!("{key}={value}")),
        }
    }
}

fn strip_quotes(value: &str) -> String {
    if value.len() >= 2 {
        let bytes = value.as_bytes();
        if (bytes[0] == b'"' && bytes[value.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'')
        {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, registry::PROBE};

    #[test]
    fn parses_quotes_comments_and_first_equals() {
        let path = Path::new("probe.rc");
        let entries = parse(
            "# comment\n\nPROBE_PORT=7036\nPROBE_OPTS=\"-debug -opt=1\"\nJAVA_HOME='/usr/java'\n",
            path,
        )
        .expect("legacy file parses");
        assert_eq!(
            entries,
            vec![
                ("PROBE_PORT".to_string(), "7036".to_string()),
                ("PROBE_OPTS".to_string(), "-debug -opt=1".to_string()),
                ("JAVA_HOME".to_string(), "/usr/java".to_string()),
            ]
        );
    }

    #[test]
    fn malformed_line_rejects_the_file() {
        let error = parse("PROBE_PORT=7036\nnot a pair\n", Path::new("probe.rc")).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidConfig);
        assert!(error.to_string().contains("line 2"));
    }

    #[test]
    fn apply_routes_prefixed_keys_and_env() {
        let mut record = ConfigRecord::new();
        record.set(record::HOME, "/opt/fleet/probe/probes/p1");
        apply(
            &PROBE,
            &mut record,
            vec![
                ("PROBE_PORT".to_string(), "7040".to_string()),
                ("PROBE_HOME".to_string(), "/elsewhere".to_string()),
                ("TZ".to_string(), "UTC".to_string()),
            ],
        );
        assert_eq!(record.port(), Some(7040));
        assert_eq!(record.string(record::HOME), "/opt/fleet/probe/probes/p1");
        assert_eq!(record.list(record::ENV), &["TZ=UTC".to_string()]);
    }
}
