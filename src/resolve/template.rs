use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::record::ConfigRecord;

static FIELD_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([A-Za-z][A-Za-z0-9_]*)(?:\?([A-Za-z][A-Za-z0-9_]*))?\}")
        .expect("valid field reference pattern")
});

static REPEATED_SLASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/{2,}").expect("valid slash pattern"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("field '{0}' is not set")]
    MissingField(String),
}

/// Expand `{Field}` and `{Field?Fallback}` references against `record`.
///
/// A reference to an absent or empty field is an error; the fallback form
/// uses `Fallback` when `Field` is empty. Paths have repeated separators
/// collapsed.
pub fn evaluate(template: &str, record: &ConfigRecord) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in FIELD_REF.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        let field = &caps[1];
        let value = match (record.non_empty(field), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(fallback)) => record
                .non_empty(fallback.as_str())
                .ok_or_else(|| TemplateError::MissingField(fallback.as_str().to_string()))?,
            (None, None) => return Err(TemplateError::MissingField(field.to_string())),
        };
        out.push_str(&value);
    }
    out.push_str(&template[last..]);

    if out.starts_with('/') {
        return Ok(REPEATED_SLASH.replace_all(&out, "/").into_owned());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    fn sample() -> ConfigRecord {
        let mut record = ConfigRecord::new();
        record.set(record::ROOT, "/opt/fleet/");
        record.set(record::NAME, "p1");
        record.set(record::HOME, "/opt/fleet/probe/probes/p1");
        record.set(record::LOG_DIR, "");
        record
    }

    #[test]
    fn substitutes_and_collapses_separators() {
        let record = sample();
        assert_eq!(
            evaluate("{Root}/probe/probes/{Name}", &record),
            Ok("/opt/fleet/probe/probes/p1".to_string())
        );
    }

    #[test]
    fn fallback_is_used_for_empty_fields() {
        let record = sample();
        assert_eq!(
            evaluate("{LogDir?Home}/probe.txt", &record),
            Ok("/opt/fleet/probe/probes/p1/probe.txt".to_string())
        );
    }

    #[test]
    fn missing_field_is_an_error() {
        let record = sample();
        assert_eq!(
            evaluate("{Install}/bin", &record),
            Err(TemplateError::MissingField("Install".to_string()))
        );
    }

    #[test]
    fn literal_text_is_untouched() {
        let record = sample();
        assert_eq!(evaluate("active_prod", &record), Ok("active_prod".to_string()));
        assert_eq!(
            evaluate("http://{Name}:8080", &record),
            Ok("http://p1:8080".to_string())
        );
    }
}
