use std::path::Path;

/// Quote a string for POSIX `sh`.
pub(crate) fn quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value.chars().all(|ch| {
            ch.is_ascii_alphanumeric() || matches!(ch, '/' | '.' | '_' | '-' | ':' | '=' | '+' | ',')
        });
    if plain {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub(crate) fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// Emits `pid US uid US started US argv...` per process, argv joined with RS.
pub(crate) const PROCESS_TABLE_SCRIPT: &str = concat!(
    "for d in /proc/[0-9]*; do ",
    "[ -r \"$d/cmdline\" ] || continue; ",
    "printf '%s\\037%s\\037%s\\037' \"${d#/proc/}\" \"$(stat -c %u \"$d\")\" \"$(stat -c %Y \"$d\")\"; ",
    "tr '\\000' '\\036' < \"$d/cmdline\"; ",
    "printf '\\n'; ",
    "done 2>/dev/null; true"
);

pub(crate) const FIELD_SEPARATOR: char = '\u{1f}';
pub(crate) const ARG_SEPARATOR: u8 = 0x1e;
