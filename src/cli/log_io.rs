use std::{
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
};

use tokio::time::{Duration, sleep};
use tracing::debug;

use crate::{error::FleetResult, host::Host};

/// How far back from the end `tail` reads before counting lines.
const TAIL_WINDOW: u64 = 256 * 1024;
const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// The last `count` lines of `data`, ignoring a trailing newline.
pub fn last_lines(data: &[u8], count: usize) -> Vec<String> {
    if count == 0 {
        return Vec::new();
    }
    let text = String::from_utf8_lossy(data);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(count);
    lines[skip..].iter().map(|line| line.to_string()).collect()
}

/// Last `count` lines of the file and the offset to follow from.
pub async fn tail(host: &Host, path: &Path, count: usize) -> FleetResult<(Vec<String>, u64)> {
    let len = host.stat(path).await?.len;
    let start = len.saturating_sub(TAIL_WINDOW);
    let data = host.read_from(path, start).await?;
    let end = start + data.len() as u64;
    // the window may begin mid-line
    let whole = match data.iter().position(|byte| *byte == b'\n') {
        Some(newline) if start > 0 => &data[newline + 1..],
        _ => &data[..],
    };
    Ok((last_lines(whole, count), end))
}

/// Print whatever is appended to the file from `offset` on, polling until
/// the task is aborted. A truncated or recreated file is read from the top.
pub async fn follow(host: Host, path: PathBuf, mut offset: u64) -> FleetResult<()> {
    loop {
        match host.stat(&path).await {
            Ok(info) => {
                if info.len < offset {
                    debug!(path = %path.display(), "log truncated, rewinding");
                    offset = 0;
                }
                if info.len > offset {
                    let data = host.read_from(&path, offset).await?;
                    offset += data.len() as u64;
                    print_chunk(&data);
                }
            }
            Err(error) if error.is_not_found() => offset = 0,
            Err(error) => return Err(error),
        }
        sleep(FOLLOW_INTERVAL).await;
    }
}

fn print_chunk(data: &[u8]) {
    let text = String::from_utf8_lossy(data);
    let mut stdout = io::stdout().lock();
    for line in text.split_inclusive('\n') {
        let _ = stdout.write_all(colorize_line(line).as_bytes());
    }
    let _ = stdout.flush();
}

pub fn colorize_line(line: &str) -> String {
    if !io::stdout().is_terminal() {
        return line.to_string();
    }
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("fatal") {
        format!("\u{001b}[31m{}\u{001b}[0m", line)
    } else if lower.contains("warn") {
        format!("\u{001b}[33m{}\u{001b}[0m", line)
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn last_lines_keeps_order() {
        let data = b"one\ntwo\nthree\n";
        assert_eq!(last_lines(data, 2), vec!["two", "three"]);
        assert_eq!(last_lines(data, 10).len(), 3);
        assert!(last_lines(data, 0).is_empty());
    }

    #[tokio::test]
    async fn tail_returns_offset_at_end_of_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("probe.txt");
        fs::write(&path, "a\nb\nc\n")?;
        let host = Host::Local(LocalHost::new(dir.path()));

        let (lines, offset) = tail(&host, &path, 2).await?;
        assert_eq!(lines, vec!["b", "c"]);
        assert_eq!(offset, 6);
        Ok(())
    }
}
