//! Port allocation over the ports recorded in instance configurations.
//!
//! The occupied set is recomputed from disk on every query. Two concurrent
//! invocations can both pick the same free port before either one persists
//! it; callers serialise `add` runs against a fleet externally.

use std::collections::{BTreeMap, HashSet};

use tracing::warn;

use crate::{error::FleetResult, host::Host, instance, session::FleetSession};

/// Upper bound used for open-ended `A-` tokens.
pub const OPEN_RANGE_END: u16 = 49151;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// Parse a range expression (`7036,7100-`, `8000-8010`, `9000..9005`).
/// Malformed tokens, including ranges whose start is not below their end,
/// are skipped.
pub fn parse_ranges(expr: &str) -> Vec<PortRange> {
    expr.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(parse_token)
        .collect()
}

fn parse_token(token: &str) -> Option<PortRange> {
    let bounds = token
        .split_once("..")
        .or_else(|| token.split_once('-'));
    let Some((start, end)) = bounds else {
        let port = token.parse::<u16>().ok().filter(|port| *port != 0)?;
        return Some(PortRange {
            start: port,
            end: port,
        });
    };
    let start = start.trim().parse::<u16>().ok().filter(|port| *port != 0)?;
    let end = match end.trim() {
        "" => OPEN_RANGE_END,
        value => value.parse::<u16>().ok()?,
    };
    (start < end).then_some(PortRange { start, end })
}

/// First port from `expr`, scanning tokens left to right and ascending
/// within each, that is not in `occupied`. Zero when all are taken.
pub fn first_free(expr: &str, occupied: &HashSet<u16>) -> u16 {
    parse_ranges(expr)
        .into_iter()
        .flat_map(|range| range.start..=range.end)
        .find(|port| !occupied.contains(port))
        .unwrap_or(0)
}

/// Ports recorded by every process-bearing instance on `host`, keyed by
/// port with the owning instances. Unreadable instances are logged and
/// skipped.
pub async fn occupied_ports(
    session: &FleetSession,
    host: &Host,
) -> FleetResult<BTreeMap<u16, Vec<String>>> {
    let mut view: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for ct in session.registry().real_types() {
        for name in instance::instance_names(host, ct).await? {
            match instance::Instance::load(session, host, ct, &name).await {
                Ok(inst) => {
                    if let Some(port) = inst.record.port() {
                        view.entry(port).or_default().push(inst.display_name());
                    }
                }
                Err(error) => warn!(
                    kind = ct.tag,
                    name = %name,
                    host = host.name(),
                    %error,
                    "skipping unreadable instance in port scan"
                ),
            }
        }
    }
    Ok(view)
}

/// First free port in `expr` on `host`, or zero.
pub async fn next_free_port(session: &FleetSession, host: &Host, expr: &str) -> FleetResult<u16> {
    let occupied: HashSet<u16> = occupied_ports(session, host).await?.into_keys().collect();
    Ok(first_free(expr, &occupied))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_range_falls_back_after_single_port() {
        let occupied = HashSet::from([7036, 7037]);
        assert_eq!(first_free("7036,7100-", &occupied), 7100);
    }

    #[test]
    fn tokens_are_scanned_in_order() {
        let occupied = HashSet::from([8000, 8001]);
        assert_eq!(first_free("8000-8002,7000", &occupied), 8002);
        assert_eq!(first_free("9000..9001", &HashSet::new()), 9000);
    }

    #[test]
    fn malformed_tokens_are_skipped() {
        assert_eq!(
            parse_ranges("abc, 9000-8000, 7000-7000, 7100-7102"),
            vec![PortRange {
                start: 7100,
                end: 7102
            }]
        );
        assert_eq!(
            parse_ranges("7100-"),
            vec![PortRange {
                start: 7100,
                end: OPEN_RANGE_END
            }]
        );
    }

    #[test]
    fn exhausted_ranges_return_zero() {
        let occupied = HashSet::from([7036, 7100, 7101]);
        assert_eq!(first_free("7036,7100-7101", &occupied), 0);
        assert_eq!(first_free("", &occupied), 0);
    }
}
