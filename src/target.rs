//! Target expansion.
//!
//! Grammar, tried in order: `auto`/`lan` keyword, CIDR (`/`), dash range
//! (`-`, either a full end address or a last-octet shorthand), comma list,
//! single literal. [`Target::parse`] is the permissive entry point: empty list
//! entries are skipped and anything else malformed is kept as a single literal
//! target. [`Target::parse_strict`] is for callers that want malformed input
//! rejected up front.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::netdetect::{self, LanSampling};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Sample the local network instead of sweeping it.
    Lan,
    Cidr(IpNet),
    Range { start: Ipv4Addr, end: Ipv4Addr },
    List(Vec<String>),
    Literal(String),
}

/// Limits applied while turning a [`Target`] into a work list.
#[derive(Debug, Clone)]
pub struct ExpandOptions {
    pub max_targets: u64,
    pub lan: LanSampling,
    /// Anchor for `auto`; detected from the local interfaces when unset.
    pub local: Option<Ipv4Addr>,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self {
            max_targets: 65_536,
            lan: LanSampling::default(),
            local: None,
        }
    }
}

impl Target {
    /// Permissive parse. Only an empty target is an error.
    pub fn parse(s: &str) -> Result<Target> {
        match Self::parse_with(s, false) {
            Ok(t) => Ok(t),
            Err(EngineError::EmptyTarget) => Err(EngineError::EmptyTarget),
            Err(e) => {
                warn!(input = s, error = %e, "unrecognized target, scanning it as a single literal");
                Ok(Target::Literal(s.trim().to_string()))
            }
        }
    }

    pub fn parse_strict(s: &str) -> Result<Target> {
        Self::parse_with(s, true)
    }

    /// Shared grammar. Non-strict parsing skips empty list entries instead of
    /// rejecting the whole list.
    fn parse_with(s: &str, strict: bool) -> Result<Target> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EngineError::EmptyTarget);
        }
        if s.eq_ignore_ascii_case("auto") || s.eq_ignore_ascii_case("lan") {
            return Ok(Target::Lan);
        }
        if s.contains('/') {
            return s
                .parse::<IpNet>()
                .map(Target::Cidr)
                .map_err(|e| EngineError::InvalidTarget(format!("{s}: {e}")));
        }
        if let Some((a, b)) = s.split_once('-') {
            match a.trim().parse::<Ipv4Addr>() {
                Ok(start) => return parse_range(s, start, b.trim()),
                // dashes are legal in host names
                Err(_) if !s.contains(',') && is_hostname(s) => {
                    return Ok(Target::Literal(s.to_string()))
                }
                Err(_) if !s.contains(',') => {
                    return Err(EngineError::InvalidTarget(format!("{s}: bad range start")))
                }
                Err(_) => {}
            }
        }
        if s.contains(',') {
            let mut items = Vec::new();
            for token in s.split(',').map(str::trim) {
                if token.is_empty() {
                    if strict {
                        return Err(EngineError::InvalidTarget(format!("{s}: empty list entry")));
                    }
                    continue;
                }
                items.push(token.to_string());
            }
            if items.is_empty() {
                return Err(EngineError::EmptyTarget);
            }
            return Ok(Target::List(items));
        }
        if s.parse::<IpAddr>().is_ok() || is_hostname(s) {
            return Ok(Target::Literal(s.to_string()));
        }
        Err(EngineError::InvalidTarget(s.to_string()))
    }

    pub fn is_lan(&self) -> bool {
        matches!(self, Target::Lan)
    }

    /// Number of addresses the target expands to. `None` for the LAN keyword.
    pub fn host_count(&self) -> Option<u128> {
        match self {
            Target::Lan => None,
            Target::Cidr(IpNet::V4(n)) => Some(match n.prefix_len() {
                32 => 1,
                31 => 2,
                p => (1u128 << (32 - p)) - 2,
            }),
            Target::Cidr(IpNet::V6(n)) => {
                Some(1u128.checked_shl(128 - n.prefix_len() as u32).unwrap_or(u128::MAX))
            }
            Target::Range { start, end } => {
                Some(u32::from(*end).saturating_sub(u32::from(*start)) as u128 + 1)
            }
            Target::List(items) => Some(items.len() as u128),
            Target::Literal(_) => Some(1),
        }
    }

    /// Ordered, deduplicated address list.
    pub fn expand(&self, opts: &ExpandOptions) -> Result<Vec<String>> {
        if let Some(count) = self.host_count() {
            if count > opts.max_targets as u128 {
                return Err(EngineError::TargetTooLarge {
                    target: self.to_string(),
                    hosts: count.min(u64::MAX as u128) as u64,
                });
            }
        }

        let ips: Vec<String> = match self {
            Target::Lan => {
                let local = match opts.local {
                    Some(ip) => ip,
                    None => netdetect::primary_ipv4()?,
                };
                netdetect::lan_candidates(local, &opts.lan)
                    .into_iter()
                    .map(|ip| ip.to_string())
                    .collect()
            }
            Target::Cidr(IpNet::V4(n)) => {
                let start = u32::from(n.network());
                let end = u32::from(n.broadcast());
                let (first, last) = if n.prefix_len() >= 31 {
                    (start, end)
                } else {
                    (start + 1, end - 1)
                };
                (first..=last).map(|v| Ipv4Addr::from(v).to_string()).collect()
            }
            Target::Cidr(IpNet::V6(n)) => {
                let start = u128::from(n.network());
                let end = u128::from(n.broadcast());
                (start..=end).map(|v| Ipv6Addr::from(v).to_string()).collect()
            }
            Target::Range { start, end } => (u32::from(*start)..=u32::from(*end))
                .map(|v| Ipv4Addr::from(v).to_string())
                .collect(),
            Target::List(items) => items.clone(),
            Target::Literal(s) => vec![s.clone()],
        };

        Ok(dedup_in_order(ips))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Lan => f.write_str("auto"),
            Target::Cidr(n) => write!(f, "{n}"),
            Target::Range { start, end } => write!(f, "{start}-{end}"),
            Target::List(items) => f.write_str(&items.join(",")),
            Target::Literal(s) => f.write_str(s),
        }
    }
}

/// Permissive parse + expansion with default limits.
pub fn expand(target: &str) -> Result<Vec<String>> {
    Target::parse(target)?.expand(&ExpandOptions::default())
}

fn parse_range(s: &str, start: Ipv4Addr, end: &str) -> Result<Target> {
    let end = if let Ok(ip) = end.parse::<Ipv4Addr>() {
        ip
    } else {
        let last: u8 = end
            .parse()
            .map_err(|_| EngineError::InvalidTarget(format!("{s}: bad range end")))?;
        let o = start.octets();
        Ipv4Addr::new(o[0], o[1], o[2], last)
    };
    if start > end {
        return Err(EngineError::InvalidTarget(format!(
            "{s}: range start is after range end"
        )));
    }
    Ok(Target::Range { start, end })
}

fn is_hostname(s: &str) -> bool {
    // all-numeric dotted input is a broken address, not a name
    let numeric = s.split('.').all(|l| l.chars().all(|c| c.is_ascii_digit()));
    !numeric
        && s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn dedup_in_order(ips: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ips.len());
    ips.into_iter().filter(|ip| seen.insert(ip.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_excludes_network_and_broadcast() {
        assert_eq!(expand("192.168.1.0/30").unwrap(), vec!["192.168.1.1", "192.168.1.2"]);
    }

    #[test]
    fn tiny_cidrs_keep_every_address() {
        assert_eq!(expand("10.1.1.7/32").unwrap(), vec!["10.1.1.7"]);
        assert_eq!(expand("10.1.1.6/31").unwrap(), vec!["10.1.1.6", "10.1.1.7"]);
    }

    #[test]
    fn cidr_host_bits_are_masked() {
        assert_eq!(expand("10.0.0.9/30").unwrap(), vec!["10.0.0.9", "10.0.0.10"]);
    }

    #[test]
    fn keyword_is_case_insensitive() {
        assert_eq!(Target::parse("AUTO").unwrap(), Target::Lan);
        assert_eq!(Target::parse(" lan ").unwrap(), Target::Lan);
    }

    #[test]
    fn list_keeps_input_order_and_drops_repeats() {
        assert_eq!(
            expand(" 10.0.0.9 , 10.0.0.1,10.0.0.9 ").unwrap(),
            vec!["10.0.0.9", "10.0.0.1"]
        );
    }

    #[test]
    fn hostnames_with_dashes_are_literals() {
        assert_eq!(
            Target::parse_strict("core-switch.lan").unwrap(),
            Target::Literal("core-switch.lan".into())
        );
    }

    #[test]
    fn malformed_falls_back_to_literal() {
        for s in ["10.0.0.0/33", "10.0.0.9-10.0.0.1", "10.0.0.1-300", "not a host!"] {
            assert!(Target::parse_strict(s).is_err(), "{s} should be rejected in strict mode");
            assert_eq!(expand(s).unwrap(), vec![s.to_string()]);
        }
    }

    #[test]
    fn permissive_lists_skip_empty_entries() {
        assert_eq!(
            Target::parse("10.0.0.1,,10.0.0.2,").unwrap(),
            Target::List(vec!["10.0.0.1".into(), "10.0.0.2".into()])
        );
        assert!(Target::parse_strict("10.0.0.1,,10.0.0.2").is_err());
        assert!(matches!(Target::parse(" , ,"), Err(EngineError::EmptyTarget)));
    }

    #[test]
    fn lan_anchor_can_be_pinned() {
        let opts = ExpandOptions {
            local: Some(Ipv4Addr::new(172, 16, 4, 9)),
            ..ExpandOptions::default()
        };
        let ips = Target::Lan.expand(&opts).unwrap();
        assert_eq!(ips.first().map(String::as_str), Some("172.16.4.1"));
        assert!(ips.iter().all(|ip| ip.starts_with("172.16.4.")));
    }

    #[test]
    fn empty_is_always_an_error() {
        assert!(matches!(expand("   "), Err(EngineError::EmptyTarget)));
        assert!(matches!(Target::parse_strict(""), Err(EngineError::EmptyTarget)));
    }

    #[test]
    fn oversized_targets_are_refused() {
        let opts = ExpandOptions { max_targets: 100, ..ExpandOptions::default() };
        let err = Target::parse("10.0.0.0/24").unwrap().expand(&opts).unwrap_err();
        assert!(matches!(err, EngineError::TargetTooLarge { hosts: 254, .. }));
        assert!(Target::parse("10.0.0.0/25").unwrap().expand(&opts).is_err());
        assert_eq!(Target::parse("10.0.0.0/26").unwrap().expand(&opts).unwrap().len(), 62);
    }

    #[test]
    fn small_ipv6_blocks_expand() {
        let ips = expand("fd00::/126").unwrap();
        assert_eq!(ips, vec!["fd00::", "fd00::1", "fd00::2", "fd00::3"]);
        assert!(expand("fd00::/64").is_err());
    }
}
