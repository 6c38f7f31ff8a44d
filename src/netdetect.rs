use std::collections::HashSet;
use std::net::Ipv4Addr;

use if_addrs::{get_if_addrs, IfAddr};

use crate::error::{EngineError, Result};

/// How hard the `auto` target looks around the local address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanSampling {
    /// 1: own /24. 2: plus the neighbouring /24s. 3+: the enclosing /16.
    pub depth: u8,
    pub max_candidates: usize,
}

impl Default for LanSampling {
    fn default() -> Self {
        Self {
            depth: 1,
            max_candidates: 100,
        }
    }
}

/// First non-loopback IPv4 interface address.
pub fn primary_ipv4() -> Result<Ipv4Addr> {
    let mut addrs: Vec<Ipv4Addr> = get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) if !v4.ip.is_loopback() && !v4.ip.is_link_local() => Some(v4.ip),
            _ => None,
        })
        .collect();
    // Prefer private ranges so a public uplink does not win over the LAN.
    addrs.sort_by_key(|ip| (!ip.is_private(), u32::from(*ip)));
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::InvalidTarget("auto: no local IPv4 interface".into()))
}

/// Sampled candidate list for LAN auto-discovery around `local`.
///
/// Each depth adds a ring: the own /24, the neighbouring /24s, the enclosing
/// /16. Rings are drawn round-robin so a tight `max_candidates` still reaches
/// every ring. The gateway `.1` comes first and `local` is never included.
pub fn lan_candidates(local: Ipv4Addr, sampling: &LanSampling) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = local.octets();

    // own /24: gateway, then every 4th host
    let mut rings: Vec<Vec<Ipv4Addr>> = vec![std::iter::once(1u8)
        .chain((1..=254u8).step_by(4))
        .map(|host| Ipv4Addr::new(a, b, c, host))
        .collect()];

    if sampling.depth >= 2 {
        rings.push(
            [c.checked_sub(1), c.checked_add(1)]
                .into_iter()
                .flatten()
                .flat_map(|third| {
                    (1..=254u8)
                        .step_by(16)
                        .map(move |host| Ipv4Addr::new(a, b, third, host))
                })
                .collect(),
        );
    }

    if sampling.depth >= 3 {
        rings.push(
            (0..=255u8)
                .step_by(8)
                .flat_map(|third| [1, 254].map(|host| Ipv4Addr::new(a, b, third, host)))
                .collect(),
        );
    }

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut cursors: Vec<_> = rings.into_iter().map(Vec::into_iter).collect();
    while out.len() < sampling.max_candidates {
        let mut drew = false;
        for ring in cursors.iter_mut() {
            // skip entries already taken by a nearer ring
            for ip in ring.by_ref() {
                if ip != local && seen.insert(ip) {
                    out.push(ip);
                    drew = true;
                    break;
                }
            }
            if out.len() == sampling.max_candidates {
                break;
            }
        }
        if !drew {
            break;
        }
    }
    out
}
