use crate::types::ProbeResult;

/// Decide whether a probe result is a real device worth recording.
///
/// A failed probe or one without a "host is up" signal never is. Otherwise any
/// single diagnostic signal is enough: an open port, a hostname other than the
/// address itself, a MAC, a known OS, a vendor, a measured response time
/// (zero included), a TTL, or a named service.
pub fn is_device(result: &ProbeResult) -> bool {
    if result.is_failed() || !result.host_up {
        return false;
    }

    result.open_ports().next().is_some()
        || result
            .hostname
            .as_deref()
            .is_some_and(|h| !h.is_empty() && h != result.ip)
        || result.mac_address.as_deref().is_some_and(|m| !m.is_empty())
        || result
            .os_name
            .as_deref()
            .is_some_and(|os| !os.is_empty() && !os.eq_ignore_ascii_case("unknown"))
        || result.vendor.as_deref().is_some_and(|v| !v.is_empty())
        || result.response_time.is_some_and(|t| t.is_finite())
        || result.ttl.is_some()
        || !result.services.is_empty()
}
