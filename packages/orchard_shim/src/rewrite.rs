//! Pure port-rewrite logic, shared by the libc interposition layer and tests.
//!
//! Ports travel through sockaddr structures in network byte order; the
//! `rewrite_v4` / `rewrite_v6` entry points take and return big-endian
//! values so the unsafe layer can splice results straight back into the
//! address structure.

/// Parsed activation state, read once from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimConfig {
    pub offset: u16,
    pub known_ports: Vec<u16>,
}

impl ShimConfig {
    /// Parse the two control variables. Returns `None` — shim disabled —
    /// when either is missing or malformed, the offset is 0, or the port
    /// set is empty.
    pub fn from_env_strings(offset: Option<&str>, ports: Option<&str>) -> Option<Self> {
        let offset = offset?.trim().parse::<u16>().ok()?;
        if offset == 0 {
            return None;
        }
        let known_ports: Vec<u16> = ports?
            .split(',')
            .filter_map(|p| p.trim().parse().ok())
            .collect();
        if known_ports.is_empty() {
            return None;
        }
        Some(Self {
            offset,
            known_ports,
        })
    }

    /// Offset-adjusted port for `port` (host byte order), or `None` when the
    /// port is outside the known set or the sum would overflow u16.
    pub fn rewritten_port(&self, port: u16) -> Option<u16> {
        if !self.known_ports.contains(&port) {
            return None;
        }
        port.checked_add(self.offset)
    }
}

/// True for 127.0.0.0/8 and INADDR_ANY. `addr` is in host byte order.
pub fn is_loopback_or_unspecified_v4(addr: u32) -> bool {
    addr == 0 || (addr >> 24) == 127
}

/// True for `::1`, `::`, and v4-mapped loopback/unspecified addresses.
pub fn is_loopback_or_unspecified_v6(octets: &[u8; 16]) -> bool {
    const LOOPBACK: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
    const UNSPECIFIED: [u8; 16] = [0; 16];
    if *octets == LOOPBACK || *octets == UNSPECIFIED {
        return true;
    }
    // v4-mapped: ::ffff:a.b.c.d
    if octets[..10] == [0; 10] && octets[10] == 0xff && octets[11] == 0xff {
        let v4 = u32::from_be_bytes([octets[12], octets[13], octets[14], octets[15]]);
        return is_loopback_or_unspecified_v4(v4);
    }
    false
}

/// Rewrite decision for an IPv4 sockaddr. `port_be` and `addr_be` are in
/// network byte order as read from `sockaddr_in`. For outbound calls
/// (connect) the rewrite only applies to loopback/unspecified targets, so
/// traffic to genuinely remote hosts is never touched.
pub fn rewrite_v4(cfg: &ShimConfig, port_be: u16, addr_be: u32, outbound: bool) -> Option<u16> {
    if outbound && !is_loopback_or_unspecified_v4(u32::from_be(addr_be)) {
        return None;
    }
    cfg.rewritten_port(u16::from_be(port_be)).map(u16::to_be)
}

/// Rewrite decision for an IPv6 sockaddr (same contract as [`rewrite_v4`]).
pub fn rewrite_v6(cfg: &ShimConfig, port_be: u16, octets: &[u8; 16], outbound: bool) -> Option<u16> {
    if outbound && !is_loopback_or_unspecified_v6(octets) {
        return None;
    }
    cfg.rewritten_port(u16::from_be(port_be)).map(u16::to_be)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ShimConfig {
        ShimConfig {
            offset: 10,
            known_ports: vec![3000, 5173],
        }
    }

    #[test]
    fn env_parsing_disables_on_zero_offset() {
        assert_eq!(ShimConfig::from_env_strings(Some("0"), Some("3000")), None);
    }

    #[test]
    fn env_parsing_disables_on_empty_port_set() {
        assert_eq!(ShimConfig::from_env_strings(Some("10"), Some("")), None);
        assert_eq!(ShimConfig::from_env_strings(Some("10"), None), None);
    }

    #[test]
    fn env_parsing_accepts_csv_with_spaces() {
        let cfg = ShimConfig::from_env_strings(Some("20"), Some("3000, 5173")).unwrap();
        assert_eq!(cfg.offset, 20);
        assert_eq!(cfg.known_ports, vec![3000, 5173]);
    }

    #[test]
    fn known_port_is_offset() {
        assert_eq!(cfg().rewritten_port(3000), Some(3010));
        assert_eq!(cfg().rewritten_port(5173), Some(5183));
    }

    #[test]
    fn unknown_port_passes_through() {
        assert_eq!(cfg().rewritten_port(8080), None);
    }

    #[test]
    fn overflowing_sum_passes_through() {
        let cfg = ShimConfig {
            offset: 100,
            known_ports: vec![65530],
        };
        assert_eq!(cfg.rewritten_port(65530), None);
    }

    #[test]
    fn inbound_v4_rewrites_any_address() {
        // bind() rewrites regardless of the address the socket binds to.
        let remote = u32::to_be(u32::from_be_bytes([192, 168, 1, 5]));
        let got = rewrite_v4(&cfg(), 3000u16.to_be(), remote, false);
        assert_eq!(got, Some(3010u16.to_be()));
    }

    #[test]
    fn outbound_v4_rewrites_loopback_only() {
        let loopback = u32::to_be(u32::from_be_bytes([127, 0, 0, 1]));
        let any = 0u32;
        let remote = u32::to_be(u32::from_be_bytes([93, 184, 216, 34]));
        assert_eq!(
            rewrite_v4(&cfg(), 3000u16.to_be(), loopback, true),
            Some(3010u16.to_be())
        );
        assert_eq!(
            rewrite_v4(&cfg(), 3000u16.to_be(), any, true),
            Some(3010u16.to_be())
        );
        assert_eq!(rewrite_v4(&cfg(), 3000u16.to_be(), remote, true), None);
    }

    #[test]
    fn outbound_v6_rewrites_loopback_only() {
        let mut loopback = [0u8; 16];
        loopback[15] = 1;
        let mut v4_mapped_loopback = [0u8; 16];
        v4_mapped_loopback[10] = 0xff;
        v4_mapped_loopback[11] = 0xff;
        v4_mapped_loopback[12] = 127;
        v4_mapped_loopback[15] = 1;
        let mut remote = [0u8; 16];
        remote[0] = 0x20;
        remote[1] = 0x01;

        assert_eq!(
            rewrite_v6(&cfg(), 5173u16.to_be(), &loopback, true),
            Some(5183u16.to_be())
        );
        assert_eq!(
            rewrite_v6(&cfg(), 5173u16.to_be(), &v4_mapped_loopback, true),
            Some(5183u16.to_be())
        );
        assert_eq!(rewrite_v6(&cfg(), 5173u16.to_be(), &remote, true), None);
    }

    #[test]
    fn inbound_v6_rewrites_any_address() {
        let mut remote = [0u8; 16];
        remote[0] = 0x20;
        let got = rewrite_v6(&cfg(), 5173u16.to_be(), &remote, false);
        assert_eq!(got, Some(5183u16.to_be()));
    }
}
