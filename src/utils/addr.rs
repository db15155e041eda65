//! Helpers for parsing `host:port` style addresses.

use crate::utils::DsdcError;

/// Parses a `host:port` string into its hostname and port parts. The port
/// part must be present and numeric; the hostname part must be non-empty.
pub fn parse_host_port(s: &str) -> Result<(String, u16), DsdcError> {
    match s.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Ok((host.into(), port.parse::<u16>()?))
        }
        _ => Err(DsdcError::msg(format!(
            "invalid 'host:port' string '{}'",
            s
        ))),
    }
}
