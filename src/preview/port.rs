use std::collections::HashSet;
use std::net::TcpListener;

use crate::errors::PreviewError;

/// Linear probe over `[base, base + window)`.
///
/// A candidate is taken when no live record holds it and a throwaway
/// listener can bind it on loopback.
pub fn allocate_port(base: u16, window: u16, held: &HashSet<u16>) -> Result<u16, PreviewError> {
    let end = base.saturating_add(window);
    for port in base..end {
        if held.contains(&port) {
            continue;
        }
        if port_is_free(port) {
            return Ok(port);
        }
    }
    Err(PreviewError::PortExhausted { base, end })
}

pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
