//! Port allocation for redirections.
//!
//! A candidate is accepted only when it is absent from the caller's
//! assignment table and a bind-and-release probe on the local host
//! succeeds. The scan is ascending so allocation order is reproducible.
//! Callers serialize allocations by holding their table lock across
//! `allocate` and the insert of the resulting record.
//!
//! `allocate` is blocking: it issues up to one bind per port in range.
//! Async callers run it on the blocking pool.

use std::collections::HashSet;
use std::net::TcpListener;
use std::ops::RangeInclusive;

use tracing::trace;

use crate::error::{ExposeError, ExposeResult};

#[derive(Debug, Clone)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    bind_host: String,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16, bind_host: impl Into<String>) -> Self {
        Self {
            start,
            end,
            bind_host: bind_host.into(),
        }
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    /// Lowest port in range that is neither in `taken` nor bound by
    /// anything else on this host.
    pub fn allocate(&self, taken: &HashSet<u16>) -> ExposeResult<u16> {
        for port in self.range() {
            if taken.contains(&port) {
                continue;
            }
            if self.is_bindable(port) {
                return Ok(port);
            }
            trace!(port, "port in use outside the assignment table");
        }
        Err(ExposeError::PortsExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Transient bind probe; the listener is dropped immediately.
    pub fn is_bindable(&self, port: u16) -> bool {
        TcpListener::bind((self.bind_host.as_str(), port)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn skips_taken_ports() {
        let (listener, port) = free_port();
        drop(listener);
        let alloc = PortAllocator::new(port, port, "127.0.0.1");
        assert_eq!(alloc.allocate(&HashSet::new()).unwrap(), port);

        let taken: HashSet<u16> = [port].into_iter().collect();
        assert!(matches!(
            alloc.allocate(&taken),
            Err(ExposeError::PortsExhausted { .. })
        ));
    }

    #[test]
    fn skips_ports_bound_by_other_sockets() {
        let (_held, port) = free_port();
        let alloc = PortAllocator::new(port, port, "127.0.0.1");
        assert!(!alloc.is_bindable(port));
        let err = alloc.allocate(&HashSet::new()).unwrap_err();
        assert!(matches!(err, ExposeError::PortsExhausted { start, end } if start == port && end == port));
    }

    #[test]
    fn ascending_scan_prefers_lowest() {
        let (a, pa) = free_port();
        let (b, pb) = free_port();
        drop(a);
        drop(b);
        let (lo, hi) = if pa < pb { (pa, pb) } else { (pb, pa) };
        let alloc = PortAllocator::new(lo, hi, "127.0.0.1");
        let taken: HashSet<u16> = (lo + 1..hi).collect();
        assert_eq!(alloc.allocate(&taken).unwrap(), lo);

        let taken: HashSet<u16> = (lo..hi).collect();
        assert_eq!(alloc.allocate(&taken).unwrap(), hi);
    }
}
