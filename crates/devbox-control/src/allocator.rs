//! Port allocation.
//!
//! Ingress ports (cluster host mappings) and tunnel ports come from disjoint
//! configured ranges but share one [`Ledger`], so no two active records can
//! ever hold the same local port. Callers must hold the ledger lock and save
//! the ledger under that same acquisition.

use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use devbox_core::PortKind;
use devbox_store::{Holder, Ledger, PortRanges};

use crate::error::ErrorKind;

/// Picks free ports from the configured ranges.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    ranges: PortRanges,
}

impl PortAllocator {
    /// Create an allocator over `ranges`.
    #[must_use]
    pub const fn new(ranges: PortRanges) -> Self {
        Self { ranges }
    }

    /// The configured range for `kind`.
    #[must_use]
    pub const fn range(&self, kind: PortKind) -> RangeInclusive<u16> {
        match kind {
            PortKind::Ingress => self.ranges.ingress_range(),
            PortKind::Tunnel => self.ranges.tunnel_range(),
        }
    }

    /// Reserve a port of `kind` for `holder`.
    ///
    /// Takes `preferred` if it lies in the range and is free, otherwise the
    /// lowest free port in the range.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::ResourceExhausted` naming the kind and range if
    /// every port in the range is taken.
    pub fn reserve(
        &self,
        ledger: &mut Ledger,
        kind: PortKind,
        preferred: Option<u16>,
        holder: &Holder,
        at: DateTime<Utc>,
    ) -> Result<u16, ErrorKind> {
        let range = self.range(kind);
        let candidate = preferred
            .filter(|port| range.contains(port) && self.is_free(ledger, *port))
            .or_else(|| range.clone().find(|port| self.is_free(ledger, *port)));

        let Some(port) = candidate else {
            return Err(ErrorKind::ResourceExhausted {
                kind,
                start: *range.start(),
                end: *range.end(),
            });
        };

        ledger.reserve(port, kind, holder.clone(), at);
        tracing::debug!(port, %kind, %holder, "Reserved port");
        Ok(port)
    }

    /// Release `port`. Releasing an unreserved port is a no-op.
    pub fn release(ledger: &mut Ledger, port: u16) {
        if let Some(reservation) = ledger.release(port) {
            tracing::debug!(port, holder = %reservation.holder, "Released port");
        }
    }

    fn is_free(&self, ledger: &Ledger, port: u16) -> bool {
        !ledger.is_reserved(port) && (!self.ranges.probe_host || host_port_free(port))
    }
}

/// Returns true if nothing on this host is listening on `127.0.0.1:port`.
fn host_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
