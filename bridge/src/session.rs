//! # GDB Session Tracking
//!
//! At most one GDB session exists system-wide at any instant: either the
//! USB-CDC channel or the network server owns the debugger, never both. The
//! tracker enforces this with a compare-and-swap on an atomic cell, closing
//! the check-then-use race the equivalent bare-bool bookkeeping would have.
//!
//! Readers (the outgoing-data router, the DAP consumer gate) load the state
//! without a lock; that is sufficient because activation is a CAS from
//! `Idle` only and deactivation is performed by the owning transport.

use core::sync::atomic::{AtomicU8, Ordering};

use log::{info, warn};

/// Which transport currently owns the GDB debugger, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum GdbSession {
    Idle = 0,
    ActiveOverUsb = 1,
    ActiveOverNetwork = 2,
}

impl GdbSession {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::ActiveOverUsb,
            2 => Self::ActiveOverNetwork,
            _ => Self::Idle,
        }
    }
}

/// Activation failed because another transport holds the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionBusy {
    /// The session that is currently active.
    pub active: GdbSession,
}

/// Atomic [`GdbSession`] cell with CAS activation.
pub struct SessionTracker {
    state: AtomicU8,
}

impl SessionTracker {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(GdbSession::Idle as u8),
        }
    }

    pub fn current(&self) -> GdbSession {
        GdbSession::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.current() == GdbSession::Idle
    }

    /// Gate read by the DAP consumer: commands must not reach the
    /// interpreter while a network GDB session drives the target.
    #[inline]
    pub fn is_network_active(&self) -> bool {
        self.current() == GdbSession::ActiveOverNetwork
    }

    /// Claim the session for one transport. Succeeds only from `Idle`.
    ///
    /// # Panics
    ///
    /// If called with [`GdbSession::Idle`], which is not a claimable state.
    pub fn try_activate(&self, session: GdbSession) -> Result<(), SessionBusy> {
        assert!(session != GdbSession::Idle, "cannot activate Idle");
        match self.state.compare_exchange(
            GdbSession::Idle as u8,
            session as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info!("gdb session active: {:?}", session);
                Ok(())
            }
            Err(active) => Err(SessionBusy {
                active: GdbSession::from_u8(active),
            }),
        }
    }

    /// Release the session. Only the owning transport releases; a stale
    /// release (e.g. a USB unmount racing a network accept) is ignored.
    pub fn deactivate(&self, session: GdbSession) {
        match self.state.compare_exchange(
            session as u8,
            GdbSession::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => info!("gdb session idle"),
            Err(active) => warn!(
                "stale deactivate of {:?} while {:?} is active",
                session,
                GdbSession::from_u8(active)
            ),
        }
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_idle() {
        let tracker = SessionTracker::new();
        assert_eq!(tracker.current(), GdbSession::Idle);
        assert!(tracker.is_idle());
        assert!(!tracker.is_network_active());
    }

    #[test]
    fn second_transport_is_refused() {
        let tracker = SessionTracker::new();
        tracker.try_activate(GdbSession::ActiveOverUsb).unwrap();

        let err = tracker
            .try_activate(GdbSession::ActiveOverNetwork)
            .unwrap_err();
        assert_eq!(err.active, GdbSession::ActiveOverUsb);
        assert_eq!(tracker.current(), GdbSession::ActiveOverUsb);
    }

    #[test]
    fn deactivate_releases_for_the_other_transport() {
        let tracker = SessionTracker::new();
        tracker.try_activate(GdbSession::ActiveOverNetwork).unwrap();
        assert!(tracker.is_network_active());

        tracker.deactivate(GdbSession::ActiveOverNetwork);
        assert!(tracker.is_idle());

        tracker.try_activate(GdbSession::ActiveOverUsb).unwrap();
        assert_eq!(tracker.current(), GdbSession::ActiveOverUsb);
    }

    #[test]
    fn stale_deactivate_is_ignored() {
        let tracker = SessionTracker::new();
        tracker.try_activate(GdbSession::ActiveOverUsb).unwrap();
        tracker.deactivate(GdbSession::ActiveOverNetwork);
        assert_eq!(tracker.current(), GdbSession::ActiveOverUsb);
    }

    #[test]
    fn concurrent_activation_admits_exactly_one() {
        for _ in 0..100 {
            let tracker = Arc::new(SessionTracker::new());
            let wins = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = [GdbSession::ActiveOverUsb, GdbSession::ActiveOverNetwork]
                .into_iter()
                .map(|session| {
                    let tracker = Arc::clone(&tracker);
                    let wins = Arc::clone(&wins);
                    thread::spawn(move || {
                        if tracker.try_activate(session).is_ok() {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(wins.load(Ordering::SeqCst), 1);
            assert_ne!(tracker.current(), GdbSession::Idle);
        }
    }
}
