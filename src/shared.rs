//! Cross-context setpoint hand-off.
//!
//! The setpoint is the only datum shared between a command context and the
//! control tick; everything else in the core is single-owner. Publishing and
//! snapshotting go through a blocking mutex so the tick never observes a
//! torn value.

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::motor::Setpoint;

/// Shared setpoint cell.
///
/// Declare one as a `static`, publish from the command context and call
/// [`crate::motor::Motor::sync_setpoint`] at the top of the control tick.
pub struct SharedSetpoint {
    inner: Mutex<CriticalSectionRawMutex, Cell<Setpoint>>,
}

impl SharedSetpoint {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Cell::new(Setpoint::ZERO)),
        }
    }

    /// Publish a complete setpoint from the command context.
    pub fn publish(&self, setpoint: Setpoint) {
        self.inner.lock(|cell| cell.set(setpoint));
    }

    /// Latest published setpoint, read whole.
    pub fn snapshot(&self) -> Setpoint {
        self.inner.lock(|cell| cell.get())
    }
}

impl Default for SharedSetpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_returns_last_published() {
        let shared = SharedSetpoint::new();
        assert_eq!(shared.snapshot().velocity, 0.0);

        shared.publish(Setpoint {
            velocity: 100.0,
            torque: 0.5,
            ..Setpoint::ZERO
        });
        let snapshot = shared.snapshot();
        assert_eq!(snapshot.velocity, 100.0);
        assert_eq!(snapshot.torque, 0.5);

        shared.publish(Setpoint::ZERO);
        assert_eq!(shared.snapshot().velocity, 0.0);
    }

    #[test]
    fn test_static_declaration() {
        static SHARED: SharedSetpoint = SharedSetpoint::new();
        SHARED.publish(Setpoint {
            current: 2.0,
            ..Setpoint::ZERO
        });
        assert_eq!(SHARED.snapshot().current, 2.0);
    }
}
