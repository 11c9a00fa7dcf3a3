//! Motor fault taxonomy.
//!
//! Every public core operation returns a `Result` with one of these variants;
//! the core never panics in the control path. Faults surfaced during a tick
//! latch the motor into error mode until an explicit clear.

/// Motor error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MotorError {
    /// Configuration rejected at init or fault-clear revalidation.
    ConfigInvalid,
    /// Bad argument to a public operation (non-positive dt, NaN setpoint).
    InvalidArgs,
    /// Operation on a motor that has not completed init.
    Uninitialized,
    /// Operation not applicable to the active driver variant.
    Unsupported,
    /// Hardware abstraction layer reported a failure.
    Hal,
    /// A phase current exceeded the configured maximum.
    Overcurrent,
    /// A phase voltage exceeded the configured maximum.
    Overvoltage,
    /// Hall sequence violation or non-finite feedback sample.
    SensorFault,
    /// Observer or PLL residual out of bounds for too many ticks.
    EstimatorDivergence,
    /// Commanded motion without measured motion for the stall dwell.
    Stall,
}
