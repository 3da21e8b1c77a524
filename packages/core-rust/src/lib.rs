//! capgate core: operation keys, argument values, fingerprints, clocks and the
//! capability module contract shared by the gateway and module authors.

pub mod clock;
pub mod hash;
pub mod key;
pub mod traits;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use hash::Fingerprint;
pub use key::{Interface, OperationKey, ParseKeyError};
pub use traits::CapabilityModule;
pub use types::{args, Arguments, Value};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
