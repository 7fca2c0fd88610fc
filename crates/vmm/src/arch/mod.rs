//! Machine-dependent constants, address validation, interrupt masking and TLB access.
//!
//! Kernel builds get the real hardware. Tests, and builds with the `software-emulation`
//! feature, get an emulated machine that runs on the host.

// Always compiled on x86_64 hosts so it keeps type-checking alongside the emulation.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;
