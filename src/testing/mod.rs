//! Testing utilities and mock implementations
//!
//! Mock transport, transport factory and control plane for exercising the
//! session manager without a broker or a cloud account.

pub mod mocks;

pub use mocks::*;
