//! Testing utilities and mock implementations
//!
//! Mocks for driving client sessions without sockets or a broker.

pub mod mocks;

pub use mocks::*;
