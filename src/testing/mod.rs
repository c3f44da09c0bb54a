//! Test support: mock collaborators and instrumented operations.

mod mocks;

pub use mocks::{adder, Accumulator, MockClock, Probe, SequenceIdSource};
