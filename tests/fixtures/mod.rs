//! Test fixtures.

pub mod swarm;

pub use swarm::{SwarmFixture, SwarmNode};
