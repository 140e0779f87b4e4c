// codehive-common: shared types and wire protocol for the Codehive workspace

pub mod protocol;
pub mod types;
