//! Framed transport and wire layouts for the per-context render protocol.

pub mod transport;
pub mod wire;
