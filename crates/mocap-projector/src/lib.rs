//! Projection of fused world poses onto the 2D client plane.

pub mod projection;

pub use projection::{OutputProjector, round_to_increment};
