//! Profile execution: pacer, impairment shaper, and the per-profile
//! runner task that composes them into a pipeline.

pub mod pacer;
pub mod runner;
pub mod shaper;

pub use pacer::Pacer;
pub use runner::Engine;
pub use shaper::{Emission, Shaper};
