//! Caption model residency: which memory tier the weights occupy and who may
//! use them.
//!
//! - `controller`: the guarded owner of the model handle.
//! - `timer`: debounced idle eviction.

pub use controller::ResidencyController;
pub use timer::IdleEvictionTimer;

mod controller;
mod timer;
