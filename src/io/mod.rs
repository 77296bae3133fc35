//! Dataset loading and output plumbing.

pub mod dataset;
pub mod output;

pub use dataset::{load_dataset, save_dataset};
pub use output::setup_output;
