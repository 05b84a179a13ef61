//! Message history types exchanged with the model.

pub mod message;
pub mod usage;

pub use message::*;
pub use usage::*;
