//! Conversation turns: the model/tool loop, its events, and stored history.

pub mod conversation;
pub mod events;
pub mod runner;
pub mod types;

pub use conversation::*;
pub use events::*;
pub use runner::*;
pub use types::*;
