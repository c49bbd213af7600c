//! Async front end tying links, delivery machines and sequencers together.
//!
//! One control task owns all protocol state. Panels talk to it through a
//! [`ConsoleHandle`] and observe it through the [`ConsoleEvent`] stream.
pub mod task;
pub mod types;

pub use task::{ConsoleBuilder, ConsoleHandle};
pub use types::*;
