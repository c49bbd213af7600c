pub mod parser;
pub mod types;

pub use parser::{classify, InboundDecoder};
pub use types::*;
