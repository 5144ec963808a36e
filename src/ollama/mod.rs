pub mod core;
pub mod stream;

pub use self::core::*;
pub use stream::{FrameError, LineBuffer, StreamEvent, parse_line};
