mod error;
mod frame;
mod request;

pub use error::{ParseError, SendError};
pub use frame::{Frame, FrameHeader, Opcode, SizeClass};
pub use request::HttpRequest;
