#![forbid(unsafe_code)]

pub mod codec;
pub mod messages;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_SIZE, decode_command, encode_event};
pub use messages::{Action, ClientCommand, EventKind, ServerEvent};
