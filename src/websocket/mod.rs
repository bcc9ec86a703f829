//! WebSocket frame parsing/encoding, the opening-handshake accept key,
//! and the handler trait applications implement.

mod handler;
mod handshake;
mod parser;

pub use handler::WsHandler;
pub use handshake::accept_key;
pub use parser::{encode_frame, Opcode, Parser};
