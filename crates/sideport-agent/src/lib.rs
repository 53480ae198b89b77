//! Resident guest agent: a line-oriented JSON command channel over TCP that
//! turns gesture requests into injected input.

pub mod backend;
pub mod protocol;
mod server;

pub use backend::{backend_from_name, GestureBackend, InputCommandBackend, LogBackend};
pub use protocol::{
    decode_request, decode_response, encode_line, Point, ProtocolError, Request, Response,
};
pub use server::{
    AgentConfig, AgentServer, DEFAULT_READ_TIMEOUT, MAX_LINE_BYTES, WELCOME_MESSAGE,
};
