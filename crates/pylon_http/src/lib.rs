mod connection;
mod error;
mod reader;
pub mod responses;

pub use connection::{
    ClientConnection, ClientPeer, Connection, ConnectionReader, ConnectionWriter, Peer,
    UpstreamConnection, UpstreamPeer,
};
pub use error::{ConnectionError, HttpParseError, ReadError};
pub use reader::{HeadInfo, HttpMessageChunk, HttpReader, MessageKind, RequestKind, ResponseKind};
