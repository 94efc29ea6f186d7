/// Byte-stream decoding for the generate endpoint.
///
/// Raw socket bytes go through the [`Deframer`] (strips the HTTP status line and
/// headers once) and then the [`LineDecoder`] (one JSON object per line).
pub mod decoder;
pub mod deframe;

pub use decoder::{Event, GenerationStats, LineDecoder};
pub use deframe::Deframer;

use thiserror::Error;

/// Framing failures that end a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("connection closed before the HTTP header block was complete")]
    MissingHeaderTerminator,
    #[error("server answered with HTTP {0}")]
    HttpStatus(u16),
    #[error("stream closed before the model finished")]
    PrematureClose,
}
