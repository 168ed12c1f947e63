//! Node Manager transport: JAUS addresses, TCP framing and sequence numbers.

pub mod address;
pub mod sequence;
pub mod transport;

pub use address::{AddressParseError, JausAddress};
pub use sequence::SequenceCounter;
pub use transport::{decode_frame, encode_frame, Frame, FrameBuffer, FrameError, FrameKind};
