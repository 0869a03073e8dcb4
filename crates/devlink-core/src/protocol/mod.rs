//! Protocol module containing message types and the binary codec.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{
    command_from_frame, decode_command, decode_response, encode_command, encode_response,
    response_from_frame, DecodeError, Frame, FrameDecoder,
};
pub use messages::*;
pub use sequence::SequenceCounter;
