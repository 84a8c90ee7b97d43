#![forbid(unsafe_code)]

pub mod frames;
pub mod framing;

pub use frames::{ErrorCode, HandshakeReply, Hello, InboundFrame, OutboundFrame};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};

/// Protocol version constants.
pub mod version {
	/// ALPN identifier negotiated on the QUIC handshake.
	pub const ALPN: &[u8] = b"parley-v1";
}
