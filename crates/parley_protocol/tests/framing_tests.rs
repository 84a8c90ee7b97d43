use bytes::BytesMut;
use parley_domain::{ChatId, EnvelopeKind, Username};
use parley_protocol::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, HandshakeReply, InboundFrame, OutboundFrame, decode_frame, encode_frame,
	encode_frame_default, encode_frame_into, frame_len_from_payload_len, try_decode_frame_from_buffer,
};
use proptest::prelude::*;

#[test]
fn decode_inbound_from_slice() {
	let msg = InboundFrame::chat_message(ChatId(5), "hi");

	let frame = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");
	let (decoded, consumed) = decode_frame::<InboundFrame>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode_frame");

	assert_eq!(consumed, frame.len());
	assert_eq!(decoded, msg);
}

#[test]
fn encode_frame_default_matches_explicit_default_limit() {
	let msg = InboundFrame::heartbeat();

	let a = encode_frame_default(&msg).expect("encode_frame_default");
	let b = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");

	assert_eq!(a, b);
}

#[test]
fn frame_prefix_is_big_endian_payload_len() {
	let msg = InboundFrame::notification(ChatId(1), "ping");
	let frame = encode_frame_default(&msg).expect("encode");

	let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
	assert_eq!(frame_len_from_payload_len(len), frame.len());

	let payload: serde_json::Value = serde_json::from_slice(&frame[4..]).expect("payload is json");
	assert_eq!(payload["type"], "notification");
}

#[test]
fn encode_into_appends_back_to_back_frames() {
	let mut buf = BytesMut::new();
	encode_frame_into(&mut buf, &InboundFrame::chat_message(ChatId(1), "a"), DEFAULT_MAX_FRAME_SIZE).expect("a");
	encode_frame_into(&mut buf, &InboundFrame::chat_message(ChatId(2), "b"), DEFAULT_MAX_FRAME_SIZE).expect("b");

	let first = try_decode_frame_from_buffer::<InboundFrame>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("first");
	let second = try_decode_frame_from_buffer::<InboundFrame>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("second");

	assert_eq!(first.content, "a");
	assert_eq!(second.chat_id, Some(ChatId(2)));
	assert!(buf.is_empty());
}

#[test]
fn handshake_reply_welcome_decodes() {
	let reply = HandshakeReply::Welcome {
		username: Username::new("alice").unwrap(),
		server_name: "parley-server/test".to_string(),
		max_frame_bytes: 1024,
	};
	let frame = encode_frame_default(&reply).expect("encode");
	let (decoded, _) = decode_frame::<HandshakeReply>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(decoded, reply);
}

#[test]
fn oversized_outbound_is_rejected_before_write() {
	let frame = OutboundFrame {
		kind: EnvelopeKind::ChatMessage,
		sender: Username::new("alice").unwrap(),
		content: "x".repeat(256),
		chat_id: Some(ChatId(9)),
	};

	match encode_frame(&frame, 64).unwrap_err() {
		FramingError::FrameTooLarge { len, max } => {
			assert_eq!(max, 64);
			assert!(len > 256);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

proptest! {
	#[test]
	fn incremental_decode_is_split_independent(
		contents in proptest::collection::vec("[a-z ]{0,40}", 1..8),
		cut in 1usize..16,
	) {
		let mut wire = Vec::new();
		for (i, c) in contents.iter().enumerate() {
			let msg = InboundFrame::chat_message(ChatId(i as u64), c.clone());
			wire.extend_from_slice(&encode_frame_default(&msg).unwrap());
		}

		let mut buf = BytesMut::new();
		let mut decoded = Vec::new();
		for chunk in wire.chunks(cut) {
			buf.extend_from_slice(chunk);
			while let Some(msg) = try_decode_frame_from_buffer::<InboundFrame>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
				decoded.push(msg.content);
			}
		}

		prop_assert!(buf.is_empty());
		prop_assert_eq!(decoded, contents);
	}
}
