#![forbid(unsafe_code)]

use thiserror::Error;

use crate::messages::{Action, ClientCommand, ServerEvent};

/// Default maximum inbound/outbound frame size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json decode error: {0}")]
	Decode(#[source] serde_json::Error),

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),

	#[error("missing chat_id for action {action}")]
	MissingChatId {
		action: String,
	},
}

/// Decode a single client command from one transport frame.
///
/// Unknown actions decode successfully as `Action::Unknown`; anything that is
/// not a well-formed command object is an error.
pub fn decode_command(src: &[u8], max_frame_size: usize) -> Result<ClientCommand, CodecError> {
	if src.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: src.len(),
			max: max_frame_size,
		});
	}

	let cmd: ClientCommand = serde_json::from_slice(src).map_err(CodecError::Decode)?;

	match cmd.action {
		Action::Subscribe | Action::Unsubscribe if cmd.chat_id.is_none() => Err(CodecError::MissingChatId {
			action: cmd.action.to_string(),
		}),
		_ => Ok(cmd),
	}
}

/// Serialize a server event into one text frame.
pub fn encode_event(event: &ServerEvent, max_frame_size: usize) -> Result<String, CodecError> {
	let out = serde_json::to_string(event).map_err(CodecError::Encode)?;
	if out.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: out.len(),
			max: max_frame_size,
		});
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use campus_domain::ChatId;

	use super::*;
	use crate::messages::EventKind;

	#[test]
	fn decodes_subscribe() {
		let cmd = decode_command(br#"{"action":"subscribe","chat_id":42}"#, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		assert_eq!(cmd, ClientCommand::subscribe(ChatId(42)));
		assert_eq!(cmd.room().expect("room").as_str(), "chat_42");
	}

	#[test]
	fn unknown_action_is_not_an_error() {
		let cmd = decode_command(br#"{"action":"typing"}"#, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		assert_eq!(cmd.action, Action::Unknown("typing".to_string()));
		assert!(cmd.chat_id.is_none());
	}

	#[test]
	fn subscribe_without_chat_id_is_rejected() {
		let err = decode_command(br#"{"action":"unsubscribe"}"#, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		match err {
			CodecError::MissingChatId { action } => assert_eq!(action, "unsubscribe"),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn encode_rejects_too_large() {
		let ev = ServerEvent::new(EventKind::MessageCreated, serde_json::json!({ "text": "a".repeat(10_000) }));

		let err = encode_event(&ev, 32).unwrap_err();
		match err {
			CodecError::FrameTooLarge { len, max } => {
				assert!(len > max);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}
}
