#![forbid(unsafe_code)]

pub mod frame;

pub use frame::{
	CLIENT_KINDS, ChatCreatedMeta, ClientFrame, ConnectionMeta, DEFAULT_MAX_FRAME_SIZE, ErrorMeta, FrameError,
	HistoryEntry, Inbound, MessageMeta, SERVER_KINDS, ServerFrame, TypingMeta, decode_client_frame,
	decode_server_frame, encode_client_frame, encode_server_frame,
};

