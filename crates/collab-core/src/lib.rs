pub mod protocol;

pub use protocol::{
    decode_frame, encode_frame, ClientMessage, FrameError, ServerMessage, SessionId, UserIdentity,
    UserSummary, DEFAULT_MAX_FRAME_BYTES,
};
