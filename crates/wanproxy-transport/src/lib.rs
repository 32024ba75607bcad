#![warn(missing_docs)]

//! WANProxy transport subsystem: XCodec synchronization protocol (HELLO/FRAME/ASK/LEARN/ADVANCE/EOS)
//! and a tokio session driver.

pub mod config;
pub mod error;
pub mod frames;
pub mod pipe_pair;
pub mod protocol;
pub mod session;

pub use config::PipePairConfig;
pub use error::{Result, TransportError};
pub use frames::ReferenceFrames;
pub use pipe_pair::{DecoderState, EncoderState, PipeOutput, PipePair, PipePairStats};
pub use protocol::{Message, Opcode, MAX_ASK_HASHES, MAX_FRAME_LENGTH};
pub use session::{run_session, SessionStats};
