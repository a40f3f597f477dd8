//! Wire protocol for ptycast.
//!
//! Remote clients speak a length-prefixed binary protocol over a single
//! ordered byte stream: a 2-byte message type followed by a typed body.
//! [`Frame`] is the decoded message, [`FrameCodec`] the stateful
//! encoder/decoder used with `tokio_util::codec`.

mod codec;
mod frame;

pub use codec::{CodecError, FrameCodec, MAX_DATA_LEN};
pub use frame::{Frame, Winch};
