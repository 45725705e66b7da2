//! A streaming LZO1X decompressor.
//!
//! [`Decoder`] wraps any [`std::io::Read`] source positioned at the start of
//! a raw LZO1X bitstream and exposes the decompressed bytes through a
//! pull-style `read` interface, as well as through [`std::io::Read`] itself
//! for interop with the rest of the ecosystem.
//!
//! ```
//! use std::io::{Cursor, Read};
//! use lzo1x_stream::Decoder;
//!
//! // "Hi" encoded as a literal preamble followed by the end-of-stream marker.
//! let compressed = [0x13, b'H', b'i', 0x11, 0x00, 0x00];
//! let mut decoder = Decoder::new(Cursor::new(compressed))?;
//! let mut out = Vec::new();
//! decoder.read_to_end(&mut out)?;
//! assert_eq!(out, b"Hi");
//! # Ok::<(), lzo1x_stream::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::cargo)]
#![warn(clippy::pedantic)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

mod decoder;
mod error;
mod window;

pub use decoder::{Decoder, Format};
pub use error::Error;
