//! Error types produced by the decoder.

/// Everything that can go wrong while decoding an LZO1X stream.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The underlying source ran out of bytes in the middle of an
    /// instruction or a literal copy.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// The bitstream violated a structural invariant (invalid opcode
    /// sequencing, a malformed end-of-stream marker, an out-of-range
    /// back-reference, or an overflowing extended length).
    #[error("corrupt LZO1X stream: {0}")]
    CorruptStream(&'static str),

    /// A `Format` other than the ones this crate implements was requested.
    #[error("unsupported format")]
    Unsupported,

    /// Reserved for argument validation on non-generic entry points; not
    /// constructible through the current `R: std::io::Read` based API.
    #[error("invalid argument")]
    InvalidArgument,

    /// A genuine I/O failure from the underlying source.
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}
