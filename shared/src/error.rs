use thiserror::Error;

/// Failures raised while reading or writing protocol buffers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },

    #[error("no variable-length header is open")]
    NoOpenHeader,

    #[error("a variable-length header is already open")]
    HeaderAlreadyOpen,

    #[error("payload of {len} bytes does not fit a {field}-byte length field")]
    LengthOverflow { len: usize, field: usize },

    #[error("string is not terminated")]
    UnterminatedString,
}
