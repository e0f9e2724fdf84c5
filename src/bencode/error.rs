use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("empty input")]
    Empty,

    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("invalid integer at byte {0}")]
    InvalidInteger(usize),

    #[error("invalid string length at byte {0}")]
    InvalidLength(usize),

    #[error("unexpected byte {byte:#04x} at byte {pos}")]
    UnexpectedByte { byte: u8, pos: usize },

    #[error("dictionary key is not a byte string at byte {0}")]
    NonStringKey(usize),

    #[error("trailing data after value at byte {0}")]
    TrailingData(usize),

    #[error("nesting too deep")]
    NestingTooDeep,
}
