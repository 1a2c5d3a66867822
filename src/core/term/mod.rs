//! Styled-text decoding for terminal output.
//!
//! - **style**: color model, attribute flags, and the `StyledRun` output type
//! - **decoder**: incremental ANSI/SGR decoder with carriage-return
//!   overwrite semantics

pub mod decoder;
pub mod style;

pub use decoder::AnsiDecoder;
pub use style::{Color, StyleFlags, StyledRun, TextStyle};
