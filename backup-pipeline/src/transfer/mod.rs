//! Size and duration formatting for transfer logs.

pub mod progress;

pub use progress::{format_bytes, format_duration};
