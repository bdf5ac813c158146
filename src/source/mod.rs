pub mod matcher;
pub mod window;

pub use matcher::{FilenameMatch, FilenameMatcher, LogTimestamp, MatcherError};
pub use window::{scan, select_candidates, RawLogObject, Selection, WindowBounds};
