//! Small helpers shared by the engine, the warehouse client and the CLI.

pub mod interval;
pub mod path_processing;
pub mod text_processing;

pub use interval::{IntervalError, parse_interval};
pub use path_processing::expand_tilde;
pub use text_processing::{redact_sensitive, truncate_for_log};
