//! Topic matching
//!
//! Topic name/filter validation for the wire layer and compiled topic
//! patterns with named captures for routing.

mod pattern;
pub mod validation;

pub use pattern::{
    compile_all, matches_any, validate_literal_segment, Params, PatternError, TopicPattern,
};
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};
