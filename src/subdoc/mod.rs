//! Sub-document execution: path parsing (C4 support), the pluggable
//! `SubdocEngine` trait and its reference `JsonPathEngine` (C4), the
//! single-path executor (C5), and the multi-path coordinators (C6).

pub mod engine;
pub mod executor;
pub mod multipath;
pub mod path;

pub use engine::{JsonPathEngine, SubdocCommand, SubdocEngine, SubdocEngineError};
pub use executor::execute_single_path;
pub use multipath::{execute_multi_lookup, execute_multi_mutation};
