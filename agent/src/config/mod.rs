//! Configuration files read by the piped

pub mod application;
pub mod piped;

/// The only configuration schema version understood by this agent
pub const API_VERSION: &str = "pipecd.dev/v1beta1";

pub const PIPED_KIND: &str = "Piped";
