//! Integration tests for the piped library

mod support;
mod test_cache;
mod test_notifier;
mod test_pipeline;
