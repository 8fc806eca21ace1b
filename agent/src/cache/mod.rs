//! In-memory caches

pub mod commit;
