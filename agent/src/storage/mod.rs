//! On-disk layout of the piped working directory

pub mod layout;
