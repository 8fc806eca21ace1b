//! Control plane client

pub mod client;
pub mod pipedservice;

#[cfg(test)]
pub mod fake;
