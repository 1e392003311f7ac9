#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod http;
pub mod listener;
pub mod messages;
pub mod registry;
pub mod sessions;
pub mod state;
pub mod store;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod connection_tests;


#[cfg(test)]
mod messages_tests;
