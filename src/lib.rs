pub mod chat;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod hosting;
pub mod server;
pub mod stream;

#[cfg(test)]
mod testing;
