pub mod can;
pub mod config;
pub mod messages;
pub mod motor;
pub mod platform;
pub mod runtime;

#[cfg(test)]
mod testing;
