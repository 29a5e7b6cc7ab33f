pub mod cli;
pub mod client;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod screen;
