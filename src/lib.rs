pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod retry;
pub mod supervisor;
pub mod tempfiles;
pub mod util;
pub mod worker;
