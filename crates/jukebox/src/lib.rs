pub mod cli;
pub mod commands;
pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod fetch;
pub mod output;
pub mod queue;
pub mod resample;
pub mod resolver;
pub mod runtime;
pub mod scratch;
pub mod session;
pub mod transcode;

#[cfg(test)]
mod test_http;
