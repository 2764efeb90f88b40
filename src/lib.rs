pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod errors;
pub mod generation;
pub mod logging;
pub mod preview;
pub mod prompts;
pub mod server;
pub mod session;
pub mod stream;
pub mod workspace;
