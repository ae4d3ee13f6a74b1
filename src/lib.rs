pub mod agent;
pub mod api;
pub mod app;
pub mod config;
pub mod criteria;
pub mod diff;
pub mod errors;
pub mod evidence;
pub mod failure;
pub mod functional;
pub mod gate;
pub mod init;
pub mod logging;
pub mod preflight;
pub mod queue;
pub mod shell;
pub mod testing;
pub mod truth;
pub mod util;
pub mod worker;
pub mod workflow;
