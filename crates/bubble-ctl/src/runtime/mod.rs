mod app;
mod config;
mod logging;
mod recorder;
mod telemetry;

pub use app::run_from_args;
