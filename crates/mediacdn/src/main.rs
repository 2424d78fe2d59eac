//! mediacdn.
//!
//! A two-tier delivery setup for media files. The `edge` node answers client requests from a local
//! filesystem cache and pulls missing objects from a single upstream `origin`, which serves a
//! directory tree of files with on-demand content-type detection.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
