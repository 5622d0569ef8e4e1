//! Terracache.
//!
//! Terracache is a standalone web service that serves the results of slow, rate-limited remote
//! geospatial computations. Results are cached in memory and on disk, the default
//! parameterization of every operation is precomputed in the background, and requests are
//! answered from the cache whenever possible.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

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
