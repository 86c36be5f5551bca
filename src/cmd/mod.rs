//! Command-line subcommands other than `run`.

pub mod route;

pub use route::RouteArgs;
