//! CLI domain: parse, route and output only.
//! No pipeline logic; the route table dispatches to the pipeline and the registry.

mod output;
mod parse;
mod route;

pub use output::{format_event, map_error};
pub use parse::{Cli, Commands};
pub use route::{read_documents, RunContext};
