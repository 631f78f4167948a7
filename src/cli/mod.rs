pub mod commands;
pub mod ui;
pub mod util;

pub use util::{
    CommandContext, build_request, context_entries, load_config, parse_context, parse_mode,
};
