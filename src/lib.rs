pub mod cli;
pub mod config;
pub mod errors;
pub mod input;
pub mod mplp;
pub mod pileup;
pub mod pipeline;
pub mod writer;

use cli::CellsnpArgs;
use errors::Result;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}

pub fn run_from_args(args: CellsnpArgs) -> Result<()> {
    pipeline::run(&args)
}
