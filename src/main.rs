use std::process::ExitCode;

fn main() -> ExitCode {
    cellsnp_rs::init_tracing();
    match cellsnp_rs::cli::parse_from_env().and_then(cellsnp_rs::run_from_args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("cellsnp: {error}");
            ExitCode::from(1)
        }
    }
}
