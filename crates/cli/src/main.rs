use std::process::ExitCode;

fn main() -> ExitCode {
    dealsync_cli::run()
}
