use std::path::PathBuf;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    hpc_console::init_logging();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    match hpc_console::run(config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
