//! Isolated worker process hosting one file transfer. Spawned by the
//! transfer manager; speaks line-oriented JSON on stdin/stdout, so all
//! logging goes to stderr.

use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(s3ferry::worker::serve()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("worker failed: {}", err);
            ExitCode::FAILURE
        }
    }
}
