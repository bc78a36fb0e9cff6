#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use std::process::ExitCode;

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    match kubeserver_runtime::AgentArgs::parse_and_run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "Exiting");
            eprintln!("kubeserver-agent: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}
