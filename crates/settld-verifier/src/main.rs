//! settld-verify
//!
//! Offline verifier for job-proof bundles. Re-derives every integrity claim
//! from the bundle's bytes: file digests, event-chain hashes, settlement
//! bindings, the policy snapshot hash and the governance trust roots.
//!
//! Usage:
//!   settld-verify --job-proof <dir> [--strict] [--hash-concurrency <N>] [--timeout-secs <N>]
//!
//! Exit codes: 0 = ok, 1 = verification failed, 2 = argument or input error,
//! 124 = timeout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::error;

mod bundle;

use bundle::JobProofBundle;

#[derive(Parser, Debug)]
#[command(
    name = "settld-verify",
    version,
    about = "Settld offline job-proof verifier"
)]
struct Args {
    /// Directory containing the job-proof bundle.
    #[arg(long)]
    job_proof: PathBuf,

    /// Treat warnings as errors.
    #[arg(long, default_value_t = false)]
    strict: bool,

    /// Bound on parallel file hashing.
    #[arg(long, default_value_t = 4)]
    hash_concurrency: usize,

    /// Overall verification timeout in seconds.
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

const EXIT_OK: u8 = 0;
const EXIT_VERIFICATION_FAILED: u8 = 1;
const EXIT_INPUT_ERROR: u8 = 2;
const EXIT_TIMEOUT: u8 = 124;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let bundle = match JobProofBundle::load(&args.job_proof) {
        Ok(bundle) => bundle,
        Err(e) => {
            error!(error = %e, "failed to load job-proof bundle");
            return ExitCode::from(EXIT_INPUT_ERROR);
        }
    };

    let verify = bundle.verify(args.strict, args.hash_concurrency);
    let report = match tokio::time::timeout(Duration::from_secs(args.timeout_secs), verify).await
    {
        Ok(report) => report,
        Err(_) => {
            error!("verification timed out");
            return ExitCode::from(EXIT_TIMEOUT);
        }
    };

    match report.to_canonical_json() {
        Ok(json) => print!("{json}"),
        Err(e) => {
            error!(error = %e, "failed to serialize report");
            return ExitCode::from(EXIT_INPUT_ERROR);
        }
    }

    if report.passed() {
        ExitCode::from(EXIT_OK)
    } else {
        ExitCode::from(EXIT_VERIFICATION_FAILED)
    }
}
