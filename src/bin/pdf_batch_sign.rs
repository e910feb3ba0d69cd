//! Sign or verify PDFs from the command line.
//!
//! Usage:
//!   pdf-batch-sign sign --credential keys/alice --destination out/ --x 0.5 --y 0.1 a.pdf b.pdf
//!   pdf-batch-sign sign --credential keys/alice --config settings.json a.pdf
//!   pdf-batch-sign verify --trusted-root roots.pem out/a-signed.pdf
//!
//! `RUST_LOG` controls logging (default `info`); `-v` turns on debug output.

use clap::{Args, Parser, Subcommand};
use pdf_batch_signer::batch::{BatchCoordinator, BatchRequest, CancelHandle, Outcome};
use pdf_batch_signer::config::SignerConfig;
use pdf_batch_signer::placement::SignatureAnchor;
use pdf_batch_signer::signatures::{
    EnvPin, FileCredentialStore, NoPin, PinSource, SignatureVerifier, VerificationStatus,
    read_pem_certificates,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "pdf-batch-sign", version, about = "Batch PDF digital signing")]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign PDFs into a destination directory
    Sign(SignArgs),
    /// Check the signatures of PDFs
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
struct SignArgs {
    /// Credential directory holding certificate.pem and private_key.pem
    #[arg(long)]
    credential: String,

    /// Output directory; defaults to the settings file's `destination`
    #[arg(long)]
    destination: Option<PathBuf>,

    /// Horizontal anchor, 0 (left) to 1 (right)
    #[arg(long, default_value_t = 0.5)]
    x: f64,

    /// Vertical anchor, 0 (bottom) to 1 (top)
    #[arg(long, default_value_t = 0.1)]
    y: f64,

    /// Zero-based page index
    #[arg(long, default_value_t = 0)]
    page: usize,

    /// No visible appearance
    #[arg(long)]
    invisible: bool,

    /// Reason recorded in the signature
    #[arg(long)]
    reason: Option<String>,

    /// Location recorded in the signature
    #[arg(long)]
    location: Option<String>,

    /// PEM file of trusted root certificates (repeatable)
    #[arg(long = "trusted-root")]
    trusted_roots: Vec<PathBuf>,

    /// Files signed at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-file signing timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Environment variable holding the key PIN
    #[arg(long)]
    pin_env: Option<String>,

    /// PDFs to sign
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// PEM file of trusted root certificates (repeatable)
    #[arg(long = "trusted-root")]
    trusted_roots: Vec<PathBuf>,

    /// PDFs to check
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match cli.command {
        Command::Sign(args) => sign(args),
        Command::Verify(args) => verify(args),
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::from(2)
        },
    }
}

fn sign(args: SignArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SignerConfig::from_json_file(path)?,
        None => SignerConfig::default(),
    };
    if let Some(concurrency) = args.concurrency {
        config = config.with_concurrency(concurrency);
    }
    if let Some(secs) = args.timeout {
        config = config.with_signing_timeout(Duration::from_secs(secs));
    }
    if args.reason.is_some() {
        config.sign.reason = args.reason.clone();
    }
    if args.location.is_some() {
        config.sign.location = args.location.clone();
    }
    for root in &args.trusted_roots {
        config = config.with_trusted_root(root);
    }
    config.validate()?;
    let destination = config.resolve_destination(args.destination)?;

    let mut store = FileCredentialStore::new().with_exclusive_session(config.exclusive_session);
    for root in &config.trusted_roots {
        store = store.with_trusted_roots_pem_file(root)?;
    }

    let coordinator = BatchCoordinator::from_config(Arc::new(store), &config);
    let anchor = SignatureAnchor::new(args.x, args.y, args.page)?;
    let request = BatchRequest::new(args.files, anchor, destination, args.credential)
        .with_invisible(args.invisible);
    let pin: Box<dyn PinSource> = match args.pin_env {
        Some(var) => Box::new(EnvPin::new(var)),
        None => Box::new(NoPin),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(async {
        let cancel = CancelHandle::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupted; finishing files already being signed");
                on_interrupt.cancel();
            }
        });

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<pdf_batch_signer::BatchProgress>();
        let printer = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                println!(
                    "[{}/{}] {}",
                    progress.completed,
                    progress.total,
                    progress.current_file.display()
                );
            }
        });

        let report = coordinator.run(request, pin.as_ref(), Some(tx), Some(cancel)).await;
        let _ = printer.await;
        report
    })?;

    for result in report.in_input_order() {
        match &result.outcome {
            Outcome::Success {
                output,
                signature_digest,
            } => println!("ok    {} -> {} (sha256 {})", result.source.display(), output.display(), signature_digest),
            Outcome::Failure(e) => println!("FAIL  {}: {}", result.source.display(), e),
        }
    }
    println!("{}", report.summary());
    Ok(report.all_succeeded())
}

fn verify(args: VerifyArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let mut verifier = SignatureVerifier::new();
    for root in &args.trusted_roots {
        verifier.add_trusted_roots(read_pem_certificates(root)?);
    }

    let mut all_ok = true;
    for file in &args.files {
        let results = match verifier.verify_file(file) {
            Ok(results) => results,
            Err(e) => {
                println!("{}: cannot verify: {}", file.display(), e);
                all_ok = false;
                continue;
            },
        };
        if results.is_empty() {
            println!("{}: no signatures", file.display());
            all_ok = false;
            continue;
        }
        println!("{}: {} signature(s)", file.display(), results.len());
        for result in &results {
            let info = &result.signature_info;
            println!(
                "  {}: {} by {} at {}",
                info.field_name.as_deref().unwrap_or("?"),
                result.status,
                info.signer_name.as_deref().unwrap_or("unknown signer"),
                info.signing_time.as_deref().unwrap_or("unknown time")
            );
            if let Some(reason) = &info.reason {
                println!("    reason: {}", reason);
            }
            if let Some(location) = &info.location {
                println!("    location: {}", location);
            }
            for message in &result.messages {
                println!("    - {}", message);
            }
            all_ok &= result.status != VerificationStatus::Invalid;
        }
    }
    Ok(all_ok)
}
