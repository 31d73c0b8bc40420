use std::path::PathBuf;
use std::process::ExitCode;

use stackalign::batch::{split_reference, BatchAligner};
use stackalign::logger::DualLogger;
use stackalign::settings::load_settings;

const USAGE: &str = "usage: stackalign FILE...\n\n\
The first file in sorted order is the reference; every other file is\n\
aligned onto it. Files starting with the aligned prefix are ignored.";

fn run() -> anyhow::Result<bool> {
    let args: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if args.is_empty() || args.iter().any(|a| a.as_os_str() == "-h" || a.as_os_str() == "--help") {
        eprintln!("{}", USAGE);
        return Ok(!args.is_empty());
    }

    let config = load_settings();
    let Some((reference, queries)) = split_reference(&args, &config.aligned_prefix) else {
        anyhow::bail!("no input images left after skipping aligned outputs");
    };
    log::info!(
        "Reference {}, {} queries, detector {}",
        reference.display(),
        queries.len(),
        config.feature_detector
    );

    let report = BatchAligner::with_opencv(config).run(&reference, &queries)?;

    println!(
        "{} aligned, {} failed, {} skipped",
        report.succeeded(),
        report.failed(),
        report.skipped.len()
    );
    for (query, error) in report.failures() {
        println!("  {}: {}", query.display(), error);
    }
    Ok(report.failed() == 0)
}

fn main() -> ExitCode {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "stackalign=info");
    }
    let run_log = std::env::var_os("STACKALIGN_LOG_FILE").map(PathBuf::from);
    if let Err(e) = DualLogger::init(run_log.as_deref()) {
        eprintln!("Cannot initialise logging: {:#}", e);
    }

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
