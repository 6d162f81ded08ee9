//! `pagesync fetch`

use std::fs::File;
use std::io::{self, BufWriter};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use pagesync_core::{
    Config, DeliveryMode, FetchOptions, OrderTerm, QuerySpec, SyncClient, SyncReport, SyncStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cli::FetchArgs;
use crate::output::{FetchProgress, write_records};

/// Exit code for a fetch that returned partial data.
pub const EXIT_INCOMPLETE: u8 = 2;

/// Build the query described by `args`.
pub fn build_spec(client: &SyncClient, args: &FetchArgs) -> Result<QuerySpec> {
    let mut builder = client.query(&args.url);
    if let Some(filter) = &args.filter {
        builder = builder.filter(filter);
    }
    if !args.select.is_empty() {
        builder = builder.select(&args.select);
    }
    if !args.expand.is_empty() {
        builder = builder.expand(&args.expand);
    }
    for raw in &args.order_by {
        let term = OrderTerm::parse(raw).with_context(|| format!("invalid --order-by '{raw}'"))?;
        builder = builder.order_term(term);
    }
    if let Some(size) = args.page_size {
        builder = builder.page_size(size);
    }
    if let Some(job) = &args.job {
        builder = builder.job_key(job);
    }
    if let Some(n) = args.expect_at_most {
        builder = builder.expect_at_most(n);
    }
    Ok(builder.build(client.page_cap())?)
}

/// Options for `args`, defaulting to the `[sync]` section.
pub fn options(config: &Config, args: &FetchArgs, cancel: CancellationToken) -> FetchOptions {
    let defaults = FetchOptions::from_config(&config.sync);
    FetchOptions {
        max_concurrency: args.concurrency.unwrap_or(defaults.max_concurrency),
        resumable: args.resume,
        cache_enabled: args.cache,
        abort_threshold: args.abort_threshold.unwrap_or(defaults.abort_threshold),
        mode: if args.streaming {
            DeliveryMode::Streaming
        } else {
            DeliveryMode::Ordered
        },
        deadline: args.deadline.map(Duration::from_secs),
        total_estimate: args.total,
        cancel: Some(cancel),
        ..defaults
    }
}

/// Run a fetch and write its records.
pub async fn execute(config: Config, args: FetchArgs, quiet: bool) -> Result<ExitCode> {
    let progress = FetchProgress::new(!quiet);
    let client = SyncClient::new(config)?.with_progress(progress.callback());
    let spec = build_spec(&client, &args)?;
    debug!("query {} for {}", spec.signature(), spec.endpoint());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; stopping after in-flight pages");
            on_signal.cancel();
        }
    });

    let options = options(client.config(), &args, cancel);
    let report = client.fetch_all(&spec, options).await;
    progress.finish();
    let report = report?;

    match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_records(&mut BufWriter::new(file), &report.records, args.format)?;
        },
        None => write_records(&mut io::stdout().lock(), &report.records, args.format)?,
    }

    if !quiet || !report.is_complete() {
        print_summary(&report, spec.job_key(), args.resume);
    }

    Ok(if report.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INCOMPLETE)
    })
}

fn print_summary(report: &SyncReport, job: &str, resumable: bool) {
    let summary = report.to_string();
    let (headline, rest) = summary.split_once('\n').unwrap_or((summary.as_str(), ""));
    let headline = match report.status {
        SyncStatus::Complete => headline.green(),
        SyncStatus::PartialFailure { aborted: false } => headline.yellow(),
        _ => headline.red(),
    };
    eprintln!("{headline}");
    if !rest.is_empty() {
        eprintln!("{}", rest.dimmed());
    }
    if !report.is_complete() {
        if resumable {
            eprintln!("Re-run with --resume to continue '{job}' from its checkpoint.");
        } else {
            eprintln!("Pass --resume (and --job NAME) to make reruns pick up where this one stopped.");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use pagesync_core::SortDirection;
    use pagesync_core::testing::MemorySource;
    use std::sync::Arc;

    fn args(extra: &[&str]) -> FetchArgs {
        let mut argv = vec!["pagesync", "fetch", "https://example.com/odata/Items"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Fetch(args) => args,
            other => unreachable!("expected fetch, got {other:?}"),
        }
    }

    fn client() -> SyncClient {
        SyncClient::with_fetcher(Arc::new(MemorySource::sequential(1)), Config::default())
    }

    #[test]
    fn test_spec_from_flags() {
        let spec = build_spec(
            &client(),
            &args(&[
                "--filter",
                "Status eq 'Open'",
                "--select",
                "Id,Name",
                "--order-by",
                "CreatedAt desc",
                "--page-size",
                "50",
                "--job",
                "orders",
            ]),
        )
        .unwrap();
        assert_eq!(spec.filter_expr(), Some("Status eq 'Open'"));
        assert_eq!(spec.selected(), ["Id", "Name"]);
        assert_eq!(spec.ordering()[0].direction, SortDirection::Descending);
        assert_eq!(spec.page_size(), 50);
        assert_eq!(spec.job_key(), "orders");
    }

    #[test]
    fn test_bad_order_term_is_rejected() {
        let err = build_spec(&client(), &args(&["--order-by", "a sideways"])).unwrap_err();
        assert!(err.to_string().contains("--order-by"));
    }

    #[test]
    fn test_page_size_above_cap_is_rejected() {
        assert!(build_spec(&client(), &args(&["--page-size", "500"])).is_err());
    }

    #[test]
    fn test_options_fall_back_to_config() {
        let mut config = Config::default();
        config.sync.max_concurrency = 6;
        let opts = options(
            &config,
            &args(&["--streaming", "--deadline", "30"]),
            CancellationToken::new(),
        );
        assert_eq!(opts.max_concurrency, 6);
        assert_eq!(opts.mode, DeliveryMode::Streaming);
        assert_eq!(opts.deadline, Some(Duration::from_secs(30)));
        assert!(!opts.resumable);

        let opts = options(&config, &args(&["-c", "2", "--resume"]), CancellationToken::new());
        assert_eq!(opts.max_concurrency, 2);
        assert!(opts.resumable);
    }
}
