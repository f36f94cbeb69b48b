use std::io;
use std::path::PathBuf;

use portflow::config::PipelineConfig;
use portflow::filter::Filter;
use portflow::limiter::Strategy;
use portflow::ports::{self, PortSpec};
use portflow::sink::{CsvSink, ResultSink, SinkKind, SortedSink, StreamSink};
use portflow::types::RunSummary;
use portflow::Pipeline;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// portflow — bounded, cancellable async TCP connect scanner.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "portflow",
    version,
    about = "Bounded, cancellable async TCP connect scanner.",
    long_about = None
)]
struct Cli {
    /// Host to scan. Repeat for several hosts.
    #[arg(long = "host")]
    hosts: Vec<String>,

    /// Port(s) to scan, e.g. 80, 22-100 or 22,80,8000-8010.
    #[arg(long)]
    ports: Option<PortSpec>,

    /// Path to ports list file (one port or range per line).
    #[arg(long = "ports-file", conflicts_with = "ports")]
    ports_file: Option<PathBuf>,

    /// Max concurrent connect attempts (defaults to # of logical CPUs).
    #[arg(long)]
    workers: Option<usize>,

    /// Admission strategy: pool or semaphore.
    #[arg(long)]
    strategy: Option<Strategy>,

    /// Per-attempt connect timeout in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Stop the whole scan after this many seconds.
    #[arg(long)]
    deadline: Option<u64>,

    /// Grace period for in-flight probes after cancellation, in milliseconds.
    #[arg(long = "grace-ms")]
    grace_ms: Option<u64>,

    /// Result filter: open, all, class:<refused|timeout|unreachable|resource_exhausted|other>, contains:<text>.
    #[arg(long)]
    filter: Option<Filter>,

    /// Stop as soon as this many results passed the filter.
    #[arg(long = "stop-after")]
    stop_after: Option<usize>,

    /// Result sink.
    #[arg(long, value_enum)]
    sink: Option<SinkArg>,

    /// CSV destination when --sink csv is used.
    #[arg(long, default_value = "scans.csv")]
    out: PathBuf,

    /// Echo CSV records to stdout as they are persisted.
    #[arg(long, default_value_t = false)]
    echo: bool,

    /// JSON config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SinkArg {
    /// Print each result as it arrives.
    Stream,
    /// Collect, then print ordered by port.
    Sorted,
    /// Persist records to --out.
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = build_config(&cli)?;

    println!("portflow configuration:");
    println!("  hosts        : {}", config.hosts.join(", "));
    println!("  ports        : {}", config.ports);
    println!("  concurrency  : {}", config.concurrency);
    println!("  strategy     : {}", config.strategy);
    println!("  timeout_ms   : {}", config.per_attempt_timeout_ms);
    println!(
        "  deadline     : {}",
        config
            .overall_timeout_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("  filter       : {}", config.filter);

    let mut sink = make_sink(&config)?;
    let pipeline = Pipeline::new(config).context("invalid pipeline configuration")?;
    let _interrupt = pipeline.controller().listen_for_interrupt();

    let summary = pipeline.run(sink.as_mut()).await?;
    print_summary(&summary);
    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("failed to load config: {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if !cli.hosts.is_empty() {
        config.hosts = cli.hosts.clone();
    }
    if let Some(spec) = &cli.ports {
        config.ports = spec.clone();
    }
    if let Some(path) = &cli.ports_file {
        config.ports = ports::load_ports_from_path(path)?;
    }
    if let Some(w) = cli.workers {
        config.concurrency = w;
    }
    if let Some(s) = cli.strategy {
        config.strategy = s;
    }
    if let Some(ms) = cli.timeout_ms {
        config.per_attempt_timeout_ms = ms;
    }
    if let Some(secs) = cli.deadline {
        config.overall_timeout_ms = Some(secs.saturating_mul(1_000));
    }
    if let Some(ms) = cli.grace_ms {
        config.grace_ms = ms;
    }
    if let Some(f) = &cli.filter {
        config.filter = f.clone();
    }
    if cli.stop_after.is_some() {
        config.stop_after = cli.stop_after;
    }
    if let Some(kind) = cli.sink {
        config.sink = match kind {
            SinkArg::Stream => SinkKind::Stream,
            SinkArg::Sorted => SinkKind::Sorted,
            SinkArg::Csv => SinkKind::Csv {
                path: cli.out.clone(),
                echo: cli.echo,
            },
        };
    }
    Ok(config)
}

fn make_sink(config: &PipelineConfig) -> Result<Box<dyn ResultSink>> {
    let show_host = config.multi_host();
    let sink: Box<dyn ResultSink> = match &config.sink {
        SinkKind::Stream => Box::new(StreamSink::stdout(show_host)),
        SinkKind::Sorted => Box::new(SortedSink::stdout(show_host)),
        SinkKind::Csv { path, echo } => {
            let sink = CsvSink::create(path, show_host).with_context(|| {
                format!("failed to create scan results destination: {}", path.display())
            })?;
            info!(path = %path.display(), "persisting results as csv");
            if *echo {
                Box::new(sink.with_echo(Box::new(io::stdout())))
            } else {
                Box::new(sink)
            }
        }
    };
    Ok(sink)
}

fn print_summary(summary: &RunSummary) {
    println!(
        "\nScanned: {} of {} tasks, matched: {}, peak in flight: {}, elapsed: {:.2?}",
        summary.probed,
        summary.tasks_emitted,
        summary.matched,
        summary.peak_in_flight,
        summary.elapsed
    );
    if let Some(reason) = summary.cancelled {
        println!("Stopped early: {reason}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_flag_is_validated_by_clap() {
        let cli = Cli::try_parse_from(["portflow", "--sink", "csv", "--out", "x.csv"]).unwrap();
        let config = build_config(&cli).unwrap();
        assert_eq!(
            config.sink,
            SinkKind::Csv {
                path: "x.csv".into(),
                echo: false
            }
        );
        assert!(Cli::try_parse_from(["portflow", "--sink", "json"]).is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "portflow",
            "--host",
            "10.0.0.1",
            "--ports",
            "22-23",
            "--strategy",
            "semaphore",
            "--sink",
            "sorted",
        ])
        .unwrap();
        let config = build_config(&cli).unwrap();
        assert_eq!(config.hosts, vec!["10.0.0.1".to_string()]);
        assert_eq!(config.ports.count(), 2);
        assert_eq!(config.strategy, Strategy::Semaphore);
        assert_eq!(config.sink, SinkKind::Sorted);
    }
}
