use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::style::Stylize;

use jobscope_cluster::{JobInfo, JobSource, PathResolver, ScontrolJobSource, StaticJobSource};
use jobscope_logs::{
    ChainMode, EventBus, EventPayload, FilterKind, FilterManager, FilterSpec, FilterType,
    FilteredStreamManager, SearchOptions, Span, StreamManager,
};
use jobscope_types::OutputKind;

mod config;

use config::Config;

/// Jobscope - tail and filter the output of cluster jobs
#[derive(Parser, Debug)]
#[command(name = "jobscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Job id to stream
    #[arg(value_name = "JOB_ID", required_unless_present = "list_presets")]
    job_id: Option<String>,

    /// Stream stderr instead of stdout
    #[arg(long)]
    stderr: bool,

    /// Only show lines containing this text
    #[arg(long, value_name = "PATTERN")]
    filter: Option<String>,

    /// Treat --filter as a regular expression
    #[arg(long, requires = "filter")]
    regex: bool,

    /// Only show lines at these levels (comma separated)
    #[arg(long, value_name = "LEVELS")]
    level: Option<String>,

    /// Only show lines newer than a window (5m, 1h, ...) or within START..END
    #[arg(long, value_name = "RANGE")]
    since: Option<String>,

    /// Keep lines that match any filter instead of all of them
    #[arg(long)]
    any: bool,

    /// Apply a saved filter preset by name
    #[arg(long, conflicts_with_all = ["filter", "level", "since"])]
    preset: Option<String>,

    /// Save the filters given on the command line as a preset
    #[arg(long, value_name = "NAME")]
    save_preset: Option<String>,

    /// Highlight matches of this query and report their line numbers
    #[arg(long, value_name = "QUERY")]
    search: Option<String>,

    /// Keep streaming new output until interrupted
    #[arg(short, long)]
    follow: bool,

    /// List filter presets and exit
    #[arg(long)]
    list_presets: bool,

    /// Config file (defaults to <config dir>/jobscope/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Lines kept in memory per stream
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Working directory of the job, skipping the scheduler lookup
    #[arg(long, value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// Declared output path of the job (with --workdir)
    #[arg(long, value_name = "PATH", requires = "workdir")]
    output: Option<String>,

    /// Node list of the job (with --workdir)
    #[arg(long, value_name = "NODES", requires = "workdir")]
    nodes: Option<String>,
}

impl Args {
    fn kind(&self) -> OutputKind {
        if self.stderr {
            OutputKind::Stderr
        } else {
            OutputKind::Stdout
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(size) = args.buffer_size {
        config.buffer_size = size;
    }

    let filters = Arc::new(match config.presets_dir() {
        Some(dir) => FilterManager::new(dir).context("Failed to load filter presets")?,
        None => FilterManager::in_memory(),
    });

    if args.list_presets {
        list_presets(&filters);
        return Ok(());
    }
    let Some(job_id) = args.job_id.clone() else {
        anyhow::bail!("a job id is required");
    };
    let kind = args.kind();

    apply_filters(&args, &filters)?;

    let source = job_source(&args, &job_id);
    let resolver = PathResolver::new(source, config.resolver_config(hostname().as_deref()));
    let streams = StreamManager::new(
        Arc::new(resolver),
        Arc::new(EventBus::new()),
        config.stream_config(),
    )?;
    let manager = FilteredStreamManager::new(
        Arc::new(streams),
        Arc::clone(&filters),
        config.search_history_size,
    );

    // Subscribe before starting so no live output is missed
    let mut live = args
        .follow
        .then(|| manager.subscribe_filtered(&job_id, kind));

    manager
        .start_filtered_stream(&job_id, kind)
        .await
        .with_context(|| format!("Failed to stream {} of job {}", kind, job_id))?;
    if !args.follow {
        // A finished job's last line may lack a newline
        manager.streams().flush_partial(&job_id, kind).await?;
    }

    if let Some(query) = &args.search {
        let results = manager.search(&job_id, kind, query, SearchOptions::default())?;
        let numbers: Vec<String> = results.iter().map(|r| r.line_number.to_string()).collect();
        eprintln!("{} matching lines: {}", results.len(), numbers.join(", "));
    }

    let styled = std::io::stdout().is_terminal();
    let mut out = std::io::stdout().lock();
    for line in manager.filtered_content(&job_id, kind)? {
        writeln!(out, "{}", render(&line.text, &line.spans, styled))?;
    }
    out.flush()?;
    drop(out);

    if let Some(subscription) = live.as_mut() {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = subscription.recv() => {
                    let Some(event) = event else { break };
                    match &event.payload {
                        EventPayload::Output { lines, .. } => {
                            let mut out = std::io::stdout().lock();
                            for line in lines {
                                let spans = manager.highlight_spans(&job_id, kind, line);
                                writeln!(out, "{}", render(line, &spans, styled))?;
                            }
                            out.flush()?;
                        }
                        EventPayload::Error { message } => eprintln!("Stream error: {message}"),
                        EventPayload::Stopped => break,
                        EventPayload::Started => {}
                    }
                }
            }
        }
        manager.stop_filtered_stream(&job_id, kind).await?;
    }

    manager.close();
    Ok(())
}

/// Scheduler lookup, or a fixed job when its directory is given directly
fn job_source(args: &Args, job_id: &str) -> Arc<dyn JobSource> {
    match &args.workdir {
        Some(dir) => {
            let mut job = JobInfo::new(job_id);
            job.working_dir = Some(dir.clone());
            match args.kind() {
                OutputKind::Stdout => job.stdout = args.output.clone(),
                OutputKind::Stderr => job.stderr = args.output.clone(),
            }
            job.node_list = args.nodes.clone().unwrap_or_default();
            Arc::new(StaticJobSource::new().with_job(job))
        }
        None => Arc::new(ScontrolJobSource::new()),
    }
}

/// Build and activate the chain requested on the command line
fn apply_filters(args: &Args, filters: &FilterManager) -> Result<()> {
    if let Some(name) = &args.preset {
        let preset = filters
            .preset_by_name(name)
            .with_context(|| format!("Preset '{}' not found", name))?;
        filters.load_preset(&preset.id)?;
        return Ok(());
    }

    let mut specs = Vec::new();
    if let Some(pattern) = &args.filter {
        specs.push(if args.regex {
            FilterSpec::regex(pattern)
        } else {
            FilterSpec::keyword(pattern)
        });
    }
    if let Some(levels) = &args.level {
        let kind = FilterKind::from_pattern(levels, FilterType::LogLevel)?;
        specs.push(FilterSpec::new(format!("level: {levels}"), kind));
    }
    if let Some(range) = &args.since {
        let kind = FilterKind::from_pattern(range, FilterType::TimeRange)?;
        specs.push(FilterSpec::new(format!("since: {range}"), kind));
    }
    if specs.is_empty() {
        if args.save_preset.is_some() {
            anyhow::bail!("--save-preset needs --filter, --level or --since");
        }
        return Ok(());
    }

    let mut ids = Vec::with_capacity(specs.len());
    for spec in specs {
        ids.push(filters.create_filter(spec)?.id().to_string());
    }
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
    let mode = if args.any { ChainMode::Any } else { ChainMode::All };
    let chain = filters.create_chain("command line", &ids, mode)?;
    filters.activate_chain(chain.id())?;

    if let Some(name) = &args.save_preset {
        filters.save_preset(name, "Saved from the command line", "Custom", Vec::new())?;
        eprintln!("Saved preset '{}'", name);
    }
    Ok(())
}

fn list_presets(filters: &FilterManager) {
    for (category, presets) in filters.presets_by_category() {
        println!("{}", category.bold());
        for preset in presets {
            println!(
                "  {:<24} {} (used {} times)",
                preset.name, preset.description, preset.use_count
            );
        }
    }
}

fn render(line: &str, spans: &[Span], styled: bool) -> String {
    if !styled {
        return line.to_string();
    }

    let mut out = String::with_capacity(line.len());
    let mut last_end = 0;
    for span in spans {
        if span.start < last_end
            || span.end > line.len()
            || !line.is_char_boundary(span.start)
            || !line.is_char_boundary(span.end)
        {
            continue;
        }
        out.push_str(&line[last_end..span.start]);
        out.push_str(&line[span.start..span.end].black().on_yellow().bold().to_string());
        last_end = span.end;
    }
    out.push_str(&line[last_end..]);
    out
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}
