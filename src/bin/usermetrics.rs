use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use usermetrics::date_util::{default_range, parse_date, DateWindow};
use usermetrics::report::{render_csv, render_json, render_text};
use usermetrics::timeseries::{parse_field_indices, SkipReason};
use usermetrics::{
    AggregateSummary, DataType, DispatchOptions, DispatchProgress, IntervalQuery, LogProgress,
    MalformedLinePolicy, MetricConfig, NoopProgress, RevertRateConfig, SnapshotQuery,
    SurvivalConfig, ThresholdConfig, TimeSeriesCompiler,
};

#[derive(Parser)]
#[command(name = "usermetrics", about = "Cohort user metrics and time-series dashboards")]
struct Cli {
    /// Database path (default: ~/.usermetrics/usermetrics.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl DispatchProgress for StderrProgress {
    fn on_entity_complete(&self, done: usize, total: usize) {
        if done == total {
            eprint!("\r  Users: {done}/{total}   \n");
        } else {
            eprint!("\r  Users: {done}/{total}   ");
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compute metrics over one or more cohorts
    Report {
        /// Cohort name or id expression (e.g. `1&2~3`); repeatable
        #[arg(long, required = true)]
        cohort: Vec<String>,
        /// Metric to compute; repeatable
        #[arg(long, value_enum, default_value = "threshold")]
        metric: Vec<MetricArg>,
        /// Minutes after registration for threshold/survival
        #[arg(long, default_value = "1440")]
        window_minutes: i64,
        /// Revisions needed to meet the threshold
        #[arg(long, default_value = "1")]
        min_count: u32,
        /// Restrict to a namespace; repeatable (default: all)
        #[arg(long)]
        namespace: Vec<i32>,
        /// Revisions scanned before each revision for reverts
        #[arg(long, default_value = "15")]
        look_back: usize,
        /// Revisions scanned after each revision for reverts
        #[arg(long, default_value = "15")]
        look_ahead: usize,
        /// Only evaluate revisions on or after this date (YYYY-MM-DD)
        #[arg(long)]
        period_start: Option<String>,
        /// Only evaluate revisions on or before this date (YYYY-MM-DD)
        #[arg(long)]
        period_end: Option<String>,
        /// Concurrent workers over users
        #[arg(long)]
        outer_pool: Option<usize>,
        /// Concurrent lookups per user
        #[arg(long)]
        inner_pool: Option<usize>,
        /// Concurrent report jobs
        #[arg(long)]
        max_jobs: Option<usize>,
        /// Per-user timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Show per-user progress on stderr
        #[arg(long)]
        progress: bool,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Compile snapshot files into datasource, graph and dashboard artifacts
    Compile {
        /// Directory holding the snapshot files
        #[arg(long)]
        dir: PathBuf,
        /// Only files whose names match this regex
        #[arg(long, default_value = ".*")]
        regex: String,
        /// First date included (default: 14 days ago)
        #[arg(long)]
        date_start: Option<String>,
        /// Last date included (default: today)
        #[arg(long)]
        date_end: Option<String>,
        /// Column set to sum: prod or revert
        #[arg(long, default_value = "prod")]
        data_type: String,
        /// Explicit comma-separated column indices (overrides --data-type)
        #[arg(long)]
        fields: Option<String>,
        #[arg(long, default_value = "user_metrics")]
        datasource_name: String,
        #[arg(long, default_value = "User Metrics")]
        dashboard_title: String,
        #[arg(long, default_value = "Daily totals")]
        graph_title: String,
        #[arg(long, default_value = "metrics")]
        tab: String,
        /// Output directory (default: config output_dir)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Skip only malformed lines instead of the rest of their file
        #[arg(long)]
        skip_lines: bool,
    },
    /// Build a time series from stored history, one point per registration
    /// interval, and compile it into dashboard artifacts
    Series {
        /// First day of the series (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// Last day of the series, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end: String,
        /// Hours per data point
        #[arg(long, default_value = "24")]
        interval_hours: i64,
        /// prod (threshold attainment) or revert (revert rate)
        #[arg(long, default_value = "prod")]
        data_type: String,
        /// Minutes after registration for the threshold
        #[arg(long, default_value = "1440")]
        window_minutes: i64,
        /// Revisions needed to meet the threshold
        #[arg(long, default_value = "1")]
        min_count: u32,
        /// Restrict to a namespace; repeatable (default: all)
        #[arg(long)]
        namespace: Vec<i32>,
        /// Revisions scanned on each side of a revision for reverts
        #[arg(long, default_value = "15")]
        revert_span: usize,
        /// Concurrent workers over users
        #[arg(long)]
        outer_pool: Option<usize>,
        /// Concurrent lookups per user
        #[arg(long)]
        inner_pool: Option<usize>,
        /// Intervals evaluated at once
        #[arg(long, default_value = "1")]
        max_intervals: usize,
        #[arg(long, default_value = "user_metrics_series")]
        datasource_name: String,
        #[arg(long, default_value = "User Metrics")]
        dashboard_title: String,
        #[arg(long, default_value = "Per interval")]
        graph_title: String,
        #[arg(long, default_value = "metrics")]
        tab: String,
        /// Output directory (default: config output_dir)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Manage stored cohorts
    Cohort {
        #[command(subcommand)]
        action: CohortAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show store status
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum MetricArg {
    Threshold,
    Survival,
    Revert,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Csv,
}

#[derive(Subcommand)]
enum CohortAction {
    /// List stored cohorts
    List,
    /// Print the members of a cohort or cohort expression
    Show { cohort: String },
    /// Create or replace a cohort from a file with one user id per line
    Import {
        name: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a cohort
    Delete { name: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => usermetrics::Database::open_at(path).await?,
        None => usermetrics::Database::open().await?,
    };
    let app = usermetrics::UserMetrics::new(db);

    match cli.command {
        Commands::Status => {
            print_status(&app).await?;
        }
        Commands::Config { action } => {
            handle_config(&app, action).await?;
        }
        Commands::Cohort { action } => {
            handle_cohort(&app, action).await?;
        }
        Commands::Report {
            cohort,
            metric,
            window_minutes,
            min_count,
            namespace,
            look_back,
            look_ahead,
            period_start,
            period_end,
            outer_pool,
            inner_pool,
            max_jobs,
            timeout_secs,
            progress,
            format,
        } => {
            let period = match (period_start, period_end) {
                (None, None) => None,
                (start, end) => Some(period_window(start.as_deref(), end.as_deref())?),
            };
            let metrics: Vec<MetricConfig> = metric
                .iter()
                .map(|m| match m {
                    MetricArg::Threshold => MetricConfig::Threshold(ThresholdConfig {
                        window_minutes,
                        min_count,
                        namespaces: namespace.clone(),
                    }),
                    MetricArg::Survival => MetricConfig::Survival(SurvivalConfig {
                        window_minutes,
                        namespaces: namespace.clone(),
                    }),
                    MetricArg::Revert => MetricConfig::RevertRate(RevertRateConfig {
                        look_back,
                        look_ahead,
                        period,
                        namespaces: namespace.clone(),
                    }),
                })
                .collect();

            let mut jobs = Vec::new();
            for name in &cohort {
                for config in &metrics {
                    let label = if metrics.len() > 1 {
                        format!("{name}/{}", config.kind())
                    } else {
                        name.clone()
                    };
                    jobs.push(usermetrics::ReportJob::new(label, name.as_str(), config.clone()));
                }
            }

            let settings = app.settings().await?;
            let mut options = dispatch_options(&settings, outer_pool, inner_pool, progress, verbose);
            options.entity_timeout = timeout_secs.map(Duration::from_secs);
            let max_jobs = max_jobs.unwrap_or(settings.max_concurrent_jobs);
            let reporter = progress_reporter(progress, verbose);

            let entries = app.run_report(jobs, options, max_jobs, reporter).await;
            match format {
                OutputFormat::Text => print!("{}", render_text(&entries)),
                OutputFormat::Json => println!("{}", render_json(&entries)?),
                OutputFormat::Csv => print!("{}", render_csv(&entries)),
            }
        }
        Commands::Series {
            start,
            end,
            interval_hours,
            data_type,
            window_minutes,
            min_count,
            namespace,
            revert_span,
            outer_pool,
            inner_pool,
            max_intervals,
            datasource_name,
            dashboard_title,
            graph_title,
            tab,
            out,
        } => {
            let data_type = data_type.parse::<DataType>()?;
            let metric = match data_type.interval_metric() {
                Some(MetricConfig::Threshold(_)) => MetricConfig::Threshold(ThresholdConfig {
                    window_minutes,
                    min_count,
                    namespaces: namespace,
                }),
                Some(MetricConfig::RevertRate(_)) => MetricConfig::RevertRate(RevertRateConfig {
                    look_back: revert_span,
                    look_ahead: revert_span,
                    period: None,
                    namespaces: namespace,
                }),
                _ => anyhow::bail!("data type {data_type:?} has no interval metric"),
            };

            let start = parse_date(&start)?.and_time(chrono::NaiveTime::MIN);
            let end = parse_date(&end)?
                .succ_opt()
                .ok_or_else(|| anyhow::anyhow!("end date out of range"))?
                .and_time(chrono::NaiveTime::MIN);
            let query = IntervalQuery {
                start,
                end,
                interval_hours,
                metric,
                max_concurrent_intervals: max_intervals,
            };

            let settings = app.settings().await?;
            let options = dispatch_options(&settings, outer_pool, inner_pool, false, verbose);
            let table = app
                .interval_series(&query, &options, progress_reporter(false, verbose))
                .await?;
            for row in &table.rows {
                println!("{}  {}", row.start, summarize(&row.summary));
            }

            let out_dir = out.unwrap_or(settings.output_dir);
            let mut compiler = TimeSeriesCompiler::new(out_dir);
            let artifacts = compiler.compile(
                &datasource_name,
                &dashboard_title,
                &graph_title,
                &tab,
                &table,
            )?;
            println!("Compiled {} intervals", table.rows.len());
            println!("  Datasource: {}", artifacts.datasource.id);
            println!("  Graph:      {}", artifacts.graph.id);
            println!("  Dashboard:  {}", artifacts.dashboard.id);
            println!("  Output:     {}", compiler.out_dir().display());
        }
        Commands::Compile {
            dir,
            regex,
            date_start,
            date_end,
            data_type,
            fields,
            datasource_name,
            dashboard_title,
            graph_title,
            tab,
            out,
            skip_lines,
        } => {
            let (default_start, default_end) = default_range(chrono::Local::now().date_naive());
            let start = match date_start {
                Some(s) => parse_date(&s)?,
                None => default_start,
            };
            let end = match date_end {
                Some(s) => parse_date(&s)?,
                None => default_end,
            };
            let field_indices = match fields {
                Some(f) => DataType::Custom(parse_field_indices(&f)?),
                None => data_type.parse::<DataType>()?,
            }
            .field_indices();

            let query = SnapshotQuery {
                dir,
                pattern: regex::Regex::new(&regex)?,
                start,
                end,
                field_indices,
                malformed_lines: if skip_lines {
                    MalformedLinePolicy::SkipLine
                } else {
                    MalformedLinePolicy::SkipRestOfFile
                },
            };
            let read = usermetrics::read_snapshots(&query)?;
            print_skipped(&read);
            if read.table.is_empty() {
                anyhow::bail!(
                    "no snapshot rows between {start} and {end} in {}",
                    query.dir.display()
                );
            }

            let out_dir = match out {
                Some(out) => out,
                None => app.settings().await?.output_dir,
            };
            let mut compiler = TimeSeriesCompiler::new(out_dir);
            let artifacts = compiler.compile(
                &datasource_name,
                &dashboard_title,
                &graph_title,
                &tab,
                &read.table,
            )?;
            println!("Compiled {} files into {} rows", read.files_read, read.table.rows.len());
            println!("  Datasource: {}", artifacts.datasource.id);
            println!("  Graph:      {}", artifacts.graph.id);
            println!("  Dashboard:  {}", artifacts.dashboard.id);
            println!("  Output:     {}", compiler.out_dir().display());
        }
    }

    Ok(())
}

/// CLI flags override stored settings, which override defaults. Without
/// `--progress`, `-v` still logs coarse progress.
fn dispatch_options(
    settings: &usermetrics::Settings,
    outer_pool: Option<usize>,
    inner_pool: Option<usize>,
    progress: bool,
    verbose: u8,
) -> DispatchOptions {
    let stored = settings.dispatch_options();
    DispatchOptions {
        outer_pool_size: outer_pool.unwrap_or(stored.outer_pool_size),
        inner_pool_size: inner_pool.unwrap_or(stored.inner_pool_size),
        log_progress: progress || verbose > 0,
        ..stored
    }
}

fn progress_reporter(progress: bool, verbose: u8) -> Arc<dyn DispatchProgress> {
    if progress {
        Arc::new(StderrProgress)
    } else if verbose > 0 {
        Arc::new(LogProgress)
    } else {
        Arc::new(NoopProgress)
    }
}

fn summarize(summary: &AggregateSummary) -> String {
    let rate = |r: Option<f64>| r.map_or("-".to_string(), |r| format!("{r:.4}"));
    match summary {
        AggregateSummary::Attainment(s) => format!(
            "registrations={} met={} proportion={}",
            s.total,
            s.met,
            rate(s.proportion)
        ),
        AggregateSummary::Revert(s) => format!(
            "revisions={} weighted_rate={} editors={} reverted_editors={}",
            s.total_revisions,
            rate(s.weighted_rate),
            s.editors,
            s.reverted_editors
        ),
    }
}

/// Open ends stay inside four-digit years; stored timestamps compare as text.
fn period_window(start: Option<&str>, end: Option<&str>) -> anyhow::Result<DateWindow> {
    let start = match start {
        Some(s) => parse_date(s)?,
        None => chrono::NaiveDate::from_ymd_opt(1, 1, 1)
            .ok_or_else(|| anyhow::anyhow!("invalid period start"))?,
    };
    let end = match end {
        Some(s) => parse_date(s)?,
        None => chrono::NaiveDate::from_ymd_opt(9999, 12, 31)
            .ok_or_else(|| anyhow::anyhow!("invalid period end"))?,
    };
    let end = end
        .and_hms_opt(23, 59, 59)
        .ok_or_else(|| anyhow::anyhow!("invalid period end"))?;
    Ok(DateWindow::new(start.and_time(chrono::NaiveTime::MIN), end)?)
}

fn print_skipped(read: &usermetrics::SnapshotRead) {
    if read.skipped.is_empty() {
        return;
    }
    eprintln!("Skipped {} file entries:", read.skipped.len());
    for skipped in &read.skipped {
        let reason = match &skipped.reason {
            SkipReason::NoDateToken => "no date in file name".to_string(),
            SkipReason::Unreadable(e) => format!("unreadable: {e}"),
            SkipReason::EmptyFile => "empty file".to_string(),
            SkipReason::SchemaMismatch(m) => format!("schema mismatch: {m}"),
            SkipReason::MalformedLine { line, message } => format!("line {line}: {message}"),
        };
        eprintln!("  {}: {reason}", skipped.file);
    }
}

async fn print_status(app: &usermetrics::UserMetrics) -> anyhow::Result<()> {
    let counts = app.status().await?;
    println!("Store Status");
    println!("  Pages:       {}", counts.pages);
    println!("  Revisions:   {}", counts.revisions);
    println!("  Registered:  {}", counts.registered_users);
    println!("  Cohorts:     {}", counts.cohorts);
    match (&counts.first_revision, &counts.last_revision) {
        (Some(first), Some(last)) => println!("  History:     {first} .. {last}"),
        _ => println!("  History:     empty"),
    }
    Ok(())
}

async fn handle_cohort(app: &usermetrics::UserMetrics, action: CohortAction) -> anyhow::Result<()> {
    match action {
        CohortAction::List => {
            let cohorts = app.cohort_list().await?;
            if cohorts.is_empty() {
                println!("No cohorts stored.");
            }
            for c in cohorts {
                println!(
                    "{:>4}  {:<24} {:>8} users  {}",
                    c.cohort_id,
                    c.name,
                    c.member_count,
                    c.description.as_deref().unwrap_or("")
                );
            }
        }
        CohortAction::Show { cohort } => {
            for user in app.cohort_members(&cohort).await? {
                println!("{user}");
            }
        }
        CohortAction::Import {
            name,
            file,
            description,
        } => {
            let content = std::fs::read_to_string(&file)?;
            let users: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect();
            let count = users.len();
            let id = app.cohort_save(&name, description.as_deref(), users).await?;
            println!("Saved cohort {name} (id {id}) with {count} users.");
        }
        CohortAction::Delete { name } => {
            if app.cohort_delete(&name).await? {
                println!("Deleted cohort {name}.");
            } else {
                println!("No cohort named {name}.");
            }
        }
    }
    Ok(())
}

async fn handle_config(app: &usermetrics::UserMetrics, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match app.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            app.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = app.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_stored_pool_sizes() {
        let settings = usermetrics::Settings::from_pairs(&[
            ("outer_pool_size".to_string(), "16".to_string()),
            ("inner_pool_size".to_string(), "6".to_string()),
        ])
        .unwrap();

        let options = dispatch_options(&settings, None, Some(2), false, 0);
        assert_eq!(options.outer_pool_size, 16);
        assert_eq!(options.inner_pool_size, 2);
        assert!(!options.log_progress);

        assert!(dispatch_options(&settings, None, None, false, 1).log_progress);
        assert!(dispatch_options(&settings, None, None, true, 0).log_progress);
    }
}
