use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::{error, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod error;
mod extract;
mod fetch;
mod llm;
mod pipeline;
mod report;
mod store;
mod types;
mod utils;

use config::Config;
use extract::Extractor;
use fetch::Fetcher;
use llm::ChatClient;
use pipeline::{Outcome, Pipeline, RunOptions, RunSummary};
use report::Reporter;
use store::{Store, STATS_TOP_N};
use utils::osc8_file_link;

#[derive(Parser)]
#[command(name = "douban-spider")]
#[command(about = "Douban Top 250 scraper with AI-assisted parsing, SQLite storage and charts")]
struct Cli {
    /// CONL config file (defaults to spider.conl when present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// SQLite database file, overriding the config
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, parse, store and chart the listing
    Run {
        /// Number of listing pages to fetch (25 movies each)
        #[arg(short, long)]
        pages: Option<u32>,
        /// Fetch a single page only
        #[arg(long)]
        test: bool,
        /// Use the existing database instead of fetching
        #[arg(long)]
        skip_fetch: bool,
        /// Store listing text without calling the completion endpoint
        #[arg(long)]
        skip_ai: bool,
        /// Do not render charts and reports
        #[arg(long)]
        skip_charts: bool,
    },
    /// Show database statistics
    Info {
        /// Show a single movie by rank
        #[arg(long, conflicts_with = "year")]
        rank: Option<u32>,
        /// List movies released in a year
        #[arg(long)]
        year: Option<i32>,
    },
    /// Delete every stored movie
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Render charts and reports from the current database
    Report,
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Log to stderr, and also to `log_file` when one is configured
fn init_tracing(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, file_error) = match log_file.map(open_log_file).transpose() {
        Ok(file) => (
            file.map(|f| fmt::layer().with_ansi(false).with_writer(Mutex::new(f))),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        warn!("Logging to stderr only: {:#}", e);
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    Ok(config)
}

fn print_summary(summary: &RunSummary, config: &Config) {
    println!();
    println!("{}", "=".repeat(60));
    match &summary.outcome {
        Outcome::Completed => println!("Run completed"),
        Outcome::CompletedWithWarnings { warnings } => {
            println!("Run completed with {} warning(s)", warnings)
        }
        Outcome::Aborted { stage, reason } => println!("Run aborted at {} stage: {}", stage, reason),
    }
    println!("{}", "=".repeat(60));
    println!("  Movies fetched:   {}", summary.blocks_fetched);
    if !summary.failed_pages.is_empty() {
        let pages: Vec<String> = summary.failed_pages.iter().map(|p| p.to_string()).collect();
        println!("  Failed pages:     {}", pages.join(", "));
    }
    println!("  Movies parsed:    {}", summary.records_extracted);
    println!("  Partial records:  {}", summary.partial_records);
    println!("  Movies saved:     {}", summary.inserted);
    if summary.rejected > 0 {
        println!("  Rejected:         {}", summary.rejected);
    }
    println!("  Database:         {}", osc8_file_link(&config.db_path, &config.db_path.display().to_string()));
    if let Some(report) = &summary.report {
        println!("  Artifacts:");
        for path in &report.written {
            println!("    {}", osc8_file_link(path, &path.display().to_string()));
        }
        for (name, reason) in &report.skipped {
            println!("    {} skipped ({})", name, reason);
        }
    }
}

/// What a run needs settled before it touches the network or the database
struct RunPlan {
    pages: u32,
    extractor: Option<Extractor<ChatClient>>,
}

fn plan_run(
    config: &Config,
    pages: Option<u32>,
    test: bool,
    skip_fetch: bool,
    skip_ai: bool,
) -> Result<RunPlan> {
    let pages = if test { 1 } else { pages.unwrap_or(config.pages) };
    if pages == 0 || pages > config.max_pages() {
        bail!("--pages must be between 1 and {}", config.max_pages());
    }

    let extractor = if !skip_fetch && !skip_ai {
        let api_key = config.require_api_key()?;
        let client = ChatClient::new(api_key, config).context("Failed to build completion client")?;
        Some(Extractor::new(client, config))
    } else {
        None
    };
    Ok(RunPlan { pages, extractor })
}

fn run_pipeline(
    config: &Config,
    pages: Option<u32>,
    test: bool,
    skip_fetch: bool,
    skip_ai: bool,
    skip_charts: bool,
) -> Result<u8> {
    let RunPlan { pages, mut extractor } = plan_run(config, pages, test, skip_fetch, skip_ai)?;

    let mut store = Store::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    let reporter = Reporter::new(&config.output_dir);
    let mut fetcher = Fetcher::new(config).context("Failed to build HTTP client")?;

    let options = RunOptions {
        pages,
        skip_fetch,
        skip_ai,
        skip_report: skip_charts,
    };
    let summary = Pipeline::new(&mut fetcher, extractor.as_mut(), &mut store, &reporter).run(&options);

    print_summary(&summary, config);
    if let Some(extractor) = &extractor {
        let stats = extractor.stats();
        println!(
            "  AI parsing:       {} structured, {} partial, {} tokens",
            stats.structured, stats.partial, stats.usage.total_tokens
        );
    }
    Ok(summary.outcome.exit_code())
}

fn run_info(config: &Config, rank: Option<u32>, year: Option<i32>) -> Result<u8> {
    let store = Store::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;

    if let Some(rank) = rank {
        let Some(movie) = store.get_by_rank(rank)? else {
            println!("No movie stored at rank {}", rank);
            return Ok(1);
        };
        println!("#{} {} ({})", movie.rank, movie.title, movie.status.as_str());
        if let Some(director) = &movie.director {
            println!("  Director: {}", director);
        }
        if !movie.actors.is_empty() {
            println!("  Actors:   {}", movie.actors.join(", "));
        }
        if let Some(year) = movie.year {
            println!("  Year:     {}", year);
        }
        if let Some(country) = &movie.country {
            println!("  Country:  {}", country);
        }
        if !movie.genres.is_empty() {
            println!("  Genres:   {}", movie.genres.join(" / "));
        }
        println!("  Rating:   {:.1} ({} votes)", movie.rating, movie.vote_count);
        if let Some(quote) = &movie.quote {
            println!("  Quote:    {}", quote);
        }
        if let Some(summary) = &movie.ai_summary {
            println!("  Summary:  {}", summary);
        }
        return Ok(0);
    }

    if let Some(year) = year {
        let movies = store.get_by_year(year)?;
        println!("{} movie(s) from {}:", movies.len(), year);
        for movie in movies {
            println!("  #{} {} ({:.1})", movie.rank, movie.title, movie.rating);
        }
        return Ok(0);
    }

    let stats = store.get_stats()?;
    println!("Database: {}", config.db_path.display());
    println!("Total movies: {}", stats.total);
    if stats.total == 0 {
        return Ok(0);
    }
    if let Some(average) = stats.average_rating {
        println!("Average rating: {:.2}", average);
    }
    if let Some((first, last)) = stats.year_range {
        println!("Year range: {} - {}", first, last);
    }
    println!("Total votes: {}", stats.total_votes);
    println!(
        "Records: {} structured, {} partial, {} raw",
        stats.structured, stats.partial, stats.raw
    );

    println!("\nTop {} movies:", STATS_TOP_N);
    for movie in &stats.top_rated {
        println!("  #{} {} ({:.1})", movie.rank, movie.title, movie.rating);
    }
    if !stats.top_directors.is_empty() {
        println!("\nTop {} directors:", STATS_TOP_N);
        for (director, count) in &stats.top_directors {
            println!("  {}: {}", director, count);
        }
    }
    let genres = store.genre_distribution()?;
    if !genres.is_empty() {
        println!("\nTop genres:");
        for (genre, count) in genres.iter().take(STATS_TOP_N) {
            println!("  {}: {}", genre, count);
        }
    }
    let years = store.year_distribution()?;
    if let Some((year, count)) = years.iter().max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0))) {
        println!("\nBusiest year: {} ({} movies)", year, count);
    }
    Ok(0)
}

fn run_clear(config: &Config, yes: bool) -> Result<u8> {
    let store = Store::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;

    if !yes {
        print!(
            "Delete all {} movies from {}? Type 'yes' to confirm: ",
            store.count()?,
            config.db_path.display()
        );
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        if answer.trim() != "yes" {
            println!("Cancelled");
            return Ok(0);
        }
    }

    let removed = store.clear()?;
    println!("Deleted {} movies", removed);
    Ok(0)
}

fn run_report(config: &Config) -> Result<u8> {
    let store = Store::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    let records = store.get_all()?;
    if records.is_empty() {
        bail!("No movies in {}; run the scraper first", config.db_path.display());
    }

    let report = Reporter::new(&config.output_dir).render(&records)?;
    for path in &report.written {
        println!("  {}", osc8_file_link(path, &path.display().to_string()));
    }
    for (name, reason) in &report.skipped {
        println!("  {} skipped ({})", name, reason);
    }
    Ok(0)
}

fn run(command: Commands, config: Result<Config>) -> Result<u8> {
    let config = config?;

    match command {
        Commands::Run {
            pages,
            test,
            skip_fetch,
            skip_ai,
            skip_charts,
        } => run_pipeline(&config, pages, test, skip_fetch, skip_ai, skip_charts),
        Commands::Info { rank, year } => run_info(&config, rank, year),
        Commands::Clear { yes } => run_clear(&config, yes),
        Commands::Report => run_report(&config),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = load_config(&cli);
    init_tracing(config.as_ref().ok().and_then(|c| c.log_file.as_deref()));

    match run(cli.command, config) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use wiremock::matchers::any;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn offline_config(dir: &std::path::Path) -> Config {
        Config {
            api_key: None,
            db_path: dir.join("douban.db"),
            output_dir: dir.join("output"),
            ..Config::default()
        }
    }

    #[test]
    fn test_plan_requires_api_key_for_ai_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let config = offline_config(dir.path());

        let err = plan_run(&config, None, false, false, false).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingApiKey)
        ));

        let plan = plan_run(&config, None, false, false, true).unwrap();
        assert!(plan.extractor.is_none());
        assert_eq!(plan.pages, 10);
        assert!(plan_run(&config, None, false, true, false).unwrap().extractor.is_none());

        let keyed = Config {
            api_key: Some("sk-test".to_string()),
            ..config
        };
        assert!(plan_run(&keyed, None, false, false, false).unwrap().extractor.is_some());
    }

    #[test]
    fn test_log_file_creates_directories_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("spider.log");

        writeln!(open_log_file(&path).unwrap(), "first").unwrap();
        writeln!(open_log_file(&path).unwrap(), "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        assert!(open_log_file(dir.path()).is_err());
    }

    #[test]
    fn test_plan_page_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = offline_config(dir.path());

        assert_eq!(plan_run(&config, Some(4), true, false, true).unwrap().pages, 1);
        assert_eq!(plan_run(&config, Some(4), false, false, true).unwrap().pages, 4);
        assert!(plan_run(&config, Some(0), false, false, true).is_err());
        assert!(plan_run(&config, Some(11), false, false, true).is_err());
    }

    #[test]
    fn test_missing_key_fails_before_any_request() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let server = rt.block_on(MockServer::start());
        rt.block_on(
            Mock::given(any())
                .respond_with(ResponseTemplate::new(200))
                .mount(&server),
        );

        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            base_url: format!("{}/top250", server.uri()),
            api_base: server.uri(),
            delay_min_secs: 0.0,
            delay_max_secs: 0.0,
            ..offline_config(dir.path())
        };

        let err = run_pipeline(&config, Some(1), false, false, false, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingApiKey)
        ));
        let received = rt.block_on(server.received_requests()).unwrap();
        assert!(received.is_empty());
        assert!(!config.db_path.exists());
    }
}
