use std::error::Error;
use std::path::Path;
use std::process;

use clap::{CommandFactory, Parser, Subcommand};
use jiff::civil::Date;
use log::{error, info, warn};
use tabled::{builder::Builder, settings::Style};

use casepipe::client::CdcCaseClient;
use casepipe::config::AppConfig;
use casepipe::db::cases_archive::{CdcCasesArchive, GroupCount};
use casepipe::transform;

#[derive(Parser, Debug)]
#[command(version, about = "CDC COVID-19 case surveillance ETL & analysis CLI", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the CDC COVID-19 case data and load it into MySQL
    Fetch {
        /// Number of rows to fetch per API call
        #[arg(long, default_value_t = 1000)]
        limit: usize,
        /// Maximum number of rows to fetch in total
        #[arg(long)]
        max_rows: Option<usize>,
        /// Number of rows to process in each chunk
        #[arg(long, default_value_t = 1000)]
        chunk_size: usize,
        /// Start date for data fetching (YYYY-MM-DD)
        #[arg(long)]
        start_date: Option<String>,
        /// End date for data fetching (YYYY-MM-DD)
        #[arg(long)]
        end_date: Option<String>,
    },
    /// Query the loaded CDC COVID-19 case data
    #[command(name = "query_data")]
    QueryData {
        #[command(subcommand)]
        query: Query,
    },
}

#[derive(Subcommand, Debug)]
enum Query {
    /// Get total cases by state
    #[command(name = "total_cases")]
    TotalCases {
        /// State code to filter by, e.g. "NY"
        #[arg(long)]
        state: Option<String>,
    },
    /// Get total cases by age group
    #[command(name = "cases_by_age_group")]
    CasesByAgeGroup,
    /// Get total cases by sex
    #[command(name = "cases_by_sex")]
    CasesBySex,
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        let _ = Cli::command().print_help();
        warn!("no command provided, use 'fetch' or 'query_data'");
        return;
    };

    // configuration problems are fatal before any component is constructed
    let config = match AppConfig::from_path(Path::new(&cli.config)) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let client = CdcCaseClient::new(config.api.base_url.clone());
    let mut archive = match CdcCasesArchive::connect(&config.mysql) {
        Ok(archive) => archive,
        Err(e) => {
            error!("error connecting to mysql database: {}", e);
            process::exit(1);
        }
    };

    let result = run_command(&command, &client, &mut archive);
    archive.close();
    if let Err(e) = result {
        error!("application failed: {}", e);
        process::exit(1);
    }
}

fn run_command(
    command: &Command,
    client: &CdcCaseClient,
    archive: &mut CdcCasesArchive,
) -> Result<(), Box<dyn Error>> {
    archive.create_tables()?;
    match command {
        Command::Fetch {
            limit: _,
            max_rows,
            chunk_size,
            start_date,
            end_date,
        } => run_fetch(
            client,
            archive,
            *max_rows,
            *chunk_size,
            start_date.as_deref(),
            end_date.as_deref(),
        ),
        Command::QueryData { query } => run_query(archive, query),
    }
}

fn run_fetch(
    client: &CdcCaseClient,
    archive: &mut CdcCasesArchive,
    max_rows: Option<usize>,
    chunk_size: usize,
    start_date: Option<&str>,
    end_date: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    info!("starting data fetch process");
    let start_date = parse_cli_date(start_date)?;
    let end_date = parse_cli_date(end_date)?;

    let mut total_rows = 0;
    for (i, chunk) in client
        .fetch_chunks(chunk_size, max_rows, start_date, end_date)
        .enumerate()
    {
        info!("processing chunk {} with {} rows", i + 1, chunk.len());
        let cleaned = transform::clean(chunk);
        if cleaned.is_empty() {
            warn!("chunk {} is empty after cleaning", i + 1);
            continue;
        }
        // a chunk that fails to load is logged and skipped, the pipeline
        // moves on to the next one
        match archive.upsert(&cleaned) {
            Ok(n) => total_rows += n,
            Err(e) => error!("error loading chunk {}: {}", i + 1, e),
        }
    }
    info!(
        "data fetch completed, {} rows processed and loaded",
        total_rows
    );
    Ok(())
}

fn parse_cli_date(value: Option<&str>) -> Result<Option<Date>, Box<dyn Error>> {
    match value {
        Some(s) => {
            let date = Date::strptime("%Y-%m-%d", s)
                .map_err(|e| format!("invalid date '{}': {}", s, e))?;
            Ok(Some(date))
        }
        None => Ok(None),
    }
}

fn run_query(archive: &mut CdcCasesArchive, query: &Query) -> Result<(), Box<dyn Error>> {
    let (label, result) = match query {
        Query::TotalCases { state } => ("res_state", archive.total_cases_by_state(state.as_deref())),
        Query::CasesByAgeGroup => ("age_group", archive.cases_by_age_group()),
        Query::CasesBySex => ("sex", archive.cases_by_sex()),
    };
    // a failed query degrades to an empty result, the error only shows up
    // in the log
    let rows = match result {
        Ok(rows) => rows,
        Err(e) => {
            error!("query failed: {}", e);
            Vec::new()
        }
    };
    if rows.is_empty() {
        println!("\nNo results found for your query.");
        return Ok(());
    }
    println!("\nQuery Results:");
    println!("{}", ascii_table(label, &rows));
    Ok(())
}

/// Make an ASCII table from the query results
fn ascii_table(label: &str, rows: &[GroupCount]) -> tabled::Table {
    let mut builder = Builder::new();
    builder.push_record(vec![label.to_string(), "total_cases".to_string()]);
    for row in rows {
        builder.push_record(vec![row.group.clone(), row.total_cases.to_string()]);
    }
    let mut table = builder.build();
    table.with(Style::sharp());
    table
}
