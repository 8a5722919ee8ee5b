//! Operator CLI for the morph migration engine.
//!
//! Connects a driver and a source from URLs, then applies migrations,
//! generates plans, or replays them. Set `RUST_LOG` to control engine log
//! verbosity.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use morph::{
    drivers, sources, CancellationToken, Direction, Error, MigrationReport, Migrator, Plan,
};

#[derive(Parser)]
#[command(name = "morph", version, about = "Apply and roll back database schema migrations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    connection: ConnectionArgs,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Database connection URL, e.g. postgres://user@host/db or
    /// sqlite:///var/lib/app/state.db
    #[arg(long, global = true, env = "MORPH_DSN")]
    dsn: Option<String>,

    /// Migrations source URL, e.g. file:///etc/app/migrations
    #[arg(long, global = true, env = "MORPH_SOURCE")]
    source: Option<String>,

    /// Name of the migrations bookkeeping table
    #[arg(long, global = true)]
    migrations_table: Option<String>,

    /// Per-statement timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<i64>,

    /// Hold the named cross-process mutex while migrating
    #[arg(long, global = true)]
    lock_key: Option<String>,

    /// Log every step without touching the database
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply migrations
    Apply {
        #[command(subcommand)]
        command: ApplyCommands,
    },
    /// Generate or replay migration plans
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Show applied and pending migrations
    Status,
}

#[derive(Subcommand)]
enum ApplyCommands {
    /// Apply all pending migrations
    Migrate,
    /// Apply a number of pending migrations
    Up {
        /// How many migrations to apply
        #[arg(short, long, default_value_t = 1)]
        number: i64,
    },
    /// Roll back a number of applied migrations
    Down {
        /// How many migrations to roll back
        #[arg(short, long, default_value_t = 1)]
        number: i64,
    },
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Compute a plan for the pending migrations and write it as JSON
    Generate {
        /// Where to write the plan
        #[arg(short, long)]
        out: PathBuf,
        /// Roll back automatically if a step of the plan fails
        #[arg(long)]
        auto: bool,
    },
    /// Apply a previously generated plan file
    Apply {
        /// Path to the plan JSON
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            if err.is_database() {
                eprintln!("the migration was cancelled; the schema may need attention before retrying");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let mut engine = build_engine(&cli.connection)?;

    match cli.command {
        Commands::Apply { command } => {
            let report = match command {
                ApplyCommands::Migrate => engine.apply_all()?,
                ApplyCommands::Up { number } => engine.apply(number)?,
                ApplyCommands::Down { number } => engine.apply_down(number)?,
            };
            print_report(&report);
            let result = report.into_result();
            engine.close()?;
            result.map(|_| ())
        }
        Commands::Plan { command } => {
            let result = run_plan(&mut engine, command);
            engine.close()?;
            result
        }
        Commands::Status => {
            let applied = engine.applied()?;
            let pending = engine.diff(Direction::Up)?;
            println!("applied migrations: {}", applied.len());
            for migration in &applied {
                println!("  {:>10}  {}", migration.version, migration.name);
            }
            println!("pending migrations: {}", pending.len());
            for migration in &pending {
                println!("  {:>10}  {}", migration.version, migration.name);
            }
            engine.close()
        }
    }
}

fn run_plan(engine: &mut Migrator, command: PlanCommands) -> Result<(), Error> {
    match command {
        PlanCommands::Generate { out, auto } => {
            let pending = engine.diff(Direction::Up)?;
            if pending.is_empty() {
                println!("nothing to plan, the database is up to date");
                return Ok(());
            }
            let plan = engine.generate_plan(pending, auto)?;
            std::fs::write(&out, plan.to_json()?)
                .map_err(|err| io_error(&out, "failed to write plan file", err))?;
            println!(
                "wrote a plan with {} migrations to {}",
                plan.migrations.len(),
                out.display()
            );
            Ok(())
        }
        PlanCommands::Apply { file } => {
            let bytes = std::fs::read(&file)
                .map_err(|err| io_error(&file, "failed to read plan file", err))?;
            let plan = Plan::from_json(&bytes)?;
            engine.apply_plan(&plan)?;
            println!("applied {} migrations from the plan", plan.migrations.len());
            Ok(())
        }
    }
}

fn build_engine(connection: &ConnectionArgs) -> Result<Migrator, Error> {
    let dsn = connection
        .dsn
        .as_deref()
        .ok_or_else(|| missing_flag("--dsn"))?;
    let source_url = connection
        .source
        .as_deref()
        .ok_or_else(|| missing_flag("--source"))?;

    let driver = drivers::connect(dsn)?;
    let source = sources::open(source_url)?;

    let mut builder = Migrator::builder_boxed(driver, source).dry_run(connection.dry_run);
    if let Some(table) = &connection.migrations_table {
        builder = builder.migrations_table(table.clone());
    }
    if let Some(timeout) = connection.timeout {
        builder = builder.statement_timeout_secs(timeout);
    }
    if let Some(key) = &connection.lock_key {
        builder = builder.lock_key(key.clone());
    }

    let token = CancellationToken::new();
    builder.build(&token)
}

fn print_report(report: &MigrationReport) {
    for name in &report.applied {
        println!("applied {name}");
    }
    println!("{} migrations applied", report.count());
}

fn missing_flag(flag: &str) -> Error {
    Error::App {
        driver: "cli",
        message: format!("{flag} is required (or set the matching MORPH_* variable)"),
        source: None,
    }
}

fn io_error(path: &std::path::Path, message: &str, err: std::io::Error) -> Error {
    Error::App {
        driver: "cli",
        message: format!("{message} {}", path.display()),
        source: Some(Box::new(err)),
    }
}
