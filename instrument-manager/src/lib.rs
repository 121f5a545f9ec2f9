// LORIS instrument manager
// Library entry point

pub mod database;
pub mod installation;
pub mod instrument;
pub mod listing;
pub mod models;
pub mod utils;

use anyhow::Context;
use log::{error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Duration;

use database::connection::{DatabaseConnection, RealDbConnector};
use database::consistency::ConsistencyChecker;
use database::schema_inspector::{MySqlSchemaInspector, SchemaInspector};
use installation::capability::InstallCapability;
use installation::files::InstrumentFiles;
use installation::orchestrator::{InstallError, InstallOrchestrator, InstallRequest};
use installation::tools::{ExternalSqlGenerator, MysqlSqlApplier, SqlApplier};
use listing::{build_instrument_rows, name_filter, TabularListing};
use models::responses::{ApiResponse, CheckResult, InstrumentListing};
use models::settings::{LoggingSettings, ManagerConfig};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;

pub const USAGE: &str = "Usage: instrument-manager [--config <path>] [--json] [--verbose] <command>

Commands:
  --list [--filter <text>]   List registered instruments with their validation verdicts
  --check <instrument>       Validate one instrument's table and pages against its definition
  --parse <file.linst>       Parse a definition file and print its declarations
  --install <file.linst>     Upload and install an instrument definition
  --capability               Report whether uploads and automatic installs are possible";

fn human_readable_line(out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record) {
    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let tagged = utils::logging::parse_log_metadata(&message.to_string());
    let txt_line = utils::logging::format_human_readable_log(
        &timestamp_local.to_string(),
        record.level(),
        record.target(),
        &tagged,
    );
    out.finish(format_args!("{}", txt_line));
}

fn json_line(out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record) {
    let timestamp_utc = chrono::Utc::now().to_rfc3339();
    let tagged = utils::logging::parse_log_metadata(&message.to_string());
    let line =
        utils::logging::format_json_log(&timestamp_utc, record.level(), record.target(), &tagged);
    out.finish(format_args!("{}", line));
}

/// Initialize logging with dual format (JSON `.log` + human-readable `.txt`).
///
/// With `with_stderr` the human-readable lines are mirrored to stderr, leaving stdout for command output.
pub fn init_logging(
    settings: &LoggingSettings,
    with_stderr: bool,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let log_dir = utils::path_resolver::resolve_log_folder(settings.dir.as_deref())?;
    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let json_log_file = log_dir.join(format!("instrument-manager-{}.log", timestamp));
    let txt_log_file = log_dir.join(format!("instrument-manager-{}.txt", timestamp));

    let level = settings
        .level
        .as_deref()
        .and_then(|l| log::LevelFilter::from_str(l.trim()).ok())
        .unwrap_or(log::LevelFilter::Info);

    let mut dispatch = fern::Dispatch::new()
        .level(level)
        // sqlx logs every statement at info
        .level_for("sqlx", log::LevelFilter::Warn);

    if with_stderr {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(human_readable_line)
                .chain(std::io::stderr()),
        );
    }

    dispatch
        .chain(
            fern::Dispatch::new()
                .format(json_line)
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(human_readable_line)
                .chain(fern::log_file(txt_log_file)?),
        )
        .apply()?;

    info!(
        "[PHASE: initialization] Logging initialized (level={}, dir={:?})",
        level, log_dir
    );
    Ok(log_dir)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    List { filter: Option<String> },
    Check { instrument: String },
    Parse { file: PathBuf },
    Install { file: PathBuf },
    Capability,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOptions {
    pub config: Option<PathBuf>,
    pub json: bool,
    pub verbose: bool,
    pub command: CliCommand,
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Result<Option<&'a str>, String> {
    match args.iter().position(|a| a == flag) {
        None => Ok(None),
        Some(i) => match args.get(i + 1) {
            Some(v) if !v.starts_with("--") => Ok(Some(v.as_str())),
            _ => Err(format!("{} requires a value", flag)),
        },
    }
}

impl CliOptions {
    /// Parse command-line arguments (without the program name).
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let has = |flag: &str| args.iter().any(|a| a == flag);

        let mut commands = Vec::new();
        if has("--list") {
            commands.push(CliCommand::List {
                filter: flag_value(args, "--filter")?.map(str::to_string),
            });
        }
        if let Some(name) = flag_value(args, "--check")? {
            commands.push(CliCommand::Check {
                instrument: name.to_string(),
            });
        }
        if let Some(file) = flag_value(args, "--parse")? {
            commands.push(CliCommand::Parse {
                file: PathBuf::from(file),
            });
        }
        if let Some(file) = flag_value(args, "--install")? {
            commands.push(CliCommand::Install {
                file: PathBuf::from(file),
            });
        }
        if has("--capability") {
            commands.push(CliCommand::Capability);
        }

        if commands.len() != 1 {
            return Err("Exactly one command is required".to_string());
        }
        if has("--filter") && !has("--list") {
            return Err("--filter is only valid with --list".to_string());
        }

        Ok(Self {
            config: flag_value(args, "--config")?.map(PathBuf::from),
            json: has("--json"),
            verbose: has("--verbose"),
            command: commands.remove(0),
        })
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

/// Database-backed components for one CLI invocation.
struct Services {
    config: ManagerConfig,
    inspector: Arc<dyn SchemaInspector>,
    files: InstrumentFiles,
}

impl Services {
    async fn connect(config: ManagerConfig) -> anyhow::Result<Self> {
        let connection = DatabaseConnection::mysql(&config.database).await?;
        let inspector: Arc<dyn SchemaInspector> = Arc::new(MySqlSchemaInspector::new(connection));
        let files = InstrumentFiles::new(config.instruments_dir(), config.tools.upload_file_mode);
        Ok(Self {
            config,
            inspector,
            files,
        })
    }

    fn checker(&self) -> ConsistencyChecker {
        ConsistencyChecker::new(self.inspector.clone(), self.config.instruments_dir())
    }

    async fn capability(&self) -> InstallCapability {
        let connector = RealDbConnector {
            timeout: Duration::from_secs(self.config.database.connect_timeout_secs),
        };
        InstallCapability::probe(&self.config, &connector).await
    }

    fn orchestrator(&self, capability: InstallCapability) -> InstallOrchestrator {
        let generator = Arc::new(ExternalSqlGenerator::new(
            &self.config.tools,
            self.config.tools_dir(),
        ));
        let applier = MysqlSqlApplier::from_settings(&self.config.tools, &self.config.database)
            .map(|a| Arc::new(a) as Arc<dyn SqlApplier>);
        InstallOrchestrator::new(
            self.inspector.clone(),
            self.files.clone(),
            self.config.tables_sql_dir(),
            generator,
            applier,
            capability,
        )
    }
}

async fn run_parse(file: &Path, json: bool) -> anyhow::Result<i32> {
    let definition = instrument::definition::parse_file(file).await?;
    if json {
        print_json(&ApiResponse::ok(&definition))?;
        return Ok(EXIT_OK);
    }

    if let Some(table) = &definition.table_name {
        println!("table: {}", table);
    }
    for declaration in &definition.declarations {
        match declaration {
            instrument::definition::Declaration::Page { name, title } => {
                println!("page {} \"{}\"", name, title)
            }
            instrument::definition::Declaration::Title { text } => println!("title \"{}\"", text),
            instrument::definition::Declaration::Field(field) => match &field.enum_options {
                Some(_) => println!(
                    "{} {} {}",
                    field.field_type.keyword(),
                    field.name,
                    field.expected_enum_signature()
                ),
                None => println!("{} {}", field.field_type.keyword(), field.name),
            },
        }
    }
    for name in definition.duplicate_field_names() {
        println!("warning: field '{}' is declared more than once", name);
    }
    Ok(EXIT_OK)
}

async fn run_list(services: &Services, filter: Option<&str>, json: bool) -> anyhow::Result<i32> {
    let capability = services.capability().await;
    let rows = build_instrument_rows(&services.inspector, &services.checker(), &services.files).await?;

    let mut listing = TabularListing::new(rows);
    if let Some(needle) = filter {
        listing = listing.with_filter(name_filter(needle));
    }

    if json {
        let instruments = listing.visible_rows().into_iter().cloned().collect();
        print_json(&ApiResponse::ok(InstrumentListing {
            capability,
            instruments,
        }))?;
    } else {
        if let Some(feedback) = &capability.feedback {
            println!("{}\n", feedback);
        }
        println!("{}", listing.render_text());
    }
    Ok(EXIT_OK)
}

async fn run_check(services: &Services, instrument: &str, json: bool) -> anyhow::Result<i32> {
    let checker = services.checker();
    let result = CheckResult {
        instrument: instrument.to_string(),
        table_valid: checker.check_schema(instrument).await?,
        pages_valid: checker.check_pages(instrument).await?,
    };

    if json {
        print_json(&ApiResponse::ok(&result))?;
    } else {
        println!("Table_Valid: {}", result.table_valid);
        println!("Pages_Valid: {}", result.pages_valid);
    }
    Ok(if result.all_valid() { EXIT_OK } else { EXIT_FAILURE })
}

async fn run_install(services: &Services, file: &Path, json: bool) -> anyhow::Result<i32> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {:?}", file))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let orchestrator = services.orchestrator(services.capability().await);
    let result = orchestrator
        .install(InstallRequest::new(file_name, bytes))
        .await;

    if let Err(e) = &result {
        // Apply failures are logged by the orchestrator with full output.
        if !matches!(e, InstallError::ApplyFailed { .. }) {
            warn!(
                "[PHASE: install] [STEP: result] Install refused (status={}): {}{}",
                e.status_code(),
                e,
                e.operator_details()
                    .map(|d| format!("; {}", d))
                    .unwrap_or_default()
            );
        }
    }

    let exit_code = if result.is_ok() { EXIT_OK } else { EXIT_FAILURE };
    if json {
        print_json(&ApiResponse::from(result))?;
    } else {
        match result {
            Ok(report) => println!(
                "{}",
                report
                    .message
                    .unwrap_or_else(|| format!("Instrument '{}' installed.", report.instrument))
            ),
            Err(e) => eprintln!("{}", e),
        }
    }
    Ok(exit_code)
}

async fn run_capability(services: &Services, json: bool) -> anyhow::Result<i32> {
    let capability = services.capability().await;
    if json {
        print_json(&ApiResponse::ok(&capability))?;
    } else {
        println!("writable: {}", capability.writable);
        println!("can_install: {}", capability.can_install);
        if let Some(feedback) = &capability.feedback {
            println!("{}", feedback);
        }
    }
    Ok(EXIT_OK)
}

async fn execute(options: &CliOptions, config: anyhow::Result<ManagerConfig>) -> anyhow::Result<i32> {
    if let CliCommand::Parse { file } = &options.command {
        return run_parse(file, options.json).await;
    }

    let services = Services::connect(config?).await?;
    match &options.command {
        CliCommand::List { filter } => run_list(&services, filter.as_deref(), options.json).await,
        CliCommand::Check { instrument } => run_check(&services, instrument, options.json).await,
        CliCommand::Install { file } => run_install(&services, file, options.json).await,
        CliCommand::Capability => run_capability(&services, options.json).await,
        CliCommand::Parse { .. } => Ok(EXIT_OK),
    }
}

/// Run one CLI command and return the process exit code.
pub fn run(options: CliOptions) -> i32 {
    let config = ManagerConfig::load(options.config.as_deref());
    let logging = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    if let Err(e) = init_logging(&logging, options.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    info!(
        "[PHASE: initialization] Instrument manager starting at {} (command={:?})",
        chrono::Utc::now(),
        options.command
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();
    let result = match rt {
        Ok(rt) => rt.block_on(execute(&options, config)),
        Err(e) => Err(anyhow::anyhow!("Failed to create async runtime: {}", e)),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("[PHASE: cli] [STEP: fatal] Command failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            EXIT_FAILURE
        }
    }
}
