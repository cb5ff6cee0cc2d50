use std::process::ExitCode;

use chrono::NaiveDate;
use clap::{ArgAction, Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_transfer_manager::app::{App, CheckResult, CloseResult, PoolView, StatusReport, TransferResult};
use kira_transfer_manager::config::{ConfigLoader, ResolvedConfig};
use kira_transfer_manager::domain::{
    EmbryoId, EmbryoSource, FarmId, PackageId, RecipientId, Status,
};
use kira_transfer_manager::error::{ErrorKind, TransferError};
use kira_transfer_manager::output::{JsonOutput, OutputMode};
use kira_transfer_manager::reconcile::WriteResult;
use kira_transfer_manager::report::SessionSummary;
use kira_transfer_manager::session::TransferRequest;
use kira_transfer_manager::store::{MemoryStore, Workspace};

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

#[derive(Parser)]
#[command(name = "kira-tm")]
#[command(about = "Embryo-transfer recipient status and session manager")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Resolve the reproductive status of recipients")]
    Status(StatusArgs),
    #[command(about = "Check whether an action is allowed from a status")]
    Check(CheckArgs),
    #[command(about = "Run a transfer session")]
    Session(SessionArgs),
}

#[derive(Args)]
struct StatusArgs {
    #[arg(required = true)]
    recipients: Vec<String>,
}

#[derive(Args)]
struct CheckArgs {
    status: String,
    action: String,
}

#[derive(Args)]
struct SessionArgs {
    #[command(subcommand)]
    command: SessionCommand,
}

#[derive(Subcommand)]
enum SessionCommand {
    #[command(about = "Open a session on a farm")]
    Open(OpenArgs),
    #[command(about = "Show recipients and embryos available now")]
    Pool,
    #[command(about = "Select the recipient for the next transfer")]
    Select { recipient: String },
    #[command(about = "Allow or forbid a second embryo per recipient")]
    SecondEmbryo {
        #[arg(action = ArgAction::Set)]
        allow: bool,
    },
    #[command(about = "Record an embryo transfer")]
    Transfer(TransferArgs),
    #[command(about = "Discard a recipient for the rest of the session")]
    Discard { recipient: String },
    #[command(about = "Show the session report so far")]
    Summary,
    #[command(about = "Close the session")]
    Close,
}

#[derive(Args)]
struct OpenArgs {
    farm: String,

    #[arg(long, conflicts_with = "frozen", required_unless_present = "frozen")]
    package: Option<String>,

    #[arg(long)]
    frozen: bool,

    #[arg(long)]
    allow_second_embryo: bool,
}

#[derive(Args)]
struct TransferArgs {
    recipient: String,
    embryo: String,

    #[arg(long)]
    veterinarian: Option<String>,

    #[arg(long)]
    technician: Option<String>,

    #[arg(long)]
    notes: Option<String>,

    #[arg(long)]
    date: Option<NaiveDate>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<TransferError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &TransferError) -> u8 {
    match error.kind() {
        ErrorKind::Validation => 2,
        ErrorKind::Transient => 3,
        ErrorKind::Conflict | ErrorKind::Local => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let workspace = Workspace::new()?;
    let config = ConfigLoader::resolve(cli.config.as_deref(), &workspace)?;
    let store = MemoryStore::open(&config.data_path)?;
    let app = App::new(store, workspace);

    match cli.command {
        Commands::Status(args) => run_status(args, &app, output_mode),
        Commands::Check(args) => run_check(args, &app, output_mode),
        Commands::Session(args) => run_session(args.command, &app, &config, output_mode),
    }
}

fn run_status(args: StatusArgs, app: &App<MemoryStore>, mode: OutputMode) -> miette::Result<()> {
    let ids = args
        .recipients
        .iter()
        .map(|value| value.parse::<RecipientId>())
        .collect::<Result<Vec<_>, _>>()?;
    let report = app.status(&ids);
    match mode {
        OutputMode::NonInteractive => JsonOutput::print_status(&report).into_diagnostic(),
        OutputMode::Interactive => {
            print_status_report(&report);
            Ok(())
        }
    }
}

fn run_check(args: CheckArgs, app: &App<MemoryStore>, mode: OutputMode) -> miette::Result<()> {
    let status = args.status.parse::<Status>()?;
    let result = app.check(status, &args.action);
    match mode {
        OutputMode::NonInteractive => JsonOutput::print_check(&result).into_diagnostic(),
        OutputMode::Interactive => {
            print_check(&result);
            Ok(())
        }
    }
}

fn run_session(
    command: SessionCommand,
    app: &App<MemoryStore>,
    config: &ResolvedConfig,
    mode: OutputMode,
) -> miette::Result<()> {
    match command {
        SessionCommand::Open(args) => {
            let farm = args.farm.parse::<FarmId>()?;
            let source = match args.package {
                Some(package) => EmbryoSource::FreshPackage {
                    package: package.parse::<PackageId>()?,
                },
                None => EmbryoSource::Frozen,
            };
            let allow_second = args.allow_second_embryo || config.allow_second_embryo;
            let view = app.open_session(farm, source, allow_second)?;
            print_pool_view(&view, mode)
        }
        SessionCommand::Pool => print_pool_view(&app.pool()?, mode),
        SessionCommand::Select { recipient } => {
            let view = app.select(&recipient.parse::<RecipientId>()?)?;
            print_pool_view(&view, mode)
        }
        SessionCommand::SecondEmbryo { allow } => {
            print_pool_view(&app.set_second_embryo(allow)?, mode)
        }
        SessionCommand::Transfer(args) => {
            let request = TransferRequest {
                embryo_id: args.embryo.parse::<EmbryoId>()?,
                recipient_id: args.recipient.parse::<RecipientId>()?,
                transferred_on: args
                    .date
                    .unwrap_or_else(|| chrono::Local::now().date_naive()),
                veterinarian: args
                    .veterinarian
                    .or_else(|| config.veterinarian.clone())
                    .unwrap_or_default(),
                technician: args.technician.or_else(|| config.technician.clone()),
                notes: args.notes,
            };
            // saved whether or not the write went through
            let result = app.transfer(request);
            app.store().save(&config.data_path)?;
            let result = result?;
            match mode {
                OutputMode::NonInteractive => JsonOutput::print_transfer(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    print_transfer(&result);
                    Ok(())
                }
            }
        }
        SessionCommand::Discard { recipient } => {
            let result = app.discard(&recipient.parse::<RecipientId>()?)?;
            app.store().save(&config.data_path)?;
            match mode {
                OutputMode::NonInteractive => JsonOutput::print_discard(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    println!("{YELLOW}recipient {} discarded{RESET}", result.recipient_id);
                    if !result.status_reset {
                        println!(
                            "{YELLOW}   status not reset yet; discard again to retry{RESET}"
                        );
                    }
                    Ok(())
                }
            }
        }
        SessionCommand::Summary => {
            let summary = app.summary()?;
            match mode {
                OutputMode::NonInteractive => JsonOutput::print_summary(&summary).into_diagnostic(),
                OutputMode::Interactive => {
                    print_summary(&summary);
                    Ok(())
                }
            }
        }
        SessionCommand::Close => {
            let result = app.close()?;
            app.store().save(&config.data_path)?;
            match mode {
                OutputMode::NonInteractive => JsonOutput::print_close(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    print_close(&result);
                    Ok(())
                }
            }
        }
    }
}

fn print_status_report(report: &StatusReport) {
    for entry in &report.recipients {
        let color = if entry.status.is_pregnant() {
            GREEN
        } else {
            CYAN
        };
        println!("{color}{:<16} {}{RESET}", entry.recipient_id, entry.status);
        for warning in &entry.warnings {
            println!("{YELLOW}   warning: {warning}{RESET}");
        }
    }
}

fn print_check(result: &CheckResult) {
    match &result.verdict.reason {
        None => println!("{GREEN}{} allowed from {}{RESET}", result.action, result.status),
        Some(reason) => println!("{YELLOW}denied: {reason}{RESET}"),
    }
}

fn print_pool_view(view: &PoolView, mode: OutputMode) -> miette::Result<()> {
    if matches!(mode, OutputMode::NonInteractive) {
        return JsonOutput::print_pool(view).into_diagnostic();
    }

    println!("{CYAN}session {} on farm {}{RESET}", view.session_id, view.farm_id);
    if view.allow_second_embryo {
        println!("{CYAN}second embryo allowed{RESET}");
    }
    println!("recipients ({}):", view.recipients.len());
    for recipient in &view.recipients {
        let selected = view.selection.as_ref() == Some(&recipient.entry.recipient_id);
        let marker = if selected { ">" } else { " " };
        let flag = if recipient.second_embryo {
            format!(" {YELLOW}[2nd embryo]{RESET}")
        } else {
            String::new()
        };
        println!(
            "{marker} {:<12} {:<16} {}{flag}",
            recipient.entry.tag,
            recipient.entry.recipient_id,
            recipient.entry.transfer_status()
        );
    }
    println!("embryos ({}):", view.embryos.len());
    for embryo in &view.embryos {
        let class = embryo.classification.as_deref().unwrap_or("-");
        println!("  {:<12} {:<16} {class}", embryo.label, embryo.id);
    }
    Ok(())
}

fn print_transfer(result: &TransferResult) {
    match &result.result {
        WriteResult::Committed { transfer, embryos } => println!(
            "{GREEN}transfer {transfer} recorded: embryo {} -> {} (embryo {embryos} this session){RESET}",
            result.embryo_id, result.recipient_id
        ),
        WriteResult::AlreadyCommitted { transfer } => {
            println!("{CYAN}transfer {transfer} was already recorded{RESET}")
        }
        WriteResult::Duplicate { embryo } => println!(
            "{YELLOW}embryo {embryo} was already transferred elsewhere; embryo list refreshed{RESET}"
        ),
    }
}

fn print_summary(summary: &SessionSummary) {
    println!(
        "{CYAN}session {} ({:?}) on farm {}{RESET}",
        summary.session_id, summary.phase, summary.farm_id
    );
    println!(
        "{GREEN}transfers: {}  recipients served: {}  discarded: {}{RESET}",
        summary.committed,
        summary.recipients_served,
        summary.discarded.len()
    );
    for item in &summary.items {
        println!(
            "  {:<12} embryo {:<12} #{} {} {}",
            item.recipient_tag, item.embryo_label, item.embryo_number, item.kind, item.veterinarian
        );
    }
}

fn print_close(result: &CloseResult) {
    print_summary(&result.closed.summary);
    if let Some(path) = &result.report_path {
        println!("{CYAN}report: {path}{RESET}");
    }
    if let Some(pool) = &result.closed.pool {
        println!("{CYAN}recipients still available on farm: {}{RESET}", pool.len());
    }
}
