use clap::{Parser, Subcommand};
use nix::unistd::getpid;
use simmgr_runner::{
    batch::{local, BatchSystem, BatchSystems},
    cache::InputCaches,
    config::SimConfig,
    store::{HttpRecordStore, MemoryStore, RecordStore},
    submit::GroupSubmission,
};
use std::{
    env,
    error::Error,
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// exit code of `submit-job` if the batch system did not accept the job
const JOB_REJECTED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "simmgr", version, about = "Submits simulation groups to a batch system")]
struct Cli {
    /// Config file
    #[arg(short, long, global = true, default_value = "simmgr.yaml")]
    config: PathBuf,

    /// Log debug output, RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the submission script for a simulation group
    SubmitGroup {
        /// Group working directory holding execution_request.json and api_urls.json
        #[arg(default_value = ".")]
        group_dir: PathBuf,

        /// Keep all records in memory instead of talking to the record store
        #[arg(long)]
        dry_run: bool,
    },
    /// Start the submission script for a group in the background and print its pid
    Launch {
        #[arg(default_value = ".")]
        group_dir: PathBuf,
    },
    /// Submit a single job to the configured batch system and print its handle
    SubmitJob {
        executable: PathBuf,
        working_dir: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Validate the config file
    CheckConfig,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// log an error with all of its sources
fn report(context: &str, e: &dyn Error) {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(&format!(": {cause}"));
        source = cause.source();
    }

    error!("{context}: {message}");
}

fn submit_group(
    config: &SimConfig,
    batch: &BatchSystems,
    group_dir: &Path,
    dry_run: bool,
) -> ExitCode {
    info!(
        pid = %getpid(),
        cwd = ?env::current_dir().ok(),
        args = ?env::args().collect::<Vec<_>>(),
        "Submission script started"
    );

    let timeout = Duration::from_secs(config.store.timeout);
    let cache = match InputCaches::load(&config.cache, timeout) {
        Ok(cache) => cache,
        Err(e) => {
            report("Failed to load input cache", &e);
            return ExitCode::FAILURE;
        }
    };

    let store: Box<dyn RecordStore> = if dry_run {
        let working_dirs = group_dir.join("simulations");
        warn!(?working_dirs, "Dry run, records are kept in memory");
        Box::new(MemoryStore::new(working_dirs))
    } else {
        Box::new(HttpRecordStore::new(&config.store))
    };

    let submission = GroupSubmission::new(&*store, batch, &cache, &config.runner)
        .on_cache_error(config.cache.on_error);

    match submission.run(group_dir) {
        Ok(result) => {
            for simulation in &result.simulations {
                match &simulation.job {
                    Some(job) => println!("{}\t{job}", simulation.url),
                    None => println!("{}\t-", simulation.url),
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            report("Submission script failed", &e);

            ExitCode::FAILURE
        }
    }
}

fn launch(config_path: &Path, group_dir: &Path) -> ExitCode {
    // the script outlives this process, so it must not depend on our working directory
    let resolve = || -> io::Result<(PathBuf, PathBuf, PathBuf)> {
        Ok((
            group_dir.canonicalize()?,
            config_path.canonicalize()?,
            env::current_exe()?,
        ))
    };
    let (group_dir, config, exe) = match resolve() {
        Ok(paths) => paths,
        Err(e) => {
            report("Failed to resolve paths", &e);
            return ExitCode::FAILURE;
        }
    };

    let args = [
        OsStr::new("--config"),
        config.as_os_str(),
        OsStr::new("submit-group"),
        group_dir.as_os_str(),
    ];

    match local::start(&exe, &group_dir, &args) {
        Ok(pid) => {
            info!(pid, ?group_dir, "Started submission script");
            println!("{pid}");

            ExitCode::SUCCESS
        }
        Err(e) => {
            report("Failed to start submission script", &e);

            ExitCode::FAILURE
        }
    }
}

fn submit_job(
    batch: &BatchSystems,
    executable: &Path,
    working_dir: &Path,
    args: &[String],
) -> ExitCode {
    match batch.submit_job(executable, working_dir, args) {
        Ok(Some(job)) => {
            println!("{job}");

            ExitCode::SUCCESS
        }
        Ok(None) => {
            error!(batch = batch.name(), "Batch system did not accept the job");

            ExitCode::from(JOB_REJECTED)
        }
        Err(e) => {
            report("Invalid job", &e);

            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match SimConfig::read(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            report(&format!("Failed to load config {:?}", cli.config), &e);
            return ExitCode::FAILURE;
        }
    };

    if let Command::CheckConfig = cli.command {
        return if config.preflight_checks() {
            ExitCode::FAILURE
        } else {
            info!("Config is valid");
            ExitCode::SUCCESS
        };
    }

    let batch = match BatchSystems::load(&config.batch) {
        Ok(batch) => batch,
        Err(e) => {
            report("Failed to load batch system", &e);
            return ExitCode::FAILURE;
        }
    };
    info!(batch = batch.name(), "Loaded batch system");

    match cli.command {
        Command::SubmitGroup { group_dir, dry_run } => {
            submit_group(&config, &batch, &group_dir, dry_run)
        }
        Command::Launch { group_dir } => launch(&cli.config, &group_dir),
        Command::SubmitJob {
            executable,
            working_dir,
            args,
        } => submit_job(&batch, &executable, &working_dir, &args),
        Command::CheckConfig => ExitCode::SUCCESS,
    }
}
