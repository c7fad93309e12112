use super::{check_job_inputs, BatchError, BatchSystem, JobId};
use crate::{
    config::{BatchConfig, ConfigErrors},
    working_dirs::STDOUT_FILENAME,
};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::mpsc::{self, Receiver},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

static SBATCH_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Submitted batch job (\d+)").expect("sbatch regex is valid"));

const DEFAULT_JOB_NAME: &str = "simulation";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Scheduler flavour, decides the script directives, submit command and output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// PBS/ Torque, `qsub` prints the job id
    Pbs,
    /// `sbatch` prints `Submitted batch job <id>`
    Slurm,
}

impl Dialect {
    pub fn script_name(&self) -> &'static str {
        match self {
            Self::Pbs => "pbs.sh",
            Self::Slurm => "slurm.sh",
        }
    }

    fn default_submit_exec(&self) -> &'static str {
        match self {
            Self::Pbs => "qsub",
            Self::Slurm => "sbatch",
        }
    }

    // job name, working dir, one node with one processor, pass the environment through
    fn directives(&self, job_name: &str, working_dir: &str) -> Vec<String> {
        match self {
            Self::Pbs => vec![
                format!("#PBS -N {job_name}"),
                format!("#PBS -d {working_dir}"),
                "#PBS -l nodes=1:ppn=1".to_owned(),
                "#PBS -V".to_owned(),
            ],
            Self::Slurm => vec![
                format!("#SBATCH --job-name={job_name}"),
                format!("#SBATCH --chdir={working_dir}"),
                "#SBATCH --nodes=1".to_owned(),
                "#SBATCH --ntasks=1".to_owned(),
                "#SBATCH --export=ALL".to_owned(),
                format!("#SBATCH --output={STDOUT_FILENAME}"),
            ],
        }
    }

    pub fn parse_job_id(&self, stdout: &str) -> Option<JobId> {
        match self {
            Self::Pbs => stdout
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(JobId::new),
            Self::Slurm => SBATCH_REGEX
                .captures(stdout)
                .and_then(|captures| captures.get(1))
                .map(|id| JobId::new(id.as_str())),
        }
    }
}

/// whether a value can be put into a scheduler directive as is, directives are not shell quoted
fn directive_safe(value: &str) -> bool {
    !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '\'' | '"' | '\\'))
}

/// quote a value for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Batch system handing jobs to a cluster scheduler through a generated submission script
#[derive(Debug, Clone)]
pub struct ClusterScheduler {
    dialect: Dialect,
    submit_exec: PathBuf,
    job_name: String,
    timeout: Duration,
}

impl ClusterScheduler {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            submit_exec: PathBuf::from(dialect.default_submit_exec()),
            job_name: DEFAULT_JOB_NAME.to_owned(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn load(dialect: Dialect, config: &BatchConfig) -> Result<Self, ConfigErrors> {
        let mut scheduler = Self::new(dialect);

        if let Some(submit_exec) = config.parameter_str("submit_exec")? {
            scheduler.submit_exec = PathBuf::from(submit_exec);
        }
        if let Some(job_name) = config.parameter_str("job_name")? {
            if !directive_safe(job_name) {
                return Err(ConfigErrors::InvalidParameter {
                    name: "batch.parameter.job_name".to_owned(),
                    reason: "must not be empty or contain whitespace or quotes".to_owned(),
                });
            }
            scheduler.job_name = job_name.to_owned();
        }
        if let Some(timeout) = config.parameter_u64("timeout")? {
            scheduler.timeout = Duration::from_millis(timeout);
        }

        Ok(scheduler)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// content of the submission script, identical inputs give identical scripts
    pub fn script(&self, executable: &Path, working_dir: &Path, args: &[String]) -> String {
        let working_dir = working_dir.to_string_lossy();
        let command = std::iter::once(executable.to_string_lossy().into_owned())
            .chain(args.iter().cloned())
            .map(|part| shell_quote(&part))
            .join(" ");

        let mut lines = vec!["#!/bin/bash".to_owned()];
        lines.extend(self.dialect.directives(&self.job_name, &working_dir));
        lines.push(format!("cd {}", shell_quote(&working_dir)));
        lines.push(command);

        lines.into_iter().map(|line| line + "\n").collect()
    }

    pub fn write_script(
        &self,
        executable: &Path,
        working_dir: &Path,
        args: &[String],
    ) -> Result<PathBuf, BatchError> {
        let path = working_dir.join(self.dialect.script_name());
        fs::write(&path, self.script(executable, working_dir, args))?;
        debug!(path = ?path, "Wrote submission script");

        Ok(path)
    }

    /// run the submit command, any failure results in no job id
    fn run_submit(&self, script: &Path, working_dir: &Path) -> Option<JobId> {
        let deadline = Instant::now() + self.timeout;
        let mut child = match Command::new(&self.submit_exec)
            .arg(script)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(error = ?e, submit_exec = ?self.submit_exec, "Failed to run submit command: {e}");

                return None;
            }
        };

        // drain both pipes while waiting, a chatty submit command would block on a full pipe
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(
                    submit_exec = ?self.submit_exec,
                    "Submit command ran into timeout after {} ms",
                    self.timeout.as_millis()
                );
                if let Err(e) = child.kill().and_then(|_| child.wait()) {
                    error!(error = ?e, "Failed to stop submit command: {e}");
                }

                return None;
            }
            Err(e) => {
                error!(error = ?e, "Failed to wait for submit command: {e}");

                return None;
            }
        };

        // a background process forked by the submit command may keep the pipes open
        let stderr = stderr
            .and_then(|output| collect(output, deadline))
            .unwrap_or_default();
        let stdout = match stdout.and_then(|output| collect(output, deadline)) {
            Some(stdout) => stdout,
            None => {
                warn!(
                    submit_exec = ?self.submit_exec,
                    "Submit command output was not closed within {} ms",
                    self.timeout.as_millis()
                );

                return None;
            }
        };

        if !status.success() {
            error!(
                status = ?status.code(),
                stderr = stderr.trim(),
                "Submit command failed"
            );

            return None;
        }

        let job = self.dialect.parse_job_id(&stdout);
        if job.is_none() {
            error!(stdout = stdout.trim(), "Failed to parse job id from submit command output");
        }

        job
    }
}

/// read a pipe to its end on a separate thread
fn drain<R: Read + Send + 'static>(mut pipe: R) -> Receiver<String> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut output = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut output) {
            warn!(error = ?e, "Failed to read submit command output: {e}");
        }
        // the receiver is gone if the deadline passed
        let _ = sender.send(String::from_utf8_lossy(&output).into_owned());
    });

    receiver
}

fn collect(output: Receiver<String>, deadline: Instant) -> Option<String> {
    output
        .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        .ok()
}

impl BatchSystem for ClusterScheduler {
    #[instrument(skip(self, args), level = "debug")]
    fn submit_job(
        &self,
        executable: &Path,
        working_dir: &Path,
        args: &[String],
    ) -> Result<Option<JobId>, BatchError> {
        if !working_dir.is_dir() {
            return Err(BatchError::MissingWorkingDir(working_dir.to_path_buf()));
        }
        if !directive_safe(&working_dir.to_string_lossy()) {
            return Err(BatchError::UnsupportedWorkingDir(working_dir.to_path_buf()));
        }
        // the executable only has to exist on the compute node, check it if it is visible here
        if executable.is_absolute() && executable.exists() {
            check_job_inputs(executable, working_dir)?;
        }

        let script = self.write_script(executable, working_dir, args)?;
        let job = self.run_submit(&script, working_dir);

        if let Some(job) = &job {
            info!(job = %job, "Submitted job to {:?} scheduler", self.dialect);
        }

        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `/bin/sh` as submit command executes the generated script itself, so the "job" prints what
    // a scheduler would print
    fn scheduler(dialect: Dialect) -> ClusterScheduler {
        ClusterScheduler::load(
            dialect,
            &BatchConfig::new("cluster")
                .with_parameter("submit_exec", "/bin/sh")
                .with_parameter("job_name", "OpenMalaria")
                .with_parameter("timeout", 2000),
        )
        .unwrap()
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn pbs_script_layout() {
        let script = scheduler(Dialect::Pbs).script(
            Path::new("/usr/bin/python3"),
            Path::new("/data/simulations/7"),
            &args(&["/opt/simmgr/run_simulation.py"]),
        );

        assert_eq!(
            script,
            "#!/bin/bash\n\
             #PBS -N OpenMalaria\n\
             #PBS -d /data/simulations/7\n\
             #PBS -l nodes=1:ppn=1\n\
             #PBS -V\n\
             cd '/data/simulations/7'\n\
             '/usr/bin/python3' '/opt/simmgr/run_simulation.py'\n"
        );
    }

    #[test]
    fn slurm_script_layout() {
        let script = ClusterScheduler::new(Dialect::Slurm).script(
            Path::new("/opt/runner"),
            Path::new("/data/simulations/8"),
            &[],
        );

        assert_eq!(
            script,
            "#!/bin/bash\n\
             #SBATCH --job-name=simulation\n\
             #SBATCH --chdir=/data/simulations/8\n\
             #SBATCH --nodes=1\n\
             #SBATCH --ntasks=1\n\
             #SBATCH --export=ALL\n\
             #SBATCH --output=stdout.txt\n\
             cd '/data/simulations/8'\n\
             '/opt/runner'\n"
        );
    }

    #[test]
    fn arguments_are_shell_quoted() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn parses_job_ids() {
        assert_eq!(
            Dialect::Pbs.parse_job_id("4711.headnode\n"),
            Some(JobId::new("4711.headnode"))
        );
        assert_eq!(Dialect::Pbs.parse_job_id("\n  \n"), None);
        assert_eq!(
            Dialect::Slurm.parse_job_id("Submitted batch job 42\n"),
            Some(JobId::new("42"))
        );
        assert_eq!(Dialect::Slurm.parse_job_id("sbatch: error"), None);
    }

    #[test]
    fn pbs_submission_returns_scheduler_output() {
        let tmp = tempfile::tempdir().unwrap();

        let job = scheduler(Dialect::Pbs)
            .submit_job(Path::new("/bin/echo"), tmp.path(), &args(&["4711.headnode"]))
            .unwrap();

        assert_eq!(job, Some(JobId::new("4711.headnode")));
        assert!(tmp.path().join("pbs.sh").is_file());
    }

    #[test]
    fn slurm_submission_parses_job_id() {
        let tmp = tempfile::tempdir().unwrap();

        let job = scheduler(Dialect::Slurm)
            .submit_job(
                Path::new("/bin/echo"),
                tmp.path(),
                &args(&["Submitted batch job 1234"]),
            )
            .unwrap();

        assert_eq!(job, Some(JobId::new("1234")));
        assert!(tmp.path().join("slurm.sh").is_file());
    }

    #[test]
    fn failing_submit_command_returns_no_handle() {
        let tmp = tempfile::tempdir().unwrap();

        let job = scheduler(Dialect::Pbs)
            .submit_job(Path::new("/bin/false"), tmp.path(), &[])
            .unwrap();

        assert_eq!(job, None);
    }

    #[test]
    fn missing_submit_command_returns_no_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = ClusterScheduler::load(
            Dialect::Pbs,
            &BatchConfig::new("pbs").with_parameter("submit_exec", "/nonexistent/qsub"),
        )
        .unwrap();

        let job = scheduler
            .submit_job(Path::new("/bin/echo"), tmp.path(), &[])
            .unwrap();

        assert_eq!(job, None);
    }

    #[test]
    fn slow_submit_command_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = ClusterScheduler::load(
            Dialect::Pbs,
            &BatchConfig::new("pbs")
                .with_parameter("submit_exec", "/bin/sh")
                .with_parameter("timeout", 100),
        )
        .unwrap();

        let job = scheduler
            .submit_job(Path::new("/bin/sleep"), tmp.path(), &args(&["5"]))
            .unwrap();

        assert_eq!(job, None);
    }

    #[test]
    fn chatty_submit_command_still_returns_job_id() {
        let tmp = tempfile::tempdir().unwrap();

        // far more stderr than a pipe buffer holds before the job id is printed
        let job = scheduler(Dialect::Pbs)
            .submit_job(
                Path::new("/bin/sh"),
                tmp.path(),
                &args(&["-c", "head -c 200000 /dev/zero >&2; echo 4711.headnode"]),
            )
            .unwrap();

        assert_eq!(job, Some(JobId::new("4711.headnode")));
    }

    #[test]
    fn background_process_holding_output_does_not_block() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = ClusterScheduler::load(
            Dialect::Pbs,
            &BatchConfig::new("pbs")
                .with_parameter("submit_exec", "/bin/sh")
                .with_parameter("timeout", 500),
        )
        .unwrap();

        let started = Instant::now();
        scheduler
            .submit_job(
                Path::new("/bin/sh"),
                tmp.path(),
                &args(&["-c", "sleep 5 & echo 4711.headnode"]),
            )
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn job_name_with_whitespace_is_rejected() {
        assert!(matches!(
            ClusterScheduler::load(
                Dialect::Slurm,
                &BatchConfig::new("slurm").with_parameter("job_name", "open malaria"),
            ),
            Err(ConfigErrors::InvalidParameter { .. })
        ));
    }

    #[test]
    fn working_dir_with_whitespace_is_a_contract_error() {
        let tmp = tempfile::tempdir().unwrap();
        let working_dir = tmp.path().join("simulation 7");
        fs::create_dir(&working_dir).unwrap();

        assert!(matches!(
            scheduler(Dialect::Slurm).submit_job(Path::new("/bin/echo"), &working_dir, &[]),
            Err(BatchError::UnsupportedWorkingDir(_))
        ));
        assert!(!working_dir.join("slurm.sh").exists());
    }

    #[test]
    fn missing_working_dir_is_a_contract_error() {
        let tmp = tempfile::tempdir().unwrap();

        assert!(matches!(
            scheduler(Dialect::Pbs).submit_job(
                Path::new("/bin/echo"),
                &tmp.path().join("missing"),
                &[]
            ),
            Err(BatchError::MissingWorkingDir(_))
        ));
    }
}
