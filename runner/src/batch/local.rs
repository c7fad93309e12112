use super::{check_job_inputs, BatchError, BatchSystem, JobId};
use crate::{
    config::{BatchConfig, ConfigErrors},
    working_dirs::STDOUT_FILENAME,
};
use parking_lot::Mutex;
use std::{
    ffi::OsStr,
    fs::File,
    io,
    path::Path,
    process::{Child, Command, Stdio},
};
use tracing::{debug, error, info, instrument};

/// Batch system that runs every job as a child process on this host
///
/// Jobs are fire-and-forget: the process id is returned right after the spawn. Finished jobs are
/// reaped on later submissions, the exit status is not looked at.
#[derive(Debug, Default)]
pub struct LocalProcess {
    children: Mutex<Vec<Child>>,
}

impl LocalProcess {
    pub fn load(_config: &BatchConfig) -> Result<Self, ConfigErrors> {
        Ok(Self::default())
    }

    // drop every child that has exited, without blocking on the others
    fn reap(&self) {
        self.children.lock().retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), ?status, "Local job finished");
                false
            }
            Ok(None) => true,
            // already waited for elsewhere
            Err(_) => false,
        });
    }
}

fn output_file(working_dir: &Path) -> io::Result<(File, File)> {
    let stdout = File::create(working_dir.join(STDOUT_FILENAME))?;
    let stderr = stdout.try_clone()?;

    Ok((stdout, stderr))
}

fn spawn<S: AsRef<OsStr>>(
    executable: &Path,
    working_dir: &Path,
    args: &[S],
    (stdout, stderr): (File, File),
) -> io::Result<Child> {
    Command::new(executable)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
}

/// start `executable` in `working_dir` with stdout and stderr combined in `stdout.txt`
///
/// The child is never waited on, it stays a zombie after exiting until the calling process
/// exits. Meant for callers that exit right after starting it.
pub fn start<S: AsRef<OsStr>>(
    executable: &Path,
    working_dir: &Path,
    args: &[S],
) -> io::Result<u32> {
    let output = output_file(working_dir)?;

    Ok(spawn(executable, working_dir, args, output)?.id())
}

impl BatchSystem for LocalProcess {
    #[instrument(skip(self, args), level = "debug")]
    fn submit_job(
        &self,
        executable: &Path,
        working_dir: &Path,
        args: &[String],
    ) -> Result<Option<JobId>, BatchError> {
        check_job_inputs(executable, working_dir)?;
        self.reap();

        // failing to prepare the output is a local fault, not a rejected job
        let output = output_file(working_dir)?;

        match spawn(executable, working_dir, args, output) {
            Ok(child) => {
                let pid = child.id();
                info!(pid, "Started local job");
                self.children.lock().push(child);

                Ok(Some(JobId::new(pid.to_string())))
            }
            Err(e) => {
                error!(error = ?e, "Failed to start local job: {e}");

                Ok(None)
            }
        }
    }
}
