//! Slurm command lines issued through the login session
//!
//! Output is returned as raw text. `salloc` blocks on the remote side until
//! the allocation is granted, so it goes to the interactive shell instead of
//! a one-shot channel.
//!
//! Batch jobs are submitted through wrapper scripts kept under
//! `./slurm_configs/{cpu,gpu}/*.slurmconfig` in the remote home directory.
//! Each wrapper takes `<script> <output> <hours> <memory> <job name> [email]`.

use std::fmt;

use crate::connection::ConnectionManager;
use crate::error::ConsoleError;

const SACCT_FORMAT: &str = "JobID,JobName%50,State,Start,End,Elapsed,NodeList";

pub const GPU_TYPES: &[&str] = &["any", "p100", "v100", "a100", "h100"];

/// Remote directory holding the job submission wrappers
pub const SLURM_CONFIG_BASE_PATH: &str = "./slurm_configs";

const SLURM_CONFIG_EXTENSION: &str = ".slurmconfig";

/// Partition family a submission wrapper targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigKind {
    #[default]
    Cpu,
    Gpu,
}

impl ConfigKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }

    fn directory(&self) -> String {
        format!("{}/{}", SLURM_CONFIG_BASE_PATH, self.as_str())
    }
}

impl std::str::FromStr for ConfigKind {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            other => Err(ConsoleError::Configuration(format!(
                "Unknown config type '{}'. Expected cpu or gpu.",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Cpu { cpu_cores: u32 },
    Gpu { gpu_type: String, gpu_count: u32 },
}

/// A validated `salloc` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    pub hours: u32,
    pub nodes: u32,
    pub memory: String,
    pub kind: NodeKind,
}

impl NodeRequest {
    /// `--time` value, `D-H:00:00`
    pub fn time_limit(&self) -> String {
        format!("{}-{}:00:00", self.hours / 24, self.hours % 24)
    }

    pub fn command_line(&self) -> String {
        match &self.kind {
            NodeKind::Cpu { cpu_cores } => format!(
                "salloc --nodes={} --cpus-per-task={} --mem={} --partition=CPUQ --time={}",
                self.nodes,
                cpu_cores,
                self.memory,
                self.time_limit()
            ),
            NodeKind::Gpu {
                gpu_type,
                gpu_count,
            } => format!(
                "salloc --nodes={} --gres=gpu:{}:{} --mem={} --partition=GPUQ --time={}",
                self.nodes,
                gpu_type,
                gpu_count,
                self.memory,
                self.time_limit()
            ),
        }
    }
}

/// Unvalidated node request fields as typed by the operator
#[derive(Debug, Clone, Default)]
pub struct NodeRequestForm {
    pub gpu: bool,
    pub hours: Option<String>,
    pub nodes: Option<String>,
    pub memory: Option<String>,
    pub cpu_cores: Option<String>,
    pub gpu_type: Option<String>,
    pub gpu_count: Option<String>,
}

fn required<'a>(value: &'a Option<String>) -> Result<&'a str, ConsoleError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConsoleError::Configuration("Please fill out all fields.".to_string()))
}

fn positive(field: &str, value: &str) -> Result<u32, ConsoleError> {
    match value.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConsoleError::Configuration(format!(
            "{} must be a positive whole number, got '{}'.",
            field, value
        ))),
    }
}

impl NodeRequestForm {
    pub fn validate(&self) -> Result<NodeRequest, ConsoleError> {
        let hours = positive("Time (hours)", required(&self.hours)?)?;
        let nodes = positive("Node count", required(&self.nodes)?)?;
        let memory = required(&self.memory)?.to_string();

        let kind = if self.gpu {
            let gpu_type = required(&self.gpu_type)?.to_ascii_lowercase();
            if !GPU_TYPES.contains(&gpu_type.as_str()) {
                return Err(ConsoleError::Configuration(format!(
                    "Unknown GPU type '{}'. Expected one of: {}.",
                    gpu_type,
                    GPU_TYPES.join(", ")
                )));
            }
            NodeKind::Gpu {
                gpu_type,
                gpu_count: positive("GPU count", required(&self.gpu_count)?)?,
            }
        } else {
            NodeKind::Cpu {
                cpu_cores: positive("CPU cores", required(&self.cpu_cores)?)?,
            }
        };

        Ok(NodeRequest {
            hours,
            nodes,
            memory,
            kind,
        })
    }
}

/// A validated batch job submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmission {
    pub kind: ConfigKind,
    pub config: String,
    pub script: String,
    pub output: String,
    pub hours: u32,
    pub memory: String,
    pub job_name: String,
    pub email: Option<String>,
}

impl JobSubmission {
    pub fn wrapper_path(&self) -> String {
        format!("{}/{}", self.kind.directory(), self.config)
    }

    pub fn command_line(&self) -> String {
        let mut line = format!(
            "{} {} {} {} {} {}",
            self.wrapper_path(),
            self.script,
            self.output,
            self.hours,
            self.memory,
            self.job_name
        );
        if let Some(email) = &self.email {
            line.push(' ');
            line.push_str(email);
        }
        line
    }
}

/// Unvalidated submission fields as typed by the operator
#[derive(Debug, Clone, Default)]
pub struct JobSubmissionForm {
    pub kind: ConfigKind,
    pub config: Option<String>,
    pub script: Option<String>,
    pub output: Option<String>,
    pub hours: Option<String>,
    pub memory: Option<String>,
    pub job_name: Option<String>,
    pub email: Option<String>,
}

/// Fields end up as words on a remote shell command line
fn shell_word<'a>(field: &str, value: &'a str) -> Result<&'a str, ConsoleError> {
    let safe = |b: u8| b.is_ascii_alphanumeric() || b"._-/@+=:,%".contains(&b);
    if value.bytes().all(safe) {
        Ok(value)
    } else {
        Err(ConsoleError::Configuration(format!(
            "{} contains unsupported characters: '{}'.",
            field, value
        )))
    }
}

impl JobSubmissionForm {
    pub fn validate(&self) -> Result<JobSubmission, ConsoleError> {
        let config = required(&self.config)?;
        let script = required(&self.script)?;
        let output = required(&self.output)?;
        let hours = required(&self.hours)?;
        let memory = required(&self.memory)?;
        let job_name = required(&self.job_name)?;

        let config = shell_word("Config file", config)?;
        if config.contains('/') || !config.ends_with(SLURM_CONFIG_EXTENSION) {
            return Err(ConsoleError::Configuration(format!(
                "Config file must be a {} file name, got '{}'.",
                SLURM_CONFIG_EXTENSION, config
            )));
        }

        let email = match self.email.as_deref().map(str::trim) {
            Some(email) if !email.is_empty() => Some(shell_word("Email", email)?.to_string()),
            _ => None,
        };

        Ok(JobSubmission {
            kind: self.kind,
            config: config.to_string(),
            script: shell_word("Script", script)?.to_string(),
            output: shell_word("Output file", output)?.to_string(),
            hours: positive("Time (hours)", hours)?,
            memory: shell_word("Memory", memory)?.to_string(),
            job_name: shell_word("Job name", job_name)?.to_string(),
            email,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCommand {
    Queue { user: String },
    Cancel { job_id: String },
    History { user: String },
    Allocate(NodeRequest),
    /// Submission wrappers available for `kind`
    ListConfigs { kind: ConfigKind },
    Submit(JobSubmission),
    /// Running VNC servers, as printed by `vncserver -list`
    VncList,
}

/// Job ids are digits with an optional `_suffix` for array tasks
fn is_valid_job_id(job_id: &str) -> bool {
    let (base, suffix) = match job_id.split_once('_') {
        Some((base, suffix)) => (base, Some(suffix)),
        None => (job_id, None),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(base)
        && suffix.map_or(true, |s| {
            !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

impl SchedulerCommand {
    pub fn cancel(job_id: &str) -> Result<Self, ConsoleError> {
        let job_id = job_id.trim();
        if !is_valid_job_id(job_id) {
            return Err(ConsoleError::Configuration(format!(
                "Invalid job id '{}'.",
                job_id
            )));
        }
        Ok(Self::Cancel {
            job_id: job_id.to_string(),
        })
    }

    pub fn command_line(&self) -> String {
        match self {
            Self::Queue { user } => format!("squeue -u {}", user),
            Self::Cancel { job_id } => format!("scancel {}", job_id),
            Self::History { user } => format!("sacct -u {} --format={}", user, SACCT_FORMAT),
            Self::Allocate(request) => request.command_line(),
            Self::ListConfigs { kind } => {
                format!("ls {}/*{}", kind.directory(), SLURM_CONFIG_EXTENSION)
            }
            Self::Submit(job) => job.command_line(),
            Self::VncList => "vncserver -list".to_string(),
        }
    }

    /// Sent to the interactive shell rather than waited on
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, Self::Allocate(_))
    }

    /// Run through `connection`; returns command output or a status line
    pub async fn execute(&self, connection: &ConnectionManager) -> Result<String, ConsoleError> {
        let line = self.command_line();
        if self.is_fire_and_forget() {
            connection.run_async_command(&line).await?;
            return Ok("Requested a node!".to_string());
        }
        let output = connection.run_command(&line).await?;
        match self {
            Self::ListConfigs { .. } => Ok(output
                .lines()
                .filter_map(|path| path.trim().rsplit('/').next())
                .filter(|name| !name.is_empty())
                .collect::<Vec<_>>()
                .join("\n")),
            Self::Submit(job) if output.is_empty() => Ok(format!("Job submitted:\n{}", job.script)),
            Self::Submit(job) => Ok(format!("Job submitted:\n{}\n{}", job.script, output)),
            _ => Ok(output),
        }
    }
}

impl fmt::Display for SchedulerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{valid_credentials, FakeConnector};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn form(gpu: bool) -> NodeRequestForm {
        NodeRequestForm {
            gpu,
            hours: Some("30".into()),
            nodes: Some("1".into()),
            memory: Some("16G".into()),
            cpu_cores: Some("8".into()),
            gpu_type: Some("A100".into()),
            gpu_count: Some("2".into()),
        }
    }

    #[test]
    fn test_simple_command_lines() {
        let queue = SchedulerCommand::Queue { user: "alice".into() };
        assert_eq!(queue.command_line(), "squeue -u alice");

        let history = SchedulerCommand::History { user: "alice".into() };
        assert_eq!(
            history.to_string(),
            "sacct -u alice --format=JobID,JobName%50,State,Start,End,Elapsed,NodeList"
        );

        assert_eq!(
            SchedulerCommand::cancel(" 123456 ").unwrap().command_line(),
            "scancel 123456"
        );
        assert_eq!(
            SchedulerCommand::cancel("123456_7").unwrap().command_line(),
            "scancel 123456_7"
        );
    }

    #[test]
    fn test_cancel_rejects_bad_ids() {
        for bad in ["", "abc", "12; rm -rf ~", "_3", "12_"] {
            assert!(
                matches!(SchedulerCommand::cancel(bad), Err(ConsoleError::Configuration(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_cpu_allocation() {
        let request = form(false).validate().unwrap();
        assert_eq!(request.time_limit(), "1-6:00:00");
        assert_eq!(
            request.command_line(),
            "salloc --nodes=1 --cpus-per-task=8 --mem=16G --partition=CPUQ --time=1-6:00:00"
        );
    }

    #[test]
    fn test_gpu_allocation() {
        let mut f = form(true);
        f.hours = Some("4".into());
        let request = f.validate().unwrap();
        assert_eq!(
            request.command_line(),
            "salloc --nodes=1 --gres=gpu:a100:2 --mem=16G --partition=GPUQ --time=0-4:00:00"
        );
    }

    #[test]
    fn test_missing_fields() {
        let mut f = form(true);
        f.gpu_count = None;
        assert!(matches!(f.validate(), Err(ConsoleError::Configuration(_))));

        let mut f = form(false);
        f.memory = Some("  ".into());
        assert!(matches!(f.validate(), Err(ConsoleError::Configuration(_))));

        let mut f = form(false);
        f.hours = Some("zero".into());
        assert!(matches!(f.validate(), Err(ConsoleError::Configuration(_))));

        let mut f = form(true);
        f.gpu_type = Some("tpu".into());
        assert!(matches!(f.validate(), Err(ConsoleError::Configuration(_))));
    }

    fn submission() -> JobSubmissionForm {
        JobSubmissionForm {
            kind: ConfigKind::Gpu,
            config: Some("a100.slurmconfig".into()),
            script: Some("jobs/train.sh".into()),
            output: Some("train.out".into()),
            hours: Some("12".into()),
            memory: Some("64G".into()),
            job_name: Some("train".into()),
            email: Some("alice@cluster.example".into()),
        }
    }

    #[test]
    fn test_submit_command_line() {
        let job = submission().validate().unwrap();
        assert_eq!(
            job.command_line(),
            "./slurm_configs/gpu/a100.slurmconfig jobs/train.sh train.out 12 64G train alice@cluster.example"
        );

        let mut f = submission();
        f.kind = ConfigKind::Cpu;
        f.email = Some(" ".into());
        assert_eq!(
            f.validate().unwrap().command_line(),
            "./slurm_configs/cpu/a100.slurmconfig jobs/train.sh train.out 12 64G train"
        );
    }

    #[test]
    fn test_submit_validation() {
        let mut f = submission();
        f.job_name = None;
        assert!(matches!(
            f.validate(),
            Err(ConsoleError::Configuration(msg)) if msg == "Please fill out all fields."
        ));

        let mut f = submission();
        f.script = Some("train.sh;reboot".into());
        assert!(matches!(f.validate(), Err(ConsoleError::Configuration(_))));

        let mut f = submission();
        f.config = Some("../cpu/a100.slurmconfig".into());
        assert!(matches!(f.validate(), Err(ConsoleError::Configuration(_))));

        let mut f = submission();
        f.config = Some("run.sh".into());
        assert!(matches!(f.validate(), Err(ConsoleError::Configuration(_))));

        let mut f = submission();
        f.hours = Some("0".into());
        assert!(matches!(f.validate(), Err(ConsoleError::Configuration(_))));
    }

    #[test]
    fn test_listing_command_lines() {
        assert_eq!(
            SchedulerCommand::ListConfigs { kind: ConfigKind::Cpu }.command_line(),
            "ls ./slurm_configs/cpu/*.slurmconfig"
        );
        assert_eq!(SchedulerCommand::VncList.command_line(), "vncserver -list");
        assert_eq!("GPU".parse::<ConfigKind>().unwrap(), ConfigKind::Gpu);
        assert!("all".parse::<ConfigKind>().is_err());
    }

    #[tokio::test]
    async fn test_submit_runs_wrapper() {
        let connector = Arc::new(FakeConnector::new());
        let connection = ConnectionManager::new(connector.clone());
        connection.connect(&valid_credentials()).await.unwrap();

        let job = submission().validate().unwrap();
        let expected = job.command_line();
        let status = SchedulerCommand::Submit(job).execute(&connection).await.unwrap();
        assert!(status.starts_with("Job submitted:\njobs/train.sh"));

        let fake = connector.last_transport().unwrap();
        assert!(fake.commands.lock().contains(&expected));
    }

    #[tokio::test]
    async fn test_execute_routes_by_kind() {
        let connector = Arc::new(FakeConnector::new());
        let connection = ConnectionManager::new(connector.clone());
        connection.connect(&valid_credentials()).await.unwrap();
        let mut shell = connector.last_transport().unwrap().take_shell_peer().unwrap();

        let status = SchedulerCommand::Allocate(form(false).validate().unwrap())
            .execute(&connection)
            .await
            .unwrap();
        assert_eq!(status, "Requested a node!");

        let expected = "salloc --nodes=1 --cpus-per-task=8 --mem=16G --partition=CPUQ --time=1-6:00:00\n";
        let mut buf = vec![0u8; expected.len()];
        shell.read_exact(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);

        SchedulerCommand::Queue { user: "alice".into() }
            .execute(&connection)
            .await
            .unwrap();
        let fake = connector.last_transport().unwrap();
        assert!(fake.commands.lock().contains(&"squeue -u alice".to_string()));
    }
}
