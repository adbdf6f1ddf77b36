//! Configuration loaded from `gpualloc.toml`.
//!
//! [`Config`] carries every tunable the orchestrator needs: the connection
//! target, the scheduler protocol strings, the candidate list with its
//! timeouts and memory threshold, and the remote workspace layout. Values
//! absent from the file fall back to the reference-deployment defaults.
//! The password itself is never stored here; `connection.password_env`
//! names the environment variable that holds it.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from `gpualloc.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub protocol: ProtocolConfig,
    pub allocation: AllocationConfig,
    pub workspace: WorkspaceConfig,
}

/// Where and how to open the remote shell session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub user: String,
    /// Name of the environment variable holding the login password.
    pub password_env: String,
    /// Deadline for the full login handshake (password prompt through
    /// first shell prompt).
    pub login_timeout_secs: u64,
    /// Deadline for the remote side to hang up after the termination
    /// command; past it the child is killed.
    pub close_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "ssh8.engr.wustl.edu".to_string(),
            user: String::new(),
            password_env: "GPUALLOC_PASSWORD".to_string(),
            login_timeout_secs: 120,
            close_timeout_secs: 10,
        }
    }
}

/// The scheduler's terminal protocol: command templates and the patterns
/// that signal grants and prompts. All of these are plain strings or regex
/// sources; nothing in the core hardcodes them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Reservation request template. `{server}` and `{gpus}` are substituted.
    pub reserve_command: String,
    pub gpus_per_reservation: u32,
    /// Literal marker the scheduler prints once the interactive allocation
    /// has started.
    pub start_marker: String,
    /// Shell prompt regex, both on the login host and the allocated node.
    pub prompt_pattern: String,
    /// Password prompt regex during login.
    pub password_prompt: String,
    pub diagnostic_command: String,
    /// Substring that must appear in healthy diagnostic output.
    pub diagnostic_signature: String,
    /// Regex extracting used/total memory, two numeric capture groups.
    pub memory_pattern: String,
    pub exit_command: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            reserve_command: r#"bsub -m {server} -gpu "num={gpus}" -Is /bin/bash"#.to_string(),
            gpus_per_reservation: 1,
            start_marker: "<<Starting on".to_string(),
            prompt_pattern: r"\$ ".to_string(),
            password_prompt: "password:".to_string(),
            diagnostic_command: "nvidia-smi".to_string(),
            diagnostic_signature: "NVIDIA-SMI".to_string(),
            memory_pattern: r"(\d+)MiB\s*/\s*(\d+)MiB".to_string(),
            exit_command: "exit".to_string(),
        }
    }
}

/// Candidate servers, timeouts, and the acceptability threshold.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Reservation targets in priority order; earlier entries are always
    /// tried first within a round.
    pub candidates: Vec<String>,
    /// Minimum free memory, in MiB, for a granted node to be accepted.
    pub threshold_mib: u64,
    /// How long to wait for the scheduler to grant a reservation.
    pub grant_timeout_secs: u64,
    /// How long to wait for a shell prompt to (re)appear.
    pub prompt_timeout_secs: u64,
    /// Upper bound on full validation rounds over the candidate list.
    pub max_rounds: u32,
    /// When all candidates fail to grant, skip the job and keep running
    /// instead of aborting the batch.
    pub continue_on_exhaustion: bool,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            candidates: vec!["cigserver5".to_string(), "cigserver3".to_string()],
            threshold_mib: 3000,
            grant_timeout_secs: 240,
            prompt_timeout_secs: 120,
            max_rounds: 25,
            continue_on_exhaustion: true,
        }
    }
}

/// Remote workspace layout for the post-allocation checkpoint lookup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Path, relative to the remote home, under which job directories live.
    pub remote_root: String,
    /// Absolute remote prefix used when constructing the model path.
    pub model_root: String,
    /// Checkpoint filename regex; one numeric capture group orders the
    /// candidates.
    pub checkpoint_pattern: String,
    /// Sampling script invoked by the constructed downstream command.
    pub sample_script: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            remote_root: "self-supervised-diffusion/final_experiments".to_string(),
            model_root: "/project/cigserver3/export1/g.harry/self-supervised-diffusion/final_experiments".to_string(),
            checkpoint_pattern: r"ema_0\.9999_(\d+)\.pt".to_string(),
            sample_script: "fastmri_condititonal_sample.py".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the given path, or from `gpualloc.toml` in
    /// the current directory. Missing file means all defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = Path::new(path.unwrap_or("gpualloc.toml"));
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<Config>(&contents)?
        } else {
            Self::default()
        };
        Ok(config)
    }

    /// Resolve the login password from the configured environment variable.
    pub fn password(&self) -> Result<String> {
        std::env::var(&self.connection.password_env).map_err(|_| {
            anyhow::anyhow!(
                "password not found: set the {} environment variable",
                self.connection.password_env
            )
        })
    }
}
