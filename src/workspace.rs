//! Post-allocation workspace lookup and downstream command construction.
//!
//! Once a reservation is accepted, the job's experiment directory is
//! inspected on the remote side to find the newest checkpoint artifact,
//! and the sampling command for the researcher is assembled from the job
//! parameters and the checkpoint's absolute path.

use regex::Regex;

use crate::allocator::ResourceAllocator;
use crate::config::WorkspaceConfig;
use crate::error::AllocError;
use crate::queue::JobDescriptor;
use crate::session::{SessionChannel, SessionError};

/// Outcome of the remote lookup for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceReport {
    /// Newest checkpoint filename, `None` when the directory held no
    /// matching artifact (recoverable; recorded on the job as missing).
    pub checkpoint: Option<String>,
    /// Absolute remote path to the checkpoint, when one was found.
    pub model_path: Option<String>,
}

#[derive(Debug)]
pub struct Workspace {
    remote_root: String,
    model_root: String,
    checkpoint_pattern: Regex,
    sample_script: String,
}

impl Workspace {
    pub fn from_config(config: &WorkspaceConfig) -> Result<Self, AllocError> {
        let checkpoint_pattern = Regex::new(&config.checkpoint_pattern)
            .map_err(|e| AllocError::Config(format!("checkpoint_pattern: {e}")))?;
        Ok(Self {
            remote_root: config.remote_root.clone(),
            model_root: config.model_root.clone(),
            checkpoint_pattern,
            sample_script: config.sample_script.clone(),
        })
    }

    /// Pick the checkpoint with the highest numeric suffix among `names`.
    /// The pattern's first capture group supplies the ordering key; names
    /// without a parseable group are skipped.
    pub fn select_checkpoint<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Option<String> {
        names
            .into_iter()
            .filter_map(|name| {
                let caps = self.checkpoint_pattern.captures(name)?;
                let step: u64 = caps.get(1)?.as_str().parse().ok()?;
                Some((step, name))
            })
            .max_by_key(|(step, _)| *step)
            .map(|(_, name)| name.to_string())
    }

    /// Enter the job's directory on the allocated node, list it, and select
    /// the newest checkpoint.
    pub fn lookup<C: SessionChannel>(
        &self,
        allocator: &ResourceAllocator,
        chan: &mut C,
        directory: &str,
    ) -> Result<WorkspaceReport, SessionError> {
        let cd = format!("cd {}/{}", self.remote_root, directory);
        allocator.run_command(chan, &cd)?;
        let listing = allocator.run_command(chan, "ls")?;

        let checkpoint = self.select_checkpoint(listing.split_whitespace());
        let model_path = checkpoint
            .as_deref()
            .map(|name| format!("{}/{}/{}", self.model_root, directory, name));
        Ok(WorkspaceReport {
            checkpoint,
            model_path,
        })
    }

    /// Assemble the downstream sampling command for a job.
    pub fn build_sample_command(&self, job: &JobDescriptor, model_path: &str) -> String {
        let mut command = format!(
            "python {} --model_path {} --type {} --num_samples {}",
            self.sample_script, model_path, job.job_type, job.num_samples
        );
        if job.indi {
            command.push_str(" --indi");
            if let Some(steps) = job.indi_steps {
                command.push_str(&format!(" --indisteps {steps}"));
            }
            if let Some(noise) = job.indi_noise {
                command.push_str(&format!(" --indinoise {noise}"));
            }
        }
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllocationConfig, ProtocolConfig};
    use crate::session::testing::{Reply, ScriptedChannel};

    fn workspace() -> Workspace {
        Workspace::from_config(&WorkspaceConfig::default()).unwrap()
    }

    fn job(indi: bool) -> JobDescriptor {
        JobDescriptor {
            directory: "exp_knee".to_string(),
            job_type: "brain".to_string(),
            indi,
            indi_steps: indi.then_some(10),
            indi_noise: indi.then_some(0.1),
            num_samples: 4,
            ready: true,
            done: false,
            result: None,
        }
    }

    #[test]
    fn selects_highest_numeric_suffix() {
        let ws = workspace();
        let names = vec![
            "model_300000.pt",
            "ema_0.9999_100000.pt",
            "ema_0.9999_250000.pt",
            "ema_0.9999_050000.pt",
            "log.txt",
        ];
        assert_eq!(
            ws.select_checkpoint(names),
            Some("ema_0.9999_250000.pt".to_string())
        );
    }

    #[test]
    fn no_matching_artifact_is_none() {
        let ws = workspace();
        assert_eq!(ws.select_checkpoint(vec!["model.pt", "train.log"]), None);
        assert_eq!(ws.select_checkpoint(Vec::<&str>::new()), None);
    }

    #[test]
    fn lookup_changes_directory_then_lists() {
        let ws = workspace();
        let allocator =
            ResourceAllocator::from_config(&ProtocolConfig::default(), &AllocationConfig::default())
                .unwrap();
        let mut chan = ScriptedChannel::new(vec![
            Reply::Match(String::new()), // cd
            Reply::Match("ema_0.9999_100000.pt  ema_0.9999_200000.pt  opt.pt\n".into()),
        ]);

        let report = ws.lookup(&allocator, &mut chan, "exp_knee").unwrap();
        assert_eq!(
            chan.sent_lines(),
            vec![
                "cd self-supervised-diffusion/final_experiments/exp_knee",
                "ls"
            ]
        );
        assert_eq!(report.checkpoint.as_deref(), Some("ema_0.9999_200000.pt"));
        assert_eq!(
            report.model_path.as_deref(),
            Some(
                "/project/cigserver3/export1/g.harry/self-supervised-diffusion/final_experiments/exp_knee/ema_0.9999_200000.pt"
            )
        );
    }

    #[test]
    fn lookup_with_empty_directory_reports_missing_checkpoint() {
        let ws = workspace();
        let allocator =
            ResourceAllocator::from_config(&ProtocolConfig::default(), &AllocationConfig::default())
                .unwrap();
        let mut chan = ScriptedChannel::new(vec![
            Reply::Match(String::new()),
            Reply::Match("README.md\n".into()),
        ]);

        let report = ws.lookup(&allocator, &mut chan, "exp_fresh").unwrap();
        assert_eq!(report.checkpoint, None);
        assert_eq!(report.model_path, None);
    }

    #[test]
    fn sample_command_without_refinement() {
        let ws = workspace();
        let command = ws.build_sample_command(&job(false), "/models/exp/ema_0.9999_200000.pt");
        assert_eq!(
            command,
            "python fastmri_condititonal_sample.py --model_path /models/exp/ema_0.9999_200000.pt --type brain --num_samples 4"
        );
    }

    #[test]
    fn sample_command_with_refinement_flags() {
        let ws = workspace();
        let command = ws.build_sample_command(&job(true), "/models/m.pt");
        assert_eq!(
            command,
            "python fastmri_condititonal_sample.py --model_path /models/m.pt --type brain --num_samples 4 --indi --indisteps 10 --indinoise 0.1"
        );
    }
}
