//! Parsing and acceptance of GPU diagnostic output.
//!
//! The allocated node is probed with a diagnostic tool (`nvidia-smi` in the
//! reference deployment) and its output decides whether the reservation is
//! worth keeping: a node whose free memory is at or below the threshold is
//! released and the candidate list is retried.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Used/total device memory extracted from one diagnostic report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySample {
    pub used_mib: u64,
    pub total_mib: u64,
}

impl MemorySample {
    /// Free memory on the device, in MiB.
    pub fn headroom_mib(&self) -> u64 {
        self.total_mib.abs_diff(self.used_mib)
    }

    /// A sample is acceptable when strictly more than `threshold_mib` of
    /// memory is free.
    pub fn is_acceptable(&self, threshold_mib: u64) -> bool {
        self.headroom_mib() > threshold_mib
    }
}

impl std::fmt::Display for MemorySample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}MiB / {}MiB ({}MiB free)",
            self.used_mib,
            self.total_mib,
            self.headroom_mib()
        )
    }
}

/// Extract a [`MemorySample`] from diagnostic output.
///
/// Returns `None` when `signature` does not appear anywhere in the output
/// (the tool did not actually run) or when no `used/total` pair matches
/// `pattern`. The signature check happens first: numeric content in an
/// unsigned report is never trusted.
pub fn sample(output: &str, signature: &str, pattern: &Regex) -> Option<MemorySample> {
    if !output.contains(signature) {
        return None;
    }
    let caps = pattern.captures(output)?;
    let used_mib = caps.get(1)?.as_str().parse().ok()?;
    let total_mib = caps.get(2)?.as_str().parse().ok()?;
    Some(MemorySample { used_mib, total_mib })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNATURE: &str = "NVIDIA-SMI";

    fn pattern() -> Regex {
        Regex::new(r"(\d+)MiB\s*/\s*(\d+)MiB").unwrap()
    }

    const HEALTHY_OUTPUT: &str = "\
+-----------------------------------------------------------------------------+\n\
| NVIDIA-SMI 525.60.11    Driver Version: 525.60.11    CUDA Version: 12.0     |\n\
|   0  NVIDIA RTX A6000    On   | 00000000:3B:00.0 Off |       1000MiB /  8000MiB |\n\
+-----------------------------------------------------------------------------+\n";

    #[test]
    fn parses_used_and_total() {
        let s = sample(HEALTHY_OUTPUT, SIGNATURE, &pattern()).unwrap();
        assert_eq!(
            s,
            MemorySample {
                used_mib: 1000,
                total_mib: 8000
            }
        );
    }

    #[test]
    fn missing_signature_rejects_regardless_of_numbers() {
        let output = "bash: nvidia-smi: command not found\n1000MiB / 8000MiB";
        assert_eq!(sample(output, SIGNATURE, &pattern()), None);
    }

    #[test]
    fn signature_without_memory_pair_rejects() {
        let output = "NVIDIA-SMI has failed because it couldn't communicate with the driver";
        assert_eq!(sample(output, SIGNATURE, &pattern()), None);
    }

    #[test]
    fn tolerates_spacing_around_slash() {
        let out = "NVIDIA-SMI ok 512MiB/16384MiB";
        let s = sample(out, SIGNATURE, &pattern()).unwrap();
        assert_eq!(s.used_mib, 512);
        assert_eq!(s.total_mib, 16384);
    }

    #[test]
    fn headroom_is_absolute_difference() {
        let s = MemorySample {
            used_mib: 7500,
            total_mib: 8000,
        };
        assert_eq!(s.headroom_mib(), 500);

        // Degenerate report with used > total still yields a magnitude.
        let odd = MemorySample {
            used_mib: 9000,
            total_mib: 8000,
        };
        assert_eq!(odd.headroom_mib(), 1000);
    }

    #[test]
    fn acceptability_is_strict_at_the_threshold() {
        let exactly_at = MemorySample {
            used_mib: 5000,
            total_mib: 8000,
        };
        assert!(!exactly_at.is_acceptable(3000));

        let just_over = MemorySample {
            used_mib: 4999,
            total_mib: 8000,
        };
        assert!(just_over.is_acceptable(3000));
    }

    #[test]
    fn scenario_a_plenty_of_headroom() {
        let out = "NVIDIA-SMI 525.60.11  ...  1000MiB / 8000MiB  ...";
        let s = sample(out, SIGNATURE, &pattern()).unwrap();
        assert_eq!(s.headroom_mib(), 7000);
        assert!(s.is_acceptable(3000));
    }

    #[test]
    fn scenario_b_busy_device() {
        let out = "NVIDIA-SMI 525.60.11  ...  7500MiB / 8000MiB  ...";
        let s = sample(out, SIGNATURE, &pattern()).unwrap();
        assert_eq!(s.headroom_mib(), 500);
        assert!(!s.is_acceptable(3000));
    }

    #[test]
    fn display_shows_free_memory() {
        let s = MemorySample {
            used_mib: 1000,
            total_mib: 8000,
        };
        assert_eq!(s.to_string(), "1000MiB / 8000MiB (7000MiB free)");
    }
}
