//! Resource limits for evaluation containers.

use serde::{Deserialize, Serialize};

use crate::swe::RepoProfile;

/// Resource limits applied to a Docker environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0). Zero means unlimited.
    pub cpu_cores: f64,
    pub max_processes: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            memory_mb: 4096,
            cpu_cores: 2.0,
            max_processes: 1024,
        }
    }
}

impl ExecutionLimits {
    /// Defaults, with the profile's memory limit when it sets one.
    pub fn for_profile(profile: &RepoProfile) -> Self {
        let mut limits = Self::default();
        if let Some(memory_mb) = profile.memory_mb {
            limits.memory_mb = memory_mb;
        }
        limits
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// `period * cores`; 1.0 core = 100000.
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::frameworks::TestFramework;
    use crate::swe::RepoRef;

    #[test]
    fn test_quota_follows_cores() {
        let limits = ExecutionLimits {
            cpu_cores: 1.5,
            ..Default::default()
        };
        assert_eq!(limits.cpu_quota(), 150_000);
        assert_eq!(ExecutionLimits::default().memory_bytes(), 4096 * 1024 * 1024);
    }

    #[test]
    fn test_profile_memory_override() {
        let mut profile = RepoProfile::for_repo(&RepoRef::parse("o/r").unwrap(), TestFramework::Go);
        assert_eq!(ExecutionLimits::for_profile(&profile).memory_mb, 4096);
        profile.memory_mb = Some(512);
        assert_eq!(ExecutionLimits::for_profile(&profile).memory_mb, 512);
    }
}
