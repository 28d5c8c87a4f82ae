//! A/B testing of prompt versions.
//!
//! An experiment pits two versions of one prompt key against each other.
//! Callers are split by session: the arm is a pure function of
//! `(prompt_key, session_id)`, so a returning session always lands on the
//! same wording no matter which instance serves it. Outcomes arrive through
//! user feedback and accumulate per arm until the target sample size is
//! reached, after which new sessions fall back to the active version.
//!
//! Experiment state lives in the [`ConfigStore`] under `ab_test:{key}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::config::ConfigStore;
use crate::error::{AiError, Result};
use crate::prompts::{PromptManager, PromptVersion};

const AB_TEST_PREFIX: &str = "ab_test:";

// ============================================================================
// Experiment model
// ============================================================================

/// Which side of an experiment a session is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentArm {
    A,
    B,
}

impl ExperimentArm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentArm::A => "a",
            ExperimentArm::B => "b",
        }
    }
}

impl FromStr for ExperimentArm {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "a" | "A" => Ok(ExperimentArm::A),
            "b" | "B" => Ok(ExperimentArm::B),
            other => Err(AiError::InvalidInput(format!(
                "unknown experiment arm '{other}'"
            ))),
        }
    }
}

/// Feedback tallies for one arm.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ArmStats {
    pub samples: u32,
    pub helpful: u32,
}

impl ArmStats {
    pub fn helpful_ratio(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            f64::from(self.helpful) / f64::from(self.samples)
        }
    }
}

/// A running comparison between two versions of one prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ABTest {
    pub prompt_key: String,
    pub version_a: u32,
    pub version_b: u32,
    /// Combined sample count at which the experiment stops assigning.
    pub target_sample_size: u32,
    pub arm_a: ArmStats,
    pub arm_b: ArmStats,
    pub created_at: DateTime<Utc>,
}

impl ABTest {
    pub fn total_samples(&self) -> u32 {
        self.arm_a.samples + self.arm_b.samples
    }

    /// True once enough outcomes have been collected.
    pub fn is_complete(&self) -> bool {
        self.total_samples() >= self.target_sample_size
    }

    fn version_for(&self, arm: ExperimentArm) -> u32 {
        match arm {
            ExperimentArm::A => self.version_a,
            ExperimentArm::B => self.version_b,
        }
    }

    fn stats_mut(&mut self, arm: ExperimentArm) -> &mut ArmStats {
        match arm {
            ExperimentArm::A => &mut self.arm_a,
            ExperimentArm::B => &mut self.arm_b,
        }
    }
}

/// The prompt version a session was assigned by a running experiment.
#[derive(Debug, Clone)]
pub struct ArmAssignment {
    pub arm: ExperimentArm,
    pub version: PromptVersion,
}

/// Deterministic arm split. FNV-1a over `key:session` keeps assignments
/// stable across processes and restarts, which `DefaultHasher` does not
/// guarantee.
fn arm_for(prompt_key: &str, session_id: &str) -> ExperimentArm {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    let bytes = prompt_key
        .as_bytes()
        .iter()
        .chain(b":".iter())
        .chain(session_id.as_bytes().iter());
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    if hash % 2 == 0 {
        ExperimentArm::A
    } else {
        ExperimentArm::B
    }
}

// ============================================================================
// Experiment manager
// ============================================================================

/// Creates experiments, assigns arms and accumulates outcomes.
#[derive(Clone)]
pub struct ExperimentManager {
    config: Arc<dyn ConfigStore>,
    prompts: PromptManager,
}

impl ExperimentManager {
    pub fn new(config: Arc<dyn ConfigStore>, prompts: PromptManager) -> Self {
        Self { config, prompts }
    }

    /// Start an experiment on `prompt_key`. The two versions must differ
    /// and both must exist; one experiment per key, creating again
    /// replaces it.
    pub async fn create_test(
        &self,
        prompt_key: &str,
        version_a: u32,
        version_b: u32,
        target_sample_size: u32,
    ) -> Result<ABTest> {
        if version_a == version_b {
            return Err(AiError::InvalidInput(format!(
                "experiment arms must differ, both are version {version_a}"
            )));
        }
        if target_sample_size == 0 {
            return Err(AiError::InvalidInput(
                "target sample size must be positive".into(),
            ));
        }
        for version in [version_a, version_b] {
            if self.prompts.version(prompt_key, version).await?.is_none() {
                return Err(AiError::NotFound(format!(
                    "prompt '{prompt_key}' has no version {version}"
                )));
            }
        }

        let test = ABTest {
            prompt_key: prompt_key.to_string(),
            version_a,
            version_b,
            target_sample_size,
            arm_a: ArmStats::default(),
            arm_b: ArmStats::default(),
            created_at: Utc::now(),
        };
        self.save(&test).await?;
        Ok(test)
    }

    /// The experiment on `prompt_key`, if one exists.
    pub async fn test_for(&self, prompt_key: &str) -> Result<Option<ABTest>> {
        match self.config.get(&config_key(prompt_key)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Assign `session_id` to an arm of the experiment on `prompt_key`.
    ///
    /// `Ok(None)` when there is no experiment or it has finished; callers
    /// then use the active prompt version.
    pub async fn assignment(
        &self,
        prompt_key: &str,
        session_id: &str,
    ) -> Result<Option<ArmAssignment>> {
        let test = match self.test_for(prompt_key).await? {
            Some(test) if !test.is_complete() => test,
            _ => return Ok(None),
        };

        let arm = arm_for(prompt_key, session_id);
        let version_number = test.version_for(arm);
        match self.prompts.version(prompt_key, version_number).await? {
            Some(version) => Ok(Some(ArmAssignment { arm, version })),
            None => {
                // Versions are append-only, so this means the store lost
                // data; pause the experiment rather than fail the call.
                warn!(
                    prompt_key,
                    version = version_number,
                    "experiment references a missing prompt version"
                );
                Ok(None)
            }
        }
    }

    /// Record one feedback outcome for an arm.
    pub async fn record_outcome(
        &self,
        prompt_key: &str,
        arm: ExperimentArm,
        helpful: bool,
    ) -> Result<()> {
        let mut test = self.test_for(prompt_key).await?.ok_or_else(|| {
            AiError::NotFound(format!("no experiment for prompt '{prompt_key}'"))
        })?;

        let stats = test.stats_mut(arm);
        stats.samples += 1;
        if helpful {
            stats.helpful += 1;
        }
        self.save(&test).await
    }

    /// All stored experiments.
    pub async fn list_tests(&self) -> Result<Vec<ABTest>> {
        let mut tests = Vec::new();
        for key in self.config.keys_with_prefix(AB_TEST_PREFIX).await? {
            if let Some(value) = self.config.get(&key).await? {
                tests.push(serde_json::from_value(value)?);
            }
        }
        Ok(tests)
    }

    async fn save(&self, test: &ABTest) -> Result<()> {
        self.config
            .set(&config_key(&test.prompt_key), serde_json::to_value(test)?)
            .await
    }
}

fn config_key(prompt_key: &str) -> String {
    format!("{AB_TEST_PREFIX}{prompt_key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use crate::prompts::MemoryPromptStore;

    async fn manager_with_versions(n: u32) -> ExperimentManager {
        let prompts = PromptManager::new(Arc::new(MemoryPromptStore::new()));
        for i in 0..n {
            prompts
                .create_version("ask_system", &format!("wording {i}"))
                .await
                .unwrap();
        }
        ExperimentManager::new(Arc::new(MemoryConfigStore::new()), prompts)
    }

    #[tokio::test]
    async fn test_create_rejects_identical_arms() {
        let manager = manager_with_versions(2).await;
        let err = manager
            .create_test("ask_system", 1, 1, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_missing_versions() {
        let manager = manager_with_versions(1).await;
        let err = manager
            .create_test("ask_system", 1, 7, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_zero_target() {
        let manager = manager_with_versions(2).await;
        let err = manager
            .create_test("ask_system", 1, 2, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_create_persists_and_reads_back() {
        let manager = manager_with_versions(2).await;
        manager.create_test("ask_system", 1, 2, 100).await.unwrap();

        let test = manager.test_for("ask_system").await.unwrap().unwrap();
        assert_eq!(test.version_a, 1);
        assert_eq!(test.version_b, 2);
        assert_eq!(test.target_sample_size, 100);
        assert_eq!(test.total_samples(), 0);
    }

    #[tokio::test]
    async fn test_assignment_is_deterministic_per_session() {
        let manager = manager_with_versions(2).await;
        manager.create_test("ask_system", 1, 2, 100).await.unwrap();

        let first = manager
            .assignment("ask_system", "session-42")
            .await
            .unwrap()
            .unwrap();
        for _ in 0..10 {
            let again = manager
                .assignment("ask_system", "session-42")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(again.arm, first.arm);
            assert_eq!(again.version.version, first.version.version);
        }
    }

    #[tokio::test]
    async fn test_assignment_spreads_sessions_across_arms() {
        let manager = manager_with_versions(2).await;
        manager.create_test("ask_system", 1, 2, 1000).await.unwrap();

        let mut saw_a = false;
        let mut saw_b = false;
        for i in 0..100 {
            let assignment = manager
                .assignment("ask_system", &format!("session-{i}"))
                .await
                .unwrap()
                .unwrap();
            match assignment.arm {
                ExperimentArm::A => saw_a = true,
                ExperimentArm::B => saw_b = true,
            }
        }
        assert!(saw_a && saw_b, "hash split never reached one of the arms");
    }

    #[tokio::test]
    async fn test_assignment_none_without_experiment() {
        let manager = manager_with_versions(2).await;
        assert!(manager
            .assignment("ask_system", "s")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_assignment_stops_when_complete() {
        let manager = manager_with_versions(2).await;
        manager.create_test("ask_system", 1, 2, 2).await.unwrap();

        manager
            .record_outcome("ask_system", ExperimentArm::A, true)
            .await
            .unwrap();
        manager
            .record_outcome("ask_system", ExperimentArm::B, false)
            .await
            .unwrap();

        let test = manager.test_for("ask_system").await.unwrap().unwrap();
        assert!(test.is_complete());
        assert!(manager
            .assignment("ask_system", "s")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_record_outcome_updates_the_right_arm() {
        let manager = manager_with_versions(2).await;
        manager.create_test("ask_system", 1, 2, 100).await.unwrap();

        manager
            .record_outcome("ask_system", ExperimentArm::A, true)
            .await
            .unwrap();
        manager
            .record_outcome("ask_system", ExperimentArm::A, false)
            .await
            .unwrap();
        manager
            .record_outcome("ask_system", ExperimentArm::B, true)
            .await
            .unwrap();

        let test = manager.test_for("ask_system").await.unwrap().unwrap();
        assert_eq!(test.arm_a.samples, 2);
        assert_eq!(test.arm_a.helpful, 1);
        assert_eq!(test.arm_b.samples, 1);
        assert_eq!(test.arm_b.helpful, 1);
        assert!((test.arm_a.helpful_ratio() - 0.5).abs() < 1e-9);
        assert!((test.arm_b.helpful_ratio() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_record_outcome_without_experiment_is_not_found() {
        let manager = manager_with_versions(2).await;
        let err = manager
            .record_outcome("ask_system", ExperimentArm::A, true)
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_tests() {
        let prompts = PromptManager::new(Arc::new(MemoryPromptStore::new()));
        for key in ["ask_system", "compare_system"] {
            prompts.create_version(key, "one").await.unwrap();
            prompts.create_version(key, "two").await.unwrap();
        }
        let manager = ExperimentManager::new(Arc::new(MemoryConfigStore::new()), prompts);

        manager.create_test("ask_system", 1, 2, 50).await.unwrap();
        manager.create_test("compare_system", 1, 2, 50).await.unwrap();

        let mut keys: Vec<String> = manager
            .list_tests()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.prompt_key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["ask_system", "compare_system"]);
    }

    #[test]
    fn test_arm_hash_is_stable() {
        let arm = arm_for("ask_system", "session-42");
        for _ in 0..100 {
            assert_eq!(arm_for("ask_system", "session-42"), arm);
        }
    }

    #[test]
    fn test_arm_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ExperimentArm::A).unwrap(), "\"a\"");
        assert_eq!("b".parse::<ExperimentArm>().unwrap(), ExperimentArm::B);
        assert!("c".parse::<ExperimentArm>().is_err());
    }

    #[test]
    fn test_empty_arm_ratio_is_zero() {
        assert_eq!(ArmStats::default().helpful_ratio(), 0.0);
    }
}
