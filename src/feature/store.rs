use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::state_dir;
use crate::error::{OrchestratorError, Result};
use crate::feature::{Feature, FeatureStatus, PlanSpec};
use crate::persist::{read_json, write_atomic, write_json};

const FEATURES_DIR_NAME: &str = "features";
const FEATURE_FILE_NAME: &str = "feature.json";
const AGENT_OUTPUT_FILE_NAME: &str = "agent-output.md";

/// Attempts made by [`FeatureStore::update_plan_spec`] before accepting a
/// best-effort write.
pub const PLAN_WRITE_ATTEMPTS: u32 = 3;

/// A document carrying a monotonic version counter.
pub trait Versioned {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

/// Result of a versioned read-modify-write.
#[derive(Debug, Clone)]
pub struct VersionedWrite<T> {
    /// The document as last written.
    pub value: T,
    /// Number of write attempts made.
    pub attempts: u32,
    /// False when every attempt lost a race and the last write was kept
    /// as best effort.
    pub verified: bool,
}

/// Read-modify-write-then-verify on a versioned document.
///
/// Each attempt reads the current document, applies `mutate`, writes it
/// with the version bumped by one and re-reads to confirm the version is
/// the one just written. A mismatch means a racing writer got in between
/// and the attempt is retried from a fresh read.
pub fn versioned_update<T, R, W, M>(
    max_attempts: u32,
    mut read: R,
    mut write: W,
    mut mutate: M,
) -> Result<VersionedWrite<T>>
where
    T: Versioned,
    R: FnMut() -> Result<T>,
    W: FnMut(&T) -> Result<()>,
    M: FnMut(&mut T),
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut value = read()?;
        let next_version = value.version() + 1;
        mutate(&mut value);
        value.set_version(next_version);
        write(&value)?;

        let observed = read()?.version();
        if observed == next_version {
            return Ok(VersionedWrite {
                value,
                attempts: attempt,
                verified: true,
            });
        }

        if attempt >= max_attempts {
            warn!(
                attempts = attempt,
                expected = next_version,
                observed,
                "Versioned write lost a race on every attempt; keeping best-effort result"
            );
            return Ok(VersionedWrite {
                value,
                attempts: attempt,
                verified: false,
            });
        }
        debug!(
            attempt,
            expected = next_version,
            observed,
            "Versioned write lost a race, retrying"
        );
    }
}

/// File-backed feature store under `.featureloop/features/<id>/`.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    features_dir: PathBuf,
}

impl FeatureStore {
    /// Create a store for the given project root.
    pub fn new(project_root: &Path) -> Result<Self> {
        let features_dir = state_dir(project_root).join(FEATURES_DIR_NAME);
        fs::create_dir_all(&features_dir)?;
        Ok(Self { features_dir })
    }

    pub fn features_dir(&self) -> &Path {
        &self.features_dir
    }

    /// Load a feature, returning `None` if it does not exist.
    pub fn load(&self, feature_id: &str) -> Result<Option<Feature>> {
        let path = self.feature_path(feature_id)?;
        read_json(&path)
    }

    /// Load a feature or fail with `FeatureNotFound`.
    pub fn get(&self, feature_id: &str) -> Result<Feature> {
        self.load(feature_id)?
            .ok_or_else(|| OrchestratorError::FeatureNotFound(feature_id.to_string()))
    }

    /// Write the whole feature record.
    pub fn save(&self, feature: &Feature) -> Result<()> {
        let path = self.feature_path(&feature.id)?;
        write_json(&path, feature)
    }

    /// List every stored feature, ordered by creation time.
    pub fn list(&self) -> Result<Vec<Feature>> {
        let mut features = Vec::new();
        for entry in fs::read_dir(&self.features_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join(FEATURE_FILE_NAME);
            match read_json::<Feature>(&path) {
                Ok(Some(feature)) => features.push(feature),
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "Skipping unreadable feature"),
            }
        }
        features.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(features)
    }

    /// Apply a change to the stored feature and write it back.
    pub fn update<F>(&self, feature_id: &str, mutate: F) -> Result<Feature>
    where
        F: FnOnce(&mut Feature),
    {
        let mut feature = self.get(feature_id)?;
        mutate(&mut feature);
        feature.updated_at = Utc::now();
        self.save(&feature)?;
        Ok(feature)
    }

    /// Set the lifecycle status, clearing any stale error unless reverting
    /// to backlog.
    pub fn set_status(&self, feature_id: &str, status: FeatureStatus) -> Result<Feature> {
        debug!(feature_id, status = %status, "Updating feature status");
        self.update(feature_id, |feature| {
            if status != FeatureStatus::Backlog {
                feature.error = None;
            }
            feature.status = status;
        })
    }

    /// Revert to backlog and record the error that caused it.
    pub fn mark_failed(&self, feature_id: &str, error: &str) -> Result<Feature> {
        self.update(feature_id, |feature| {
            feature.status = FeatureStatus::Backlog;
            feature.error = Some(error.to_string());
        })
    }

    /// Update the embedded plan with lost-update detection.
    ///
    /// A missing plan starts from the default. Exhausting the retries is
    /// logged and accepted.
    pub fn update_plan_spec<F>(&self, feature_id: &str, mutate: F) -> Result<PlanSpec>
    where
        F: FnMut(&mut PlanSpec),
    {
        let outcome = versioned_update(
            PLAN_WRITE_ATTEMPTS,
            || Ok(self.get(feature_id)?.plan_spec.unwrap_or_default()),
            |plan: &PlanSpec| {
                self.update(feature_id, |feature| feature.plan_spec = Some(plan.clone()))
                    .map(|_| ())
            },
            mutate,
        )?;
        Ok(outcome.value)
    }

    /// Raw agent output saved for resume context.
    pub fn read_agent_output(&self, feature_id: &str) -> Result<Option<String>> {
        let path = self.agent_output_path(feature_id)?;
        match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether non-empty agent output exists for the feature.
    pub fn has_agent_output(&self, feature_id: &str) -> bool {
        matches!(self.read_agent_output(feature_id), Ok(Some(_)))
    }

    /// Overwrite the saved agent output.
    pub fn write_agent_output(&self, feature_id: &str, content: &str) -> Result<()> {
        let path = self.agent_output_path(feature_id)?;
        write_atomic(&path, content.as_bytes())?;
        Ok(())
    }

    /// Append to the saved agent output, on a new line if the existing
    /// output does not end with one.
    pub fn append_agent_output(&self, feature_id: &str, content: &str) -> Result<()> {
        self.append_output(feature_id, content, true)
    }

    /// Append streamed text exactly as received.
    pub fn append_agent_chunk(&self, feature_id: &str, chunk: &str) -> Result<()> {
        self.append_output(feature_id, chunk, false)
    }

    fn append_output(&self, feature_id: &str, content: &str, separate: bool) -> Result<()> {
        if content.is_empty() {
            return Ok(());
        }
        let path = self.agent_output_path(feature_id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if separate && file.metadata()?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                file.write_all(b"\n")?;
            }
        }
        file.write_all(content.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn feature_dir(&self, feature_id: &str) -> Result<PathBuf> {
        validate_feature_id(feature_id)?;
        Ok(self.features_dir.join(feature_id))
    }

    fn feature_path(&self, feature_id: &str) -> Result<PathBuf> {
        Ok(self.feature_dir(feature_id)?.join(FEATURE_FILE_NAME))
    }

    fn agent_output_path(&self, feature_id: &str) -> Result<PathBuf> {
        Ok(self.feature_dir(feature_id)?.join(AGENT_OUTPUT_FILE_NAME))
    }
}

fn validate_feature_id(feature_id: &str) -> Result<()> {
    let valid = !feature_id.trim().is_empty()
        && feature_id != "."
        && feature_id != ".."
        && !feature_id.contains(['/', '\\']);
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidFeatureId(feature_id.to_string()))
    }
}
