//! Schema migration pipeline for persisted job journals.
//!
//! Migrators operate on the raw parsed JSON tree before the strict model
//! parse. Each migrator declares a source and target version; the pipeline
//! chains them by linear lookup until the configured schema version is
//! reached.

use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

/// Error type for journal migrations. A journal that cannot be migrated is
/// irrecoverable and gets deleted by the composer.
#[derive(Debug, Error)]
#[error("Migration failed: {reason} (source version {source_version}, target version {target_version})")]
pub struct MigrationError {
    pub reason: String,
    pub source_version: u32,
    pub target_version: u32,
}

/// One migration step over the semi-structured journal tree.
pub trait JobDataMigrator: Send + Sync {
    fn source_version(&self) -> u32;
    fn target_version(&self) -> u32;
    fn migrate(&self, data: Value) -> Result<Value, MigrationError>;
}

/// Schema version embedded in a raw journal tree. Journals written before
/// versioning are treated as version 1.
pub fn schema_version_of(data: &Value) -> u32 {
    data.get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32
}

/// Ordered chain of migrators applied until the target version is reached.
pub struct MigrationPipeline {
    steps: Vec<Box<dyn JobDataMigrator>>,
    target_version: u32,
}

impl MigrationPipeline {
    /// Pipeline with all known migrators, targeting the configured version.
    pub fn new(target_version: u32) -> Self {
        Self {
            steps: vec![Box::new(V1ToV3Migrator)],
            target_version,
        }
    }

    /// Pipeline with an explicit step list.
    pub fn with_steps(steps: Vec<Box<dyn JobDataMigrator>>, target_version: u32) -> Self {
        Self {
            steps,
            target_version,
        }
    }

    pub fn target_version(&self) -> u32 {
        self.target_version
    }

    /// Apply migrators in sequence until the tree reaches the target version.
    ///
    /// A tree already at (or past) the target version passes through
    /// unchanged, which makes migration idempotent at the current version.
    pub fn apply(&self, mut data: Value) -> Result<Value, MigrationError> {
        let mut current = schema_version_of(&data);

        debug!(
            "Performing journal migration: current_version={} target_version={}",
            current, self.target_version
        );

        while current < self.target_version {
            let step = self.find_migrator(current).ok_or_else(|| MigrationError {
                reason: "No migrator found".to_string(),
                source_version: current,
                target_version: self.target_version,
            })?;

            debug!(
                "Migrating journal version: {} -> {}",
                step.source_version(),
                step.target_version()
            );
            data = step.migrate(data)?;

            let next = schema_version_of(&data);
            if next <= current {
                return Err(MigrationError {
                    reason: "Migrator did not advance the schema version".to_string(),
                    source_version: current,
                    target_version: self.target_version,
                });
            }
            current = next;
        }

        Ok(data)
    }

    fn find_migrator(&self, version: u32) -> Option<&dyn JobDataMigrator> {
        self.steps
            .iter()
            .find(|step| step.source_version() == version)
            .map(|step| step.as_ref())
    }
}

/// v1 → v3: file sizes move from fractional megabytes to integer bytes
/// (`file_size_bytes = round(MB × 1 048 576)`), on the source video and on
/// every iteration.
pub struct V1ToV3Migrator;

impl V1ToV3Migrator {
    fn invalid(&self, reason: String) -> MigrationError {
        MigrationError {
            reason,
            source_version: self.source_version(),
            target_version: self.target_version(),
        }
    }

    fn migrate_file_attributes(&self, file_attributes: &mut Value) -> Result<(), MigrationError> {
        let object = file_attributes
            .as_object_mut()
            .ok_or_else(|| self.invalid("Model invalid: file_attributes is not an object".to_string()))?;

        let megabytes = object
            .remove("file_size_megabytes")
            .and_then(|value| value.as_f64())
            .unwrap_or(0.0);
        let bytes = (megabytes * 1_048_576.0).round() as u64;
        object.insert("file_size_bytes".to_string(), json!(bytes));
        Ok(())
    }
}

impl JobDataMigrator for V1ToV3Migrator {
    fn source_version(&self) -> u32 {
        1
    }

    fn target_version(&self) -> u32 {
        3
    }

    fn migrate(&self, mut data: Value) -> Result<Value, MigrationError> {
        let file_attributes = data
            .get_mut("source_video")
            .ok_or_else(|| self.invalid("Model invalid: missing source_video".to_string()))?
            .get_mut("file_attributes")
            .ok_or_else(|| self.invalid("Model invalid: missing source_video.file_attributes".to_string()))?;
        self.migrate_file_attributes(file_attributes)?;

        let iterations = data
            .get_mut("iterations")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| self.invalid("Model invalid: missing iterations".to_string()))?;
        for iteration in iterations.iter_mut() {
            let file_attributes = iteration
                .get_mut("file_attributes")
                .ok_or_else(|| self.invalid("Model invalid: iteration missing file_attributes".to_string()))?;
            self.migrate_file_attributes(file_attributes)?;
        }

        data["schema_version"] = json!(self.target_version());
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v1_journal() -> Value {
        json!({
            "schema_version": 1,
            "source_video": {
                "file_attributes": {
                    "file_name": "film.mp4",
                    "file_size_megabytes": 1.5
                },
                "sha256_hash": "abc123"
            },
            "encoding_stage": {
                "stage_number_from_1": 1,
                "stage_name": "job_prepared",
                "crf_range_min": 12,
                "crf_range_max": 36
            },
            "iterations": [
                {
                    "file_attributes": {
                        "file_name": "film_crf26.mp4",
                        "file_size_megabytes": 0.25
                    },
                    "sha256_hash": "def456"
                }
            ]
        })
    }

    #[test]
    fn test_v1_to_v3_converts_sizes() {
        let pipeline = MigrationPipeline::new(3);
        let migrated = pipeline.apply(v1_journal()).unwrap();

        assert_eq!(schema_version_of(&migrated), 3);
        assert_eq!(
            migrated["source_video"]["file_attributes"]["file_size_bytes"],
            json!(1_572_864u64)
        );
        assert_eq!(
            migrated["iterations"][0]["file_attributes"]["file_size_bytes"],
            json!(262_144u64)
        );
        // The megabyte field is rewritten away.
        assert!(migrated["source_video"]["file_attributes"]
            .get("file_size_megabytes")
            .is_none());
    }

    #[test]
    fn test_missing_megabytes_defaults_to_zero_bytes() {
        let mut journal = v1_journal();
        journal["source_video"]["file_attributes"]
            .as_object_mut()
            .unwrap()
            .remove("file_size_megabytes");

        let migrated = MigrationPipeline::new(3).apply(journal).unwrap();
        assert_eq!(
            migrated["source_video"]["file_attributes"]["file_size_bytes"],
            json!(0u64)
        );
    }

    #[test]
    fn test_journal_without_version_treated_as_v1() {
        let mut journal = v1_journal();
        journal.as_object_mut().unwrap().remove("schema_version");
        assert_eq!(schema_version_of(&journal), 1);

        let migrated = MigrationPipeline::new(3).apply(journal).unwrap();
        assert_eq!(schema_version_of(&migrated), 3);
    }

    #[test]
    fn test_current_version_passes_through_unchanged() {
        let journal = json!({
            "schema_version": 3,
            "source_video": {
                "file_attributes": { "file_name": "film.mp4", "file_size_bytes": 1048576 },
                "sha256_hash": "abc123"
            },
            "encoding_stage": {
                "stage_number_from_1": 1,
                "stage_name": "job_prepared",
                "crf_range_min": 12,
                "crf_range_max": 36
            },
            "iterations": []
        });

        let migrated = MigrationPipeline::new(3).apply(journal.clone()).unwrap();
        assert_eq!(migrated, journal);
    }

    #[test]
    fn test_migration_idempotent_at_current_version() {
        let pipeline = MigrationPipeline::new(3);
        let once = pipeline.apply(v1_journal()).unwrap();
        let twice = pipeline.apply(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_no_migrator_for_version_fails() {
        let journal = json!({ "schema_version": 2 });
        let err = MigrationPipeline::new(3).apply(journal).unwrap_err();
        assert!(err.reason.contains("No migrator found"));
        assert_eq!(err.source_version, 2);
        assert_eq!(err.target_version, 3);
    }

    #[test]
    fn test_invalid_model_fails() {
        let journal = json!({ "schema_version": 1, "iterations": [] });
        let err = MigrationPipeline::new(3).apply(journal).unwrap_err();
        assert!(err.reason.contains("missing source_video"));
    }

    struct StuckMigrator;

    impl JobDataMigrator for StuckMigrator {
        fn source_version(&self) -> u32 {
            1
        }
        fn target_version(&self) -> u32 {
            2
        }
        fn migrate(&self, data: Value) -> Result<Value, MigrationError> {
            // Forgets to bump schema_version.
            Ok(data)
        }
    }

    #[test]
    fn test_non_advancing_migrator_detected() {
        let pipeline = MigrationPipeline::with_steps(vec![Box::new(StuckMigrator)], 2);
        let err = pipeline.apply(json!({ "schema_version": 1 })).unwrap_err();
        assert!(err.reason.contains("did not advance"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Byte size law: file_size_bytes == round(MB * 1_048_576).
        #[test]
        fn prop_megabytes_to_bytes_rounding(megabytes in 0.0f64..100_000.0) {
            let mut journal = v1_journal();
            journal["source_video"]["file_attributes"]["file_size_megabytes"] = json!(megabytes);

            let migrated = MigrationPipeline::new(3).apply(journal).unwrap();
            let bytes = migrated["source_video"]["file_attributes"]["file_size_bytes"]
                .as_u64()
                .unwrap();
            prop_assert_eq!(bytes, (megabytes * 1_048_576.0).round() as u64);
        }
    }
}
