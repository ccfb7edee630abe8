//! Job validator: decides whether a loaded job can be processed or resumed.
//!
//! In-progress stages and safe-error terminals are always resumable. The
//! successful terminals (CRF_FOUND, COMPLETED) additionally require the
//! chosen iteration to be recorded and its output file to still exist.

use crate::model::{EncoderJob, EncodingStageName};
use firefly_config::AppConfig;
use tracing::error;

/// Validate a composed job against its on-disk reality.
pub fn validate_job(job: &EncoderJob, config: &AppConfig) -> bool {
    if !job.source_file_path.is_file() {
        error!(
            "Source file does not exist: {}",
            job.source_file_path.display()
        );
        return false;
    }
    if !job.metadata_json_file_path.is_file() {
        error!(
            "Journal file does not exist: {}",
            job.metadata_json_file_path.display()
        );
        return false;
    }

    match job.stage_name() {
        EncodingStageName::Prepared
        | EncodingStageName::MetadataExtracted
        | EncodingStageName::SearchingCrf => true,

        EncodingStageName::StoppedVmafDelta
        | EncodingStageName::UnreachableVmaf
        | EncodingStageName::SkippedIsHdrVideo => true,

        EncodingStageName::CrfFound | EncodingStageName::Completed => {
            let Some(best_iteration) = job.job_data.final_iteration() else {
                error!(
                    "No final iteration recorded for job: {}",
                    job.metadata_json_file_path.display()
                );
                return false;
            };

            let best_file_path = config
                .output_dir
                .join(&best_iteration.file_attributes.file_name);
            if !best_file_path.is_file() {
                error!(
                    "Final encoded file does not exist: {}",
                    best_file_path.display()
                );
                return false;
            }
            true
        }

        EncodingStageName::Failed => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::{make_iteration, make_job_data};
    use crate::model::{EncoderJob, EncodingStage};
    use firefly_config::{EncoderPreset, ProcessPriority};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn make_config(input_dir: PathBuf, output_dir: PathBuf) -> AppConfig {
        AppConfig {
            input_dir,
            output_dir,
            randomize_threads_count: false,
            threads_count: 4,
            disable_resources_monitoring: true,
            low_resources_restart_delay_seconds: 0.5,
            encoder_process_priority: ProcessPriority::Normal,
            vmaf_process_priority: ProcessPriority::Normal,
            ram_monitoring_interval_seconds: 2.0,
            ram_percent_hard_limit: 85.0,
            ram_hard_limit_bytes: 500 * 1024 * 1024,
            crf_min: 12,
            crf_max: 36,
            initial_crf: 26,
            vmaf_min: 96.0,
            vmaf_max: 97.0,
            efficiency_threshold: 0.28,
            encoder_preset: EncoderPreset::Veryslow,
            vmaf_models_dir: PathBuf::from("vmaf_models"),
        }
    }

    struct Fixture {
        _tmp: TempDir,
        config: AppConfig,
        job: EncoderJob,
    }

    fn make_fixture(stage_name: EncodingStageName) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("input");
        let output = tmp.path().join("output");
        fs::create_dir_all(&input).unwrap();
        fs::create_dir_all(&output).unwrap();

        let source = input.join("film.mp4");
        fs::write(&source, b"payload").unwrap();
        let journal = output.join("film_encoderdata.json");
        fs::write(&journal, b"{}").unwrap();

        let mut job_data = make_job_data("film.mp4", "hash");
        job_data.encoding_stage = EncodingStage::new(stage_name, 12, 36);
        let job = EncoderJob::new(source, journal, job_data);

        Fixture {
            _tmp: tmp,
            config: make_config(input, output),
            job,
        }
    }

    #[test]
    fn test_in_progress_stages_valid() {
        for stage in [
            EncodingStageName::Prepared,
            EncodingStageName::MetadataExtracted,
            EncodingStageName::SearchingCrf,
        ] {
            let fixture = make_fixture(stage);
            assert!(validate_job(&fixture.job, &fixture.config), "{} should be valid", stage);
        }
    }

    #[test]
    fn test_safe_error_stages_valid() {
        for stage in [
            EncodingStageName::StoppedVmafDelta,
            EncodingStageName::UnreachableVmaf,
            EncodingStageName::SkippedIsHdrVideo,
        ] {
            let fixture = make_fixture(stage);
            assert!(validate_job(&fixture.job, &fixture.config), "{} should be valid", stage);
        }
    }

    #[test]
    fn test_failed_stage_invalid() {
        let fixture = make_fixture(EncodingStageName::Failed);
        assert!(!validate_job(&fixture.job, &fixture.config));
    }

    #[test]
    fn test_missing_source_invalid() {
        let fixture = make_fixture(EncodingStageName::Prepared);
        fs::remove_file(&fixture.job.source_file_path).unwrap();
        assert!(!validate_job(&fixture.job, &fixture.config));
    }

    #[test]
    fn test_missing_journal_invalid() {
        let fixture = make_fixture(EncodingStageName::Prepared);
        fs::remove_file(&fixture.job.metadata_json_file_path).unwrap();
        assert!(!validate_job(&fixture.job, &fixture.config));
    }

    #[test]
    fn test_crf_found_requires_final_iteration() {
        let mut fixture = make_fixture(EncodingStageName::CrfFound);
        fixture.job.job_data.encoding_stage = EncodingStage::new(EncodingStageName::CrfFound, 26, 26)
            .with_last(Some(26), Some(96.4));

        // No iteration recorded at the chosen CRF.
        assert!(!validate_job(&fixture.job, &fixture.config));
    }

    #[test]
    fn test_crf_found_requires_output_on_disk() {
        let mut fixture = make_fixture(EncodingStageName::CrfFound);
        fixture.job.job_data.encoding_stage = EncodingStage::new(EncodingStageName::CrfFound, 26, 26)
            .with_last(Some(26), Some(96.4));
        fixture
            .job
            .job_data
            .iterations
            .push(make_iteration("film_libx265_veryslow_crf_26.mp4", 26, 96.4));

        // Output missing from disk.
        assert!(!validate_job(&fixture.job, &fixture.config));

        // Output present: the job is valid.
        fs::write(
            fixture.config.output_dir.join("film_libx265_veryslow_crf_26.mp4"),
            b"encoded",
        )
        .unwrap();
        assert!(validate_job(&fixture.job, &fixture.config));
    }

    #[test]
    fn test_completed_requires_matching_vmaf() {
        let mut fixture = make_fixture(EncodingStageName::Completed);
        fixture.job.job_data.encoding_stage =
            EncodingStage::new(EncodingStageName::Completed, 26, 26).with_last(Some(26), Some(96.4));
        // The recorded iteration has a different VMAF than last_vmaf.
        fixture
            .job
            .job_data
            .iterations
            .push(make_iteration("film_libx265_veryslow_crf_26.mp4", 26, 95.0));
        fs::write(
            fixture.config.output_dir.join("film_libx265_veryslow_crf_26.mp4"),
            b"encoded",
        )
        .unwrap();

        assert!(!validate_job(&fixture.job, &fixture.config));
    }
}
