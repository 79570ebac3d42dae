//! Canonical locations under the output root and the work directory.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ## Layout
//!
//! | Location | Owner | Purpose |
//! |----------|-------|---------|
//! | `<outdir>/pipeline_info/` | engine | Run summary, software versions, lock |
//! | `<outdir>/pipeline_info/runs/<id>/` | event store | `events.jsonl` per run |
//! | `<outdir>/<publish_to>/` | stages | Published artifacts |
//! | `<work>/<stage>/<key>/` | one stage | Private working directory |

use std::path::{Path, PathBuf};

/// Subdirectory of the output root holding engine metadata
pub const PIPELINE_INFO: &str = "pipeline_info";

/// Lock file name inside `pipeline_info/`
pub const LOCK_FILE: &str = ".lock";

/// Length of the cache-key prefix used in work directory names
pub const WORK_KEY_LEN: usize = 16;

/// `<outdir>/pipeline_info`
pub fn pipeline_info(outdir: &Path) -> PathBuf {
    outdir.join(PIPELINE_INFO)
}

/// `<outdir>/pipeline_info/runs`
pub fn runs_dir(outdir: &Path) -> PathBuf {
    pipeline_info(outdir).join("runs")
}

/// `<outdir>/pipeline_info/runs/<run_id>`
pub fn run_dir(outdir: &Path, run_id: &str) -> PathBuf {
    runs_dir(outdir).join(run_id)
}

/// `<outdir>/pipeline_info/.lock`
pub fn lock_file(outdir: &Path) -> PathBuf {
    pipeline_info(outdir).join(LOCK_FILE)
}

/// Plain-text run summary
pub fn report_txt(outdir: &Path) -> PathBuf {
    pipeline_info(outdir).join("pipeline_report.txt")
}

/// JSON run summary
pub fn report_json(outdir: &Path) -> PathBuf {
    pipeline_info(outdir).join("pipeline_report.json")
}

/// Private working directory of a stage: `<work>/<stage>/<key prefix>`
pub fn stage_work_dir(work_dir: &Path, stage: &str, cache_key: &str) -> PathBuf {
    let prefix = cache_key.get(..WORK_KEY_LEN).unwrap_or(cache_key);
    work_dir.join(stage).join(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_info_layout() {
        let out = Path::new("/results");
        assert_eq!(lock_file(out), PathBuf::from("/results/pipeline_info/.lock"));
        assert_eq!(
            run_dir(out, "abc"),
            PathBuf::from("/results/pipeline_info/runs/abc")
        );
        assert!(report_json(out).ends_with("pipeline_info/pipeline_report.json"));
    }

    #[test]
    fn test_stage_work_dir_truncates_key() {
        let dir = stage_work_dir(Path::new("/work"), "report", &"ab".repeat(32));
        assert_eq!(dir, PathBuf::from("/work/report/abababababababab"));

        let short = stage_work_dir(Path::new("/work"), "report", "abc");
        assert_eq!(short, PathBuf::from("/work/report/abc"));
    }
}
