//! Database schema constants.
//!
//! SQLite schema for jobs, per-attempt stage records and artifact metadata.
//! Identifiers are stored as TEXT UUIDs, structured columns as JSON TEXT.

/// SQL schema for creating the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    business_name TEXT NOT NULL,
    input TEXT NOT NULL,
    status TEXT NOT NULL,
    current_stage TEXT,
    result_summary TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    terminal_at TEXT
)
"#;

/// SQL schema for creating the stage_records table.
///
/// One row per (job, stage, attempt). Attempt 0 is the placeholder row of a
/// stage whose first attempt has not started yet.
pub const CREATE_STAGE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stage_records (
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    stage_kind TEXT NOT NULL,
    attempt_count INTEGER NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    error TEXT,
    output_artifacts TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (job_id, stage_kind, attempt_count)
)
"#;

/// SQL schema for creating the artifacts table.
pub const CREATE_ARTIFACTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    stage_kind TEXT NOT NULL,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    created_at TEXT NOT NULL
)
"#;

pub const CREATE_JOBS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)";

pub const CREATE_JOBS_CREATED_AT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at)";

pub const CREATE_ARTIFACTS_JOB_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_artifacts_job_id ON artifacts(job_id)";

pub const CREATE_ARTIFACTS_CHECKSUM_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_artifacts_checksum ON artifacts(checksum)";

/// Returns all schema creation statements in dependency order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_JOBS_TABLE,
        CREATE_STAGE_RECORDS_TABLE,
        CREATE_ARTIFACTS_TABLE,
        CREATE_JOBS_STATUS_INDEX,
        CREATE_JOBS_CREATED_AT_INDEX,
        CREATE_ARTIFACTS_JOB_INDEX,
        CREATE_ARTIFACTS_CHECKSUM_INDEX,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_precede_indexes() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 7);
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS jobs"));
        assert!(statements[1].contains("REFERENCES jobs(id)"));
        assert!(statements[3..]
            .iter()
            .all(|s| s.starts_with("CREATE INDEX IF NOT EXISTS")));
    }
}
