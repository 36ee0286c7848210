use sha2::{Digest, Sha256};

const MAX_K8S_NAME_LENGTH: usize = 63;
const MAX_LABEL_VALUE_LENGTH: usize = 63;
const RUN_JOB_PREFIX: &str = "dagster-run-";
const STEP_JOB_PREFIX: &str = "dagster-step-";
const HASH_LENGTH: usize = 8;
const STEP_HASH_LENGTH: usize = 16;

pub struct ResourceNaming;

impl ResourceNaming {
    /// Job name for a run worker.
    /// Format: dagster-run-{run_id}[-{attempt}]
    ///
    /// Resume attempts are numbered from 1; attempt 0 or `None` names the
    /// original launch. Run ids that had to be rewritten or truncated are
    /// suffixed with a hash of the raw id so names stay unique per run.
    pub fn run_job_name(run_id: &str, resume_attempt: Option<u32>) -> String {
        let suffix = Self::attempt_suffix(resume_attempt);
        let available = MAX_K8S_NAME_LENGTH.saturating_sub(RUN_JOB_PREFIX.len() + suffix.len());
        let id = Self::unique_name_segment(run_id, available);

        format!("{RUN_JOB_PREFIX}{id}{suffix}")
    }

    /// Job name for a step worker.
    /// Format: dagster-step-{step_key}-{hash(run_id, step_key)}[-{attempt}]
    pub fn step_job_name(run_id: &str, step_key: &str, retry_attempt: Option<u32>) -> String {
        let suffix = Self::attempt_suffix(retry_attempt);
        let hash = Self::hash_string(&format!("{run_id}:{step_key}"), STEP_HASH_LENGTH);
        let available = MAX_K8S_NAME_LENGTH
            .saturating_sub(STEP_JOB_PREFIX.len() + hash.len() + 1 + suffix.len());

        let step = Self::sanitize_name_segment(step_key);
        let step: String = step.chars().take(available).collect();
        let step = step.trim_end_matches('-');

        if step.is_empty() {
            format!("{STEP_JOB_PREFIX}{hash}{suffix}")
        } else {
            format!("{STEP_JOB_PREFIX}{step}-{hash}{suffix}")
        }
    }

    /// Make a value usable as a Kubernetes label value.
    pub fn sanitize_label_value(input: &str) -> String {
        if input.is_empty() {
            return String::new();
        }

        let mut sanitized: String = input
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        // Truncate to 63 characters (Kubernetes label limit)
        sanitized.truncate(MAX_LABEL_VALUE_LENGTH);

        // Must start and end with alphanumeric
        sanitized
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_string()
    }

    fn attempt_suffix(attempt: Option<u32>) -> String {
        match attempt {
            Some(n) if n > 0 => format!("-{n}"),
            _ => String::new(),
        }
    }

    /// Lowercase DNS-1123 segment: alphanumerics and hyphens only.
    fn sanitize_name_segment(input: &str) -> String {
        let mut segment = String::with_capacity(input.len());
        for c in input.chars() {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() {
                segment.push(c);
            } else if !segment.ends_with('-') {
                segment.push('-');
            }
        }
        segment.trim_matches('-').to_string()
    }

    /// Sanitized `raw`, or its sanitized head plus a hash of `raw` when
    /// sanitizing changed it or it exceeds `limit`.
    fn unique_name_segment(raw: &str, limit: usize) -> String {
        let sanitized = Self::sanitize_name_segment(raw);
        if sanitized == raw && sanitized.len() <= limit {
            return sanitized;
        }

        let hash = Self::hash_string(raw, HASH_LENGTH);
        let keep = limit.saturating_sub(hash.len() + 1);
        let head: String = sanitized.chars().take(keep).collect();
        let head = head.trim_end_matches('-');
        if head.is_empty() {
            hash
        } else {
            format!("{head}-{hash}")
        }
    }

    fn hash_string(input: &str, len: usize) -> String {
        let digest = hex::encode(Sha256::digest(input.as_bytes()));
        digest[..len].to_string()
    }
}
