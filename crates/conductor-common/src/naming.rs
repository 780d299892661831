// Naming helpers for generated cluster objects: job-name sanitization, the
// short job-name hash exposed to steps, and volume-name mangling.

use sha2::{Digest, Sha256};

/// Length of the short job-name hash exposed as `JOB_NAME_HASH`.
const JOB_NAME_HASH_LEN: usize = 10;

/// Replace underscores so a job name is usable in DNS-1123 contexts.
pub fn sanitize_job_name(name: &str) -> String {
    name.replace('_', "-")
}

/// Short, stable hash of a job name, exposed to steps as `JOB_NAME_HASH` so
/// they can derive unique-but-reproducible resource names.
pub fn job_name_hash(job_name: &str) -> String {
    let digest = Sha256::digest(job_name.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(JOB_NAME_HASH_LEN);
    hash
}

/// Volume name for a secret imported from another namespace. Dots are not
/// allowed in volume names, so they are replaced with dashes.
pub fn volume_name(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}").replace('.', "-")
}

/// Name for an object that exists once per test, e.g. the per-test copy of a
/// claim credential secret.
pub fn per_test_object_name(base: &str, test_name: &str) -> String {
    format!("{base}-{test_name}")
}
