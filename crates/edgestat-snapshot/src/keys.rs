//! Key layout of snapshot state in the KV store

/// Version number of the current snapshot
pub const LATEST: &str = "snapshot:latest";

/// Monotonic version sequence
pub const VERSION_SEQ: &str = "snapshot:version_seq";

/// Completed-batch counter driving periodic regeneration
pub const BATCH_COUNTER: &str = "snapshot:batch_counter";

/// Short-lived lock claimed by the instance that triggers a stale refresh
pub const REGEN_LOCK: &str = "snapshot:regen_lock";

const BODY_PREFIX: &str = "snapshot:v";
const META_PREFIX: &str = "snapshot:meta:v";

pub fn body(version: u64) -> String {
    format!("{}{}", BODY_PREFIX, version)
}

pub fn meta(version: u64) -> String {
    format!("{}{}", META_PREFIX, version)
}

pub fn body_prefix() -> &'static str {
    BODY_PREFIX
}

/// Version encoded in a body key. `snapshot:version_seq` shares the
/// prefix and is rejected here.
pub fn parse_body_version(key: &str) -> Option<u64> {
    key.strip_prefix(BODY_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_keys() {
        assert_eq!(body(7), "snapshot:v7");
        assert_eq!(meta(7), "snapshot:meta:v7");
        assert_eq!(parse_body_version("snapshot:v12"), Some(12));
        assert_eq!(parse_body_version(VERSION_SEQ), None);
        assert_eq!(parse_body_version("snapshot:meta:v3"), None);
    }
}
