//! Unique names for per-run broker resources.

use uuid::Uuid;

/// Returns a fresh topic name. Never reused across runs.
#[must_use]
pub fn topic_name() -> String {
    Uuid::new_v4().to_string()
}

/// Returns a fresh consumer group identifier.
#[must_use]
pub fn group_name() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let a = topic_name();
        let b = topic_name();
        assert_ne!(a, b);
        assert_ne!(group_name(), group_name());
        assert_eq!(a.len(), 36);
    }
}
