/// Result of matching an image reference against the internal registry path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification<'a> {
    pub is_local: bool,
    /// Reference with the internal path stripped, or the whole reference when
    /// not local.
    pub relative_path: &'a str,
}

/// Decide whether `source` is hosted on the internal registry.
///
/// A reference is local iff `internal_path` is non-empty and a literal prefix
/// of it. An empty internal path never matches.
pub fn classify<'a>(source: &'a str, internal_path: &str) -> Classification<'a> {
    if internal_path.is_empty() {
        return Classification {
            is_local: false,
            relative_path: source,
        };
    }
    match source.strip_prefix(internal_path) {
        Some(relative_path) => Classification {
            is_local: true,
            relative_path,
        },
        None => Classification {
            is_local: false,
            relative_path: source,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_internal_prefix() {
        let c = classify("internal.reg/ns/app@sha256:aaa", "internal.reg");
        assert!(c.is_local);
        assert_eq!(c.relative_path, "/ns/app@sha256:aaa");
    }

    #[test]
    fn external_reference_is_whole() {
        let c = classify("quay.io/org/app:1.0", "internal.reg");
        assert!(!c.is_local);
        assert_eq!(c.relative_path, "quay.io/org/app:1.0");
    }

    #[test]
    fn empty_internal_path_is_never_local() {
        for source in ["", "internal.reg/ns/app", "/ns/app"] {
            let c = classify(source, "");
            assert!(!c.is_local, "{source} should not be local");
            assert_eq!(c.relative_path, source);
        }
    }

    #[test]
    fn literal_prefix_match_only() {
        // Matching is a plain prefix test, host boundaries are not checked.
        let c = classify("internal.registry/ns/app", "internal.reg");
        assert!(c.is_local);
        assert_eq!(c.relative_path, "istry/ns/app");

        let c = classify("mirror/internal.reg/ns/app", "internal.reg");
        assert!(!c.is_local);
    }

    #[test]
    fn classification_is_deterministic() {
        let a = classify("internal.reg:5000/ns/app:v1", "internal.reg:5000");
        let b = classify("internal.reg:5000/ns/app:v1", "internal.reg:5000");
        assert_eq!(a, b);
    }
}
