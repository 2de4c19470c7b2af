//! Static exercise registry: exercise id to backing repository and release tag.
//!
//! Read-only external data. Exercises are published as GitHub releases of
//! their own repositories; the workspace pipeline downloads the tagged
//! archive on first use.

/// One registered exercise.
#[derive(Debug, Clone, Copy)]
pub struct Exercise {
    pub id: &'static str,
    /// GitHub repository in `owner/name` form.
    pub repo: &'static str,
    /// Release tag whose archive backs this exercise.
    pub tag: &'static str,
}

const EXERCISES: &[Exercise] = &[
    Exercise {
        id: "getting-started",
        repo: "termlab-exercises/getting-started",
        tag: "v1.2.0",
    },
    Exercise {
        id: "refactoring-legacy-code",
        repo: "termlab-exercises/refactoring-legacy-code",
        tag: "v1.0.3",
    },
    Exercise {
        id: "test-driven-fixes",
        repo: "termlab-exercises/test-driven-fixes",
        tag: "v2.1.0",
    },
    Exercise {
        id: "debugging-deep-dive",
        repo: "termlab-exercises/debugging-deep-dive",
        tag: "v1.1.1",
    },
];

/// Look up an exercise by id.
pub fn lookup(id: &str) -> Option<&'static Exercise> {
    EXERCISES.iter().find(|e| e.id == id)
}

/// Base URL of the release-archive API host. Overridable for mirrors.
pub fn release_api_base() -> String {
    std::env::var("TERMLAB_RELEASE_HOST")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "https://api.github.com".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_registered_exercises() {
        let ex = lookup("getting-started").unwrap();
        assert_eq!(ex.repo, "termlab-exercises/getting-started");
        assert_eq!(ex.tag, "v1.2.0");
    }

    #[test]
    fn lookup_misses_unknown_ids() {
        assert!(lookup("no-such-exercise").is_none());
        assert!(lookup("").is_none());
    }
}
