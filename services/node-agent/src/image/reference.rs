//! Image reference parsing.

use std::fmt;

/// Scheme prefix the control plane puts in front of engine image names.
pub const DOCKER_SCHEME: &str = "docker:";

/// Tag used when a reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// A pullable `repo:tag` (or `repo@digest`) reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub repo: String,
    /// Tag, or the digest when `is_digest` is set.
    pub tag: String,
    pub is_digest: bool,
}

impl ImageReference {
    /// Parse a reference such as `docker:nginx:1.18`, `busybox` or
    /// `registry:5000/app@sha256:...`.
    ///
    /// Returns `None` for an empty reference.
    pub fn parse(reference: &str) -> Option<Self> {
        let reference = reference.trim();
        let reference = reference.strip_prefix(DOCKER_SCHEME).unwrap_or(reference);
        if reference.is_empty() {
            return None;
        }

        if let Some((repo, digest)) = reference.rsplit_once('@') {
            return Some(Self {
                repo: repo.to_string(),
                tag: digest.to_string(),
                is_digest: true,
            });
        }

        let (repo, tag) = match reference.rsplit_once(':') {
            // A colon before the last slash is a registry port, not a tag.
            Some((repo, tag)) if !tag.contains('/') && !tag.is_empty() => (repo, tag),
            _ => (reference, DEFAULT_TAG),
        };

        Some(Self {
            repo: repo.to_string(),
            tag: tag.to_string(),
            is_digest: false,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_digest {
            write!(f, "{}@{}", self.repo, self.tag)
        } else {
            write!(f, "{}:{}", self.repo, self.tag)
        }
    }
}
