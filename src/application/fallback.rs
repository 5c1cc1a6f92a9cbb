//! Last-resort resolution against the full resource catalog.

use std::sync::Arc;

use tracing::debug;

use crate::application::repos::{CatalogRepo, RepoError};
use crate::domain::entities::Identity;
use crate::domain::keys::LookupKey;

const SOURCE: &str = "application::fallback";

pub struct FallbackResolver {
    catalog: Arc<dyn CatalogRepo>,
    enabled: bool,
}

impl FallbackResolver {
    pub fn new(catalog: Arc<dyn CatalogRepo>, enabled: bool) -> Self {
        Self { catalog, enabled }
    }

    /// Query the catalog for `key` or a less specific spelling of it.
    ///
    /// The most specific candidate that matches wins; equal candidates resolve to the lowest
    /// identity so repeated calls agree.
    pub async fn find(&self, key: &LookupKey) -> Result<Option<Identity>, RepoError> {
        if !self.enabled {
            return Ok(None);
        }

        let candidates = candidate_paths(key.as_str());
        let matches = self.catalog.find_by_paths(&candidates).await?;

        let best = candidates.iter().find_map(|candidate| {
            matches
                .iter()
                .filter(|found| &found.path == candidate)
                .map(|found| found.identity)
                .min()
        });

        debug!(
            target = SOURCE,
            key = %key,
            candidates = candidates.len(),
            matched = best.is_some(),
            "catalog fallback queried"
        );
        Ok(best)
    }
}

/// Spellings a catalog might store for `key`, most specific first.
///
/// Resized variants (`photo-300x200.jpg`) also try the original file, and every spelling is
/// retried with leading directories removed so site-prefixed URLs still match.
pub(crate) fn candidate_paths(key: &str) -> Vec<String> {
    let mut bases = vec![key.to_string()];
    if let Some(original) = strip_size_suffix(key) {
        bases.push(original);
    }

    let mut candidates: Vec<String> = Vec::new();
    for base in &bases {
        let mut rest = base.as_str();
        loop {
            if !rest.is_empty() && !candidates.iter().any(|c| c == rest) {
                candidates.push(rest.to_string());
            }
            match rest.split_once('/') {
                Some((_, tail)) if tail.contains('/') => rest = tail,
                _ => break,
            }
        }
    }
    candidates
}

fn strip_size_suffix(key: &str) -> Option<String> {
    let (dir, file) = match key.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, key),
    };
    let (stem, ext) = file.rsplit_once('.')?;
    let (base, size) = stem.rsplit_once('-')?;
    let (width, height) = size.split_once('x')?;
    let numeric = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    if base.is_empty() || !numeric(width) || !numeric(height) {
        return None;
    }

    let original = format!("{base}.{ext}");
    Some(match dir {
        Some(dir) => format!("{dir}/{original}"),
        None => original,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_walk_from_specific_to_general() {
        assert_eq!(
            candidate_paths("site/uploads/2024/a.jpg"),
            vec!["site/uploads/2024/a.jpg", "uploads/2024/a.jpg", "2024/a.jpg"]
        );
        assert_eq!(candidate_paths("a.jpg"), vec!["a.jpg"]);
    }

    #[test]
    fn resized_variants_fall_back_to_original() {
        assert_eq!(
            candidate_paths("uploads/photo-300x200.jpg"),
            vec!["uploads/photo-300x200.jpg", "uploads/photo.jpg"]
        );
        assert_eq!(strip_size_suffix("uploads/photo-final.jpg"), None);
        assert_eq!(strip_size_suffix("uploads/-1x1.jpg"), None);
        assert_eq!(strip_size_suffix("x-10x.jpg"), None);
    }
}
