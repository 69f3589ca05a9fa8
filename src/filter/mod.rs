//! Declarative predicate + sort + limit applied to a file list at query
//! time.
//!
//! Glob-based include/exclude over a `GlobSet`, plus extension/type-group,
//! age, depth, sort and limit predicates.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Size,
    ModTime,
    Path,
}

/// One candidate record the filter operates over — independent of the
/// storage representation (`LargeFileRecord`) and the wire representation
/// (`FileInfo`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: String,
    pub size: i64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub limit: usize,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub extensions: Vec<String>,
    pub type_groups: Vec<String>,
    pub older_than_s: Option<i64>,
    pub newer_than_s: Option<i64>,
    pub max_depth: Option<usize>,
    pub sort_by: Option<SortBy>,
    pub sort_descending: bool,
}

/// Static extension groups; raw `extensions` are ignored whenever a
/// `type_groups` entry names a group — groups take precedence over raw
/// extensions.
fn type_group_extensions(group: &str) -> &'static [&'static str] {
    match group {
        "images" => &["png", "jpg", "jpeg", "gif", "bmp", "webp", "svg", "ico"],
        "archives" => &["zip", "tar", "gz", "bz2", "xz", "7z", "rar"],
        "documents" => &["pdf", "doc", "docx", "ppt", "pptx", "xls", "xlsx", "odt"],
        "video" => &["mp4", "mov", "mkv", "avi", "webm"],
        "audio" => &["mp3", "wav", "flac", "ogg", "m4a"],
        _ => &[],
    }
}

pub struct Filter {
    opts: FilterOptions,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
    extensions: Vec<String>,
    now: i64,
}

impl Filter {
    pub fn new(opts: FilterOptions) -> Result<Self, globset::Error> {
        let include = build_globset(&opts.include)?;
        let exclude = build_globset(&opts.exclude)?;

        let extensions = if !opts.type_groups.is_empty() {
            opts.type_groups
                .iter()
                .flat_map(|g| type_group_extensions(g).iter().map(|s| s.to_string()))
                .collect()
        } else {
            opts.extensions.clone()
        };

        Ok(Self {
            opts,
            include,
            exclude,
            extensions,
            now: now_secs(),
        })
    }

    /// Applies the predicate, sorts, then truncates to `limit`. Pure and
    /// idempotent — running it twice on the same input is a no-op on the
    /// second pass.
    pub fn apply(&self, root: &str, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        candidates.retain(|c| self.matches(root, c));

        if let Some(sort_by) = self.opts.sort_by {
            candidates.sort_by(|a, b| {
                let ord = match sort_by {
                    SortBy::Size => a.size.cmp(&b.size),
                    SortBy::ModTime => a.mtime.cmp(&b.mtime),
                    SortBy::Path => a.path.cmp(&b.path),
                };
                if self.opts.sort_descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        if self.opts.limit > 0 {
            candidates.truncate(self.opts.limit);
        }
        candidates
    }

    fn matches(&self, root: &str, candidate: &Candidate) -> bool {
        let basename = crate::model::basename(&candidate.path);

        if let Some(set) = &self.include {
            if !set.is_match(basename) && !set.is_match(&candidate.path) {
                return false;
            }
        }
        if let Some(set) = &self.exclude {
            if set.is_match(basename) || set.is_match(&candidate.path) {
                return false;
            }
        }

        if !self.extensions.is_empty() {
            let ext = std::path::Path::new(&candidate.path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            if !self.extensions.iter().any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
            {
                return false;
            }
        }

        if let Some(older_than_s) = self.opts.older_than_s {
            if self.now - candidate.mtime < older_than_s {
                return false;
            }
        }
        if let Some(newer_than_s) = self.opts.newer_than_s {
            if self.now - candidate.mtime > newer_than_s {
                return false;
            }
        }

        if let Some(max_depth) = self.opts.max_depth {
            let rel = candidate.path.strip_prefix(root).unwrap_or(&candidate.path);
            let depth = rel
                .trim_start_matches(crate::model::SEPARATOR)
                .matches(crate::model::SEPARATOR)
                .count();
            if depth > max_depth {
                return false;
            }
        }

        true
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>, globset::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(path: &str, size: i64) -> Candidate {
        Candidate {
            path: path.to_string(),
            size,
            mtime: 0,
        }
    }

    #[test]
    fn sorts_by_size_descending_and_truncates() {
        let filter = Filter::new(FilterOptions {
            limit: 2,
            sort_by: Some(SortBy::Size),
            sort_descending: true,
            ..Default::default()
        })
        .unwrap();

        let result = filter.apply(
            "/tmp/T",
            vec![
                candidate("/tmp/T/a", 100),
                candidate("/tmp/T/b", 100_000),
                candidate("/tmp/T/c", 10_000),
            ],
        );

        assert_eq!(
            result.iter().map(|c| c.size).collect::<Vec<_>>(),
            vec![100_000, 10_000]
        );
    }

    #[test]
    fn type_groups_take_precedence_over_raw_extensions() {
        let filter = Filter::new(FilterOptions {
            extensions: vec!["rs".to_string()],
            type_groups: vec!["images".to_string()],
            ..Default::default()
        })
        .unwrap();

        let result = filter.apply(
            "/tmp/T",
            vec![candidate("/tmp/T/a.rs", 1), candidate("/tmp/T/b.png", 1)],
        );
        assert_eq!(result.len(), 1);
        assert!(result[0].path.ends_with("b.png"));
    }

    #[test]
    fn max_depth_is_relative_to_root() {
        let filter = Filter::new(FilterOptions {
            max_depth: Some(1),
            ..Default::default()
        })
        .unwrap();

        let result = filter.apply(
            "/tmp/T",
            vec![
                candidate("/tmp/T/a.txt", 1),
                candidate("/tmp/T/sub/b.txt", 1),
                candidate("/tmp/T/sub/deep/c.txt", 1),
            ],
        );
        let paths: Vec<_> = result.into_iter().map(|c| c.path).collect();
        assert_eq!(paths, vec!["/tmp/T/a.txt", "/tmp/T/sub/b.txt"]);
    }
}
