//! Automatic file selection.
//!
//! Candidates are filtered by minimum size, then the include expression, then
//! the exclude expression. Availability filtering happens before this step.

use torrelay_config::compile_pattern;
use torrelay_core::{EngineError, EngineResult, JobPolicy, ProviderFile};

/// Validate the policy's expressions.
///
/// # Errors
///
/// Returns [`EngineError::InvalidArgument`] naming the expression that does
/// not compile.
pub fn validate_patterns(policy: &JobPolicy) -> EngineResult<()> {
    compile("include_pattern", policy.include_pattern.as_deref())?;
    compile("exclude_pattern", policy.exclude_pattern.as_deref())?;
    Ok(())
}

fn compile(field: &'static str, pattern: Option<&str>) -> EngineResult<Option<regex::Regex>> {
    compile_pattern(field, pattern).map_err(|_| EngineError::InvalidArgument {
        field,
        reason: "invalid_regex",
        value: pattern.map(str::to_string),
    })
}

/// Identifiers of the files `policy` selects out of `files`.
///
/// # Errors
///
/// Returns [`EngineError::InvalidArgument`] for an invalid expression or when
/// no file survives the filters.
pub fn select_files(files: &[ProviderFile], policy: &JobPolicy) -> EngineResult<Vec<String>> {
    let include = compile("include_pattern", policy.include_pattern.as_deref())?;
    let exclude = compile("exclude_pattern", policy.exclude_pattern.as_deref())?;
    let selected: Vec<String> = files
        .iter()
        .filter(|file| file.size_bytes >= policy.download_min_size_bytes)
        .filter(|file| include.as_ref().is_none_or(|re| re.is_match(&file.path)))
        .filter(|file| !exclude.as_ref().is_some_and(|re| re.is_match(&file.path)))
        .map(|file| file.id.clone())
        .collect();
    if selected.is_empty() {
        return Err(EngineError::InvalidArgument {
            field: "selection",
            reason: "no_matching_files",
            value: None,
        });
    }
    Ok(selected)
}

/// Files of `files` that also appear in `available`, matched by id or path.
#[must_use]
pub fn available_only(files: &[ProviderFile], available: &[ProviderFile]) -> Vec<ProviderFile> {
    files
        .iter()
        .filter(|file| {
            available.iter().any(|candidate| {
                candidate.id == file.id || trimmed(&candidate.path) == trimmed(&file.path)
            })
        })
        .cloned()
        .collect()
}

fn trimmed(path: &str) -> &str {
    path.trim_start_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: &str, path: &str, size_bytes: u64) -> ProviderFile {
        ProviderFile {
            id: id.into(),
            path: path.into(),
            size_bytes,
            selected: false,
        }
    }

    fn listing() -> Vec<ProviderFile> {
        vec![
            file("1", "/Show/S01E01.mkv", 900),
            file("2", "/Show/S01E01.nfo", 2),
            file("3", "/Show/Sample/sample.mkv", 50),
            file("4", "/Show/S01E02.mkv", 950),
        ]
    }

    #[test]
    fn size_and_patterns_filter_candidates() -> anyhow::Result<()> {
        let mut policy = JobPolicy {
            download_min_size_bytes: 10,
            ..JobPolicy::default()
        };
        assert_eq!(select_files(&listing(), &policy)?, vec!["1", "3", "4"]);

        policy.exclude_pattern = Some("(?i)sample".into());
        assert_eq!(select_files(&listing(), &policy)?, vec!["1", "4"]);

        policy.include_pattern = Some(r"E02\.mkv$".into());
        assert_eq!(select_files(&listing(), &policy)?, vec!["4"]);
        Ok(())
    }

    #[test]
    fn empty_selection_is_rejected() {
        let policy = JobPolicy {
            download_min_size_bytes: 10_000,
            ..JobPolicy::default()
        };
        let err = select_files(&listing(), &policy).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidArgument {
                reason: "no_matching_files",
                ..
            }
        ));
    }

    #[test]
    fn bad_expressions_are_reported() {
        let policy = JobPolicy {
            include_pattern: Some("(".into()),
            ..JobPolicy::default()
        };
        assert!(matches!(
            validate_patterns(&policy),
            Err(EngineError::InvalidArgument {
                field: "include_pattern",
                ..
            })
        ));
    }

    #[test]
    fn availability_matches_id_or_path() {
        let available = vec![file("x", "Show/S01E02.mkv", 950), file("1", "other", 1)];
        let kept: Vec<String> = available_only(&listing(), &available)
            .into_iter()
            .map(|file| file.id)
            .collect();
        assert_eq!(kept, vec!["1", "4"]);
    }
}
