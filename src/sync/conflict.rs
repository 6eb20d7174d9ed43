//! Conflict copy naming
//!
//! When a concurrent local edit loses against the registered chain, the
//! local content survives as `<stem> (<suffix> <date>)[ N].<ext>`. The
//! extension heuristic preserves up to two trailing dot-segments that
//! contain no spaces, so `archive.tar.gz` keeps its compound extension. The
//! generated name never exceeds the platform name length limit and never
//! collides with an existing sibling.

use chrono::NaiveDate;
use std::path::{Path, PathBuf};

use crate::types::MAX_FILE_NAME_LEN;

/// Default marker inserted into conflict copy names
pub const CONFLICT_SUFFIX: &str = "Conflicted copy";

/// Split a file name into stem and preserved extension
///
/// At most two trailing dot-segments survive, and only if they are non-empty
/// and contain no spaces.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    let mut boundary = name.len();
    let mut kept = 0;

    while kept < 2 {
        let Some(dot) = name[..boundary].rfind('.') else {
            break;
        };
        let segment = &name[dot + 1..boundary];
        if segment.is_empty() || segment.contains(' ') || dot == 0 {
            break;
        }
        boundary = dot;
        kept += 1;
    }

    if boundary == name.len() {
        (name, None)
    } else {
        (&name[..boundary], Some(&name[boundary + 1..]))
    }
}

/// Build a conflict copy name for `name`, unique per the `taken` predicate
pub fn conflict_name(
    name: &str,
    suffix: &str,
    date: NaiveDate,
    mut taken: impl FnMut(&str) -> bool,
) -> String {
    let (stem, extension) = split_extension(name);
    let date = date.format("%Y-%m-%d");

    let assemble = |stem: &str, counter: u32| {
        let counter_part = if counter == 0 {
            String::new()
        } else {
            format!(" {counter}")
        };
        match extension {
            Some(ext) => format!("{stem} ({suffix} {date}){counter_part}.{ext}"),
            None => format!("{stem} ({suffix} {date}){counter_part}"),
        }
    };

    for counter in 0..10_000 {
        let mut candidate = assemble(stem, counter);

        // trim the stem until the whole name fits the platform limit
        if candidate.len() > MAX_FILE_NAME_LEN {
            let overflow = candidate.len() - MAX_FILE_NAME_LEN;
            let keep = stem.len().saturating_sub(overflow).max(1);
            let mut end = keep;
            while end > 0 && !stem.is_char_boundary(end) {
                end -= 1;
            }
            candidate = assemble(&stem[..end.max(1)], counter);
        }

        if !taken(&candidate) {
            return candidate;
        }
    }

    // unreachable in practice; fall back to a counter far outside the probe
    assemble(stem, 10_000)
}

/// Build the conflict copy path next to `path`
pub fn conflict_path(path: &Path, suffix: &str, date: NaiveDate) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("conflict");
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let unique = conflict_name(name, suffix, date, |candidate| {
        parent.join(candidate).exists()
    });
    parent.join(unique)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn simple_extension_is_preserved() {
        let name = conflict_name("x.txt", CONFLICT_SUFFIX, date(), |_| false);
        assert_eq!(name, "x (Conflicted copy 2024-06-01).txt");
    }

    #[test]
    fn compound_extension_is_preserved() {
        let name = conflict_name("backup.tar.gz", CONFLICT_SUFFIX, date(), |_| false);
        assert_eq!(name, "backup (Conflicted copy 2024-06-01).tar.gz");
    }

    #[test]
    fn at_most_two_segments_survive() {
        let name = conflict_name("a.b.c.d", CONFLICT_SUFFIX, date(), |_| false);
        assert_eq!(name, "a.b (Conflicted copy 2024-06-01).c.d");
    }

    #[test]
    fn segments_with_spaces_are_not_extensions() {
        let name = conflict_name("notes.final version", CONFLICT_SUFFIX, date(), |_| false);
        assert_eq!(name, "notes.final version (Conflicted copy 2024-06-01)");
    }

    #[test]
    fn no_extension_at_all() {
        let name = conflict_name("Makefile", CONFLICT_SUFFIX, date(), |_| false);
        assert_eq!(name, "Makefile (Conflicted copy 2024-06-01)");
    }

    #[test]
    fn hidden_file_name_is_not_an_extension() {
        let name = conflict_name(".env", CONFLICT_SUFFIX, date(), |_| false);
        assert_eq!(name, ".env (Conflicted copy 2024-06-01)");
    }

    #[test]
    fn collisions_get_counters() {
        let existing = [
            "x (Conflicted copy 2024-06-01).txt",
            "x (Conflicted copy 2024-06-01) 1.txt",
        ];
        let name = conflict_name("x.txt", CONFLICT_SUFFIX, date(), |candidate| {
            existing.contains(&candidate)
        });
        assert_eq!(name, "x (Conflicted copy 2024-06-01) 2.txt");
    }

    #[test]
    fn long_names_stay_within_the_limit() {
        let stem = "a".repeat(300);
        let name = conflict_name(
            &format!("{stem}.txt"),
            CONFLICT_SUFFIX,
            date(),
            |_| false,
        );
        assert!(name.len() <= MAX_FILE_NAME_LEN, "name is {} chars", name.len());
        assert!(name.ends_with(".txt"));
        assert!(name.contains("(Conflicted copy 2024-06-01)"));
    }

    #[test]
    fn multibyte_stems_truncate_on_char_boundaries() {
        let stem = "ü".repeat(200);
        let name = conflict_name(
            &format!("{stem}.txt"),
            CONFLICT_SUFFIX,
            date(),
            |_| false,
        );
        assert!(name.len() <= MAX_FILE_NAME_LEN);
        assert!(name.ends_with(".txt"));
    }

    #[test]
    fn conflict_path_lands_next_to_original() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("doc.txt");
        std::fs::write(&original, b"x").unwrap();

        let conflict = conflict_path(&original, CONFLICT_SUFFIX, date());
        assert_eq!(conflict.parent(), original.parent());
        assert!(!conflict.exists());

        // creating it and asking again yields the counter variant
        std::fs::write(&conflict, b"y").unwrap();
        let second = conflict_path(&original, CONFLICT_SUFFIX, date());
        assert_ne!(second, conflict);
        assert!(second.to_string_lossy().contains(") 1.txt"));
    }
}
