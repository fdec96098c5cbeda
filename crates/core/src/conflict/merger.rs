//! Three-way merge engine.
//!
//! Uses the `diffy` crate to perform line-based three-way merges between a
//! base, "ours" (the branch) and "theirs" (the canonical history) version of
//! a file. Conflicting regions get git-style markers carrying the labels the
//! caller supplies.

use tracing::debug;

/// Labels written after `<<<<<<<` and `>>>>>>>`.
#[derive(Debug, Clone, Copy)]
pub struct MarkerLabels<'a> {
    pub ours: &'a str,
    pub theirs: &'a str,
}

impl Default for MarkerLabels<'_> {
    fn default() -> Self {
        Self {
            ours: "HEAD",
            theirs: "theirs",
        }
    }
}

/// The result of a three-way merge attempt.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// The merged content (contains conflict markers if `has_conflicts`).
    pub merged_content: String,
    pub has_conflicts: bool,
    pub conflict_markers: Vec<ConflictMarker>,
}

impl MergeResult {
    fn clean(content: &str) -> Self {
        Self {
            merged_content: content.to_string(),
            has_conflicts: false,
            conflict_markers: Vec::new(),
        }
    }
}

/// A single conflict region within merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMarker {
    /// Line (1-indexed) of the `<<<<<<<` marker.
    pub start_line: usize,
    /// Line (1-indexed) of the `>>>>>>>` marker.
    pub end_line: usize,
}

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Merge `ours` and `theirs` against their common `base`.
    ///
    /// The result always carries content. A clean merge has
    /// `has_conflicts == false`; otherwise conflicting regions are wrapped in
    /// `<<<<<<<` / `=======` / `>>>>>>>` markers.
    pub fn three_way_merge(
        base: &str,
        ours: &str,
        theirs: &str,
        labels: MarkerLabels<'_>,
    ) -> MergeResult {
        if ours == base || ours == theirs {
            debug!("ours unchanged or identical, theirs wins cleanly");
            return MergeResult::clean(theirs);
        }
        if theirs == base {
            debug!("theirs unchanged, ours wins cleanly");
            return MergeResult::clean(ours);
        }

        let patch_theirs = diffy::create_patch(base, theirs);
        if let Ok(merged) = diffy::apply(ours, &patch_theirs) {
            debug!("clean merge via applying theirs-patch to ours");
            return MergeResult::clean(&merged);
        }

        let patch_ours = diffy::create_patch(base, ours);
        if let Ok(merged) = diffy::apply(theirs, &patch_ours) {
            debug!("clean merge via applying ours-patch to theirs");
            return MergeResult::clean(&merged);
        }

        debug!("automatic merge failed, generating conflict markers");
        let (merged_content, conflict_markers) = conflict_output(ours, theirs, labels);
        MergeResult {
            merged_content,
            has_conflicts: true,
            conflict_markers,
        }
    }

    /// Whether `content` contains a complete conflict block.
    pub fn has_conflict_markers(content: &[u8]) -> bool {
        let text = String::from_utf8_lossy(content);
        let mut open = false;
        for line in text.lines() {
            if line.starts_with("<<<<<<< ") || line == "<<<<<<<" {
                open = true;
            } else if open && (line.starts_with(">>>>>>> ") || line == ">>>>>>>") {
                return true;
            }
        }
        false
    }
}

/// Produce conflict-marker output for a failed three-way merge.
///
/// Lines equal on both sides are kept; each run of differing lines becomes
/// one conflict block.
fn conflict_output(
    ours: &str,
    theirs: &str,
    labels: MarkerLabels<'_>,
) -> (String, Vec<ConflictMarker>) {
    let ours_lines: Vec<&str> = ours.lines().collect();
    let theirs_lines: Vec<&str> = theirs.lines().collect();
    let max_len = ours_lines.len().max(theirs_lines.len());

    let mut output: Vec<String> = Vec::new();
    let mut markers = Vec::new();

    let mut i = 0;
    while i < max_len {
        let o = ours_lines.get(i);
        let t = theirs_lines.get(i);
        if o == t {
            if let Some(line) = o {
                output.push(line.to_string());
            }
            i += 1;
            continue;
        }

        let start = i;
        let mut end = i + 1;
        while end < max_len && ours_lines.get(end) != theirs_lines.get(end) {
            end += 1;
        }

        let start_line = output.len() + 1;
        output.push(format!("<<<<<<< {}", labels.ours));
        output.extend(slice(&ours_lines, start, end).iter().map(|l| l.to_string()));
        output.push("=======".to_string());
        output.extend(slice(&theirs_lines, start, end).iter().map(|l| l.to_string()));
        output.push(format!(">>>>>>> {}", labels.theirs));
        markers.push(ConflictMarker {
            start_line,
            end_line: output.len(),
        });

        i = end;
    }

    let mut merged = output.join("\n");
    merged.push('\n');
    (merged, markers)
}

fn slice<'a>(lines: &'a [&'a str], start: usize, end: usize) -> &'a [&'a str] {
    let end = end.min(lines.len());
    if start >= end {
        &[]
    } else {
        &lines[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merge(base: &str, ours: &str, theirs: &str) -> MergeResult {
        Merger::three_way_merge(base, ours, theirs, MarkerLabels::default())
    }

    #[test]
    fn test_identical_files() {
        let base = "line1\nline2\nline3\n";
        let result = merge(base, base, base);
        assert!(!result.has_conflicts);
        assert!(result.conflict_markers.is_empty());
    }

    #[test]
    fn test_only_ours_changed() {
        let base = "line1\nline2\nline3\n";
        let result = merge(base, "line1\nmodified\nline3\n", base);
        assert!(!result.has_conflicts);
        assert!(result.merged_content.contains("modified"));
    }

    #[test]
    fn test_only_theirs_changed() {
        let base = "line1\nline2\nline3\n";
        let result = merge(base, base, "line1\nline2\nmodified\n");
        assert!(!result.has_conflicts);
        assert!(result.merged_content.contains("modified"));
    }

    #[test]
    fn test_non_overlapping_changes() {
        let base = "line1\nline2\nline3\nline4\nline5\nline6\nline7\nline8\n";
        let ours = "LINE1\nline2\nline3\nline4\nline5\nline6\nline7\nline8\n";
        let theirs = "line1\nline2\nline3\nline4\nline5\nline6\nline7\nLINE8\n";
        let result = merge(base, ours, theirs);
        assert!(!result.has_conflicts);
        assert!(result.merged_content.contains("LINE1"));
        assert!(result.merged_content.contains("LINE8"));
    }

    #[test]
    fn test_conflicting_changes() {
        let base = "line1\noriginal\nline3\n";
        let ours = "line1\nours_version\nline3\n";
        let theirs = "line1\ntheirs_version\nline3\n";
        let result = Merger::three_way_merge(
            base,
            ours,
            theirs,
            MarkerLabels {
                ours: "HEAD",
                theirs: "origin/master",
            },
        );
        assert!(result.has_conflicts);
        assert!(result.merged_content.contains("<<<<<<< HEAD"));
        assert!(result.merged_content.contains("======="));
        assert!(result.merged_content.contains(">>>>>>> origin/master"));
        assert_eq!(
            result.conflict_markers,
            vec![ConflictMarker {
                start_line: 2,
                end_line: 6
            }]
        );
        assert!(Merger::has_conflict_markers(result.merged_content.as_bytes()));
    }

    #[test]
    fn test_same_change_both_sides() {
        let result = merge("old\n", "new\n", "new\n");
        assert!(!result.has_conflicts);
        assert_eq!(result.merged_content, "new\n");
    }

    #[test]
    fn test_marker_detection() {
        assert!(!Merger::has_conflict_markers(b"plain text\n"));
        assert!(!Merger::has_conflict_markers(b"<<<<<<< HEAD\nonly opened\n"));
        assert!(Merger::has_conflict_markers(
            b"<<<<<<< HEAD\na\n=======\nb\n>>>>>>> theirs\n"
        ));
    }
}
