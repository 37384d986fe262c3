use std::ops::AddAssign;

use similar::{ChangeTag, TextDiff};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineStats {
    pub added: usize,
    pub removed: usize,
}

impl LineStats {
    pub fn new(added: usize, removed: usize) -> Self {
        Self { added, removed }
    }
}

impl AddAssign for LineStats {
    fn add_assign(&mut self, other: Self) {
        self.added += other.added;
        self.removed += other.removed;
    }
}

/// Added/removed line counts between two versions of a file; `None` is "file absent".
pub fn line_stats(old: Option<&str>, new: Option<&str>) -> LineStats {
    match (old, new) {
        (None, None) => LineStats::default(),
        (None, Some(new)) => LineStats::new(new.lines().count(), 0),
        (Some(old), None) => LineStats::new(0, old.lines().count()),
        (Some(old), Some(new)) if old == new => LineStats::default(),
        (Some(old), Some(new)) => {
            let old_lines: Vec<&str> = old.lines().collect();
            let new_lines: Vec<&str> = new.lines().collect();
            let common = lcs_length(&old_lines, &new_lines);
            LineStats::new(new_lines.len() - common, old_lines.len() - common)
        }
    }
}

/// Single-row LCS; the shorter sequence is always the inner dimension.
pub fn lcs_length(a: &[&str], b: &[&str]) -> usize {
    let (outer, inner) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    if inner.is_empty() {
        return 0;
    }
    let mut row = vec![0usize; inner.len() + 1];
    for item in outer {
        let mut diagonal = 0;
        for j in 1..=inner.len() {
            let above = row[j];
            row[j] = if *item == inner[j - 1] {
                diagonal + 1
            } else {
                above.max(row[j - 1])
            };
            diagonal = above;
        }
    }
    row[inner.len()]
}

pub fn print_diff(old: &str, new: &str, context: usize) {
    let diff = TextDiff::configure()
        .algorithm(similar::Algorithm::Myers)
        .diff_lines(old, new);

    for (idx, group) in diff.grouped_ops(context).iter().enumerate() {
        if idx > 0 {
            println!("...");
        }
        for op in group {
            for change in diff.iter_changes(op) {
                match change.tag() {
                    ChangeTag::Delete => print!("- "),
                    ChangeTag::Insert => print!("+ "),
                    ChangeTag::Equal => print!("  "),
                }
                print!("{change}");
                if change.missing_newline() {
                    println!();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_is_zero() {
        assert_eq!(line_stats(Some("a\nb\n"), Some("a\nb\n")), LineStats::new(0, 0));
    }

    #[test]
    fn new_file_counts_every_line() {
        assert_eq!(line_stats(None, Some("a\nb\nc")), LineStats::new(3, 0));
    }

    #[test]
    fn deleted_file_counts_every_line() {
        assert_eq!(line_stats(Some("a\nb\nc\n"), None), LineStats::new(0, 3));
    }

    #[test]
    fn edits_use_common_subsequence() {
        let old = "one\ntwo\nthree\nfour\n";
        let new = "one\n2\nthree\nfour\nfive\n";
        assert_eq!(line_stats(Some(old), Some(new)), LineStats::new(2, 1));
    }

    #[test]
    fn lcs_is_symmetric_in_argument_order() {
        let long = ["a", "b", "c", "d", "e"];
        let short = ["b", "d", "x"];
        assert_eq!(lcs_length(&long, &short), 2);
        assert_eq!(lcs_length(&short, &long), 2);
        assert_eq!(lcs_length(&[], &long), 0);
    }

    #[test]
    fn stats_accumulate() {
        let mut total = LineStats::default();
        total += LineStats::new(2, 1);
        total += LineStats::new(0, 4);
        assert_eq!(total, LineStats::new(2, 5));
    }
}
