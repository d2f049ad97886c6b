//! Line-level patches for modified text files
//!
//! When a modified file is small text, a layer stores a unified line diff
//! instead of the whole new file. The diff is found with a longest common
//! subsequence over lines, then grouped into hunks with three lines of
//! context.
//!
//! ## Format
//!
//! ```text
//! --- a
//! +++ b
//! @@ -3,4 +3,5 @@
//!  context line
//! -removed line
//! +added line
//! \ No newline at end of file
//! ```
//!
//! Line terminators are kept exactly. A line without a trailing newline is
//! followed by the `\ No newline at end of file` marker, so applying a patch
//! reproduces the new file byte for byte.
//!
//! Applying checks every context and removed line against the base. A patch
//! that does not fit its base fails with an integrity error instead of
//! producing a wrong file.

use crate::error::{Result, TesseraError};

/// Unchanged lines kept around each hunk
const CONTEXT_LINES: usize = 3;

/// Upper bound on the LCS table (cells) before giving up on a text patch
const MAX_LCS_CELLS: usize = 4_000_000;

const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

/// Represents a change operation in the diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeOp {
    Keep(usize, usize), // (old_line_idx, new_line_idx)
    Delete(usize),      // old_line_idx
    Insert(usize),      // new_line_idx
}

/// Check if content appears to be binary
pub fn is_binary_content(content: &[u8]) -> bool {
    let check_len = content.len().min(8192);
    content[..check_len].contains(&0)
}

/// Build a unified line diff turning `old` into `new`
///
/// Returns `None` when either side is binary or not UTF-8, or when the files
/// are too large for a line diff. Identical inputs give an empty patch.
pub fn create_patch(old: &[u8], new: &[u8]) -> Option<String> {
    if is_binary_content(old) || is_binary_content(new) {
        return None;
    }
    let old_text = std::str::from_utf8(old).ok()?;
    let new_text = std::str::from_utf8(new).ok()?;
    let old_lines: Vec<&str> = old_text.split_inclusive('\n').collect();
    let new_lines: Vec<&str> = new_text.split_inclusive('\n').collect();

    let changes = compute_changes(&old_lines, &new_lines)?;
    Some(render_hunks(&changes, &old_lines, &new_lines))
}

/// Compute the sequence of change operations
///
/// Common leading and trailing lines are matched directly so the quadratic
/// table only covers the changed middle.
fn compute_changes(old_lines: &[&str], new_lines: &[&str]) -> Option<Vec<ChangeOp>> {
    let prefix = old_lines
        .iter()
        .zip(new_lines)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old_lines[prefix..]
        .iter()
        .rev()
        .zip(new_lines[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let old_mid = &old_lines[prefix..old_lines.len() - suffix];
    let new_mid = &new_lines[prefix..new_lines.len() - suffix];
    if old_mid.len().saturating_mul(new_mid.len()) > MAX_LCS_CELLS {
        return None;
    }

    let mut changes: Vec<ChangeOp> = (0..prefix).map(|i| ChangeOp::Keep(i, i)).collect();
    let lcs = compute_lcs(old_mid, new_mid);
    for op in lcs_to_changes(&lcs, old_mid.len(), new_mid.len()) {
        changes.push(match op {
            ChangeOp::Keep(o, n) => ChangeOp::Keep(o + prefix, n + prefix),
            ChangeOp::Delete(o) => ChangeOp::Delete(o + prefix),
            ChangeOp::Insert(n) => ChangeOp::Insert(n + prefix),
        });
    }
    let old_tail = old_lines.len() - suffix;
    let new_tail = new_lines.len() - suffix;
    changes.extend((0..suffix).map(|i| ChangeOp::Keep(old_tail + i, new_tail + i)));
    Some(changes)
}

/// Longest common subsequence as matched (old, new) index pairs
fn compute_lcs(old_lines: &[&str], new_lines: &[&str]) -> Vec<(usize, usize)> {
    let m = old_lines.len();
    let n = new_lines.len();
    if m == 0 || n == 0 {
        return Vec::new();
    }

    // Flat DP table, (m + 1) x (n + 1)
    let width = n + 1;
    let mut dp = vec![0u32; (m + 1) * width];
    for i in 1..=m {
        for j in 1..=n {
            dp[i * width + j] = if old_lines[i - 1] == new_lines[j - 1] {
                dp[(i - 1) * width + j - 1] + 1
            } else {
                dp[(i - 1) * width + j].max(dp[i * width + j - 1])
            };
        }
    }

    let mut lcs = Vec::new();
    let (mut i, mut j) = (m, n);
    while i > 0 && j > 0 {
        if old_lines[i - 1] == new_lines[j - 1] {
            lcs.push((i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if dp[(i - 1) * width + j] > dp[i * width + j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }

    lcs.reverse();
    lcs
}

fn lcs_to_changes(lcs: &[(usize, usize)], old_len: usize, new_len: usize) -> Vec<ChangeOp> {
    let mut changes = Vec::with_capacity(old_len + new_len);
    let mut old_idx = 0;
    let mut new_idx = 0;

    for &(lcs_old, lcs_new) in lcs {
        while old_idx < lcs_old {
            changes.push(ChangeOp::Delete(old_idx));
            old_idx += 1;
        }
        while new_idx < lcs_new {
            changes.push(ChangeOp::Insert(new_idx));
            new_idx += 1;
        }
        changes.push(ChangeOp::Keep(old_idx, new_idx));
        old_idx += 1;
        new_idx += 1;
    }
    while old_idx < old_len {
        changes.push(ChangeOp::Delete(old_idx));
        old_idx += 1;
    }
    while new_idx < new_len {
        changes.push(ChangeOp::Insert(new_idx));
        new_idx += 1;
    }

    changes
}

/// Group changes into hunks and render them
fn render_hunks(changes: &[ChangeOp], old_lines: &[&str], new_lines: &[&str]) -> String {
    // Lines consumed on each side before op k; one extra entry for the end
    let mut old_pos = Vec::with_capacity(changes.len() + 1);
    let mut new_pos = Vec::with_capacity(changes.len() + 1);
    let (mut o, mut n) = (0usize, 0usize);
    for op in changes {
        old_pos.push(o);
        new_pos.push(n);
        match op {
            ChangeOp::Keep(..) => {
                o += 1;
                n += 1;
            }
            ChangeOp::Delete(_) => o += 1,
            ChangeOp::Insert(_) => n += 1,
        }
    }
    old_pos.push(o);
    new_pos.push(n);

    // Op ranges covering each change plus its context, merged when they touch
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for (k, op) in changes.iter().enumerate() {
        if matches!(op, ChangeOp::Keep(..)) {
            continue;
        }
        let start = k.saturating_sub(CONTEXT_LINES);
        let end = (k + CONTEXT_LINES + 1).min(changes.len());
        match ranges.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => ranges.push((start, end)),
        }
    }

    let mut out = String::new();
    if ranges.is_empty() {
        return out;
    }
    out.push_str("--- a\n+++ b\n");
    for (start, end) in ranges {
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            old_pos[start] + 1,
            old_pos[end] - old_pos[start],
            new_pos[start] + 1,
            new_pos[end] - new_pos[start],
        ));
        for op in &changes[start..end] {
            let (prefix, line) = match *op {
                ChangeOp::Keep(o, _) => (' ', old_lines[o]),
                ChangeOp::Delete(o) => ('-', old_lines[o]),
                ChangeOp::Insert(n) => ('+', new_lines[n]),
            };
            out.push(prefix);
            out.push_str(line);
            if !line.ends_with('\n') {
                out.push('\n');
                out.push_str(NO_NEWLINE_MARKER);
                out.push('\n');
            }
        }
    }
    out
}

#[derive(Debug)]
struct Hunk {
    old_start: usize,
    old_len: usize,
    lines: Vec<(char, String)>,
}

fn parse_header(line: &str) -> Result<(usize, usize)> {
    let malformed = || TesseraError::LayerMismatch(format!("malformed hunk header {line:?}"));
    let body = line
        .strip_prefix("@@ -")
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(malformed)?;
    let old = body.split(' ').next().ok_or_else(malformed)?;
    let (start, len) = old.split_once(',').ok_or_else(malformed)?;
    let start = start.parse::<usize>().map_err(|_| malformed())?;
    let len = len.parse::<usize>().map_err(|_| malformed())?;
    Ok((start.saturating_sub(1), len))
}

fn parse_patch(patch: &str) -> Result<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();
    for raw in patch.split_inclusive('\n') {
        let line = raw.strip_suffix('\n').unwrap_or(raw);
        if line.starts_with("@@ ") {
            let (old_start, old_len) = parse_header(line)?;
            hunks.push(Hunk { old_start, old_len, lines: Vec::new() });
            continue;
        }
        let Some(hunk) = hunks.last_mut() else {
            // File headers before the first hunk
            continue;
        };
        if line == NO_NEWLINE_MARKER {
            if let Some((_, text)) = hunk.lines.last_mut() {
                if text.ends_with('\n') {
                    text.pop();
                }
            }
            continue;
        }
        let mut chars = raw.chars();
        match chars.next() {
            Some(op @ (' ' | '-' | '+')) => hunk.lines.push((op, chars.as_str().to_string())),
            _ => {
                return Err(TesseraError::LayerMismatch(format!(
                    "unexpected patch line {line:?}"
                )))
            }
        }
    }
    Ok(hunks)
}

/// Apply a patch produced by [`create_patch`] to `base`
pub fn apply_patch(base: &[u8], patch: &str) -> Result<Vec<u8>> {
    let base_text = std::str::from_utf8(base)
        .map_err(|_| TesseraError::LayerMismatch("patch base is not UTF-8".into()))?;
    let base_lines: Vec<&str> = base_text.split_inclusive('\n').collect();

    let mut out = String::with_capacity(base.len());
    let mut cursor = 0;
    for hunk in parse_patch(patch)? {
        if hunk.old_start < cursor || hunk.old_start > base_lines.len() {
            return Err(TesseraError::LayerMismatch(format!(
                "hunk at line {} is out of order or past the end",
                hunk.old_start + 1
            )));
        }
        for line in &base_lines[cursor..hunk.old_start] {
            out.push_str(line);
        }
        cursor = hunk.old_start;

        let mut consumed = 0;
        for (op, text) in &hunk.lines {
            match op {
                '+' => out.push_str(text),
                _ => {
                    if base_lines.get(cursor) != Some(&text.as_str()) {
                        return Err(TesseraError::LayerMismatch(format!(
                            "base differs from patch at line {}",
                            cursor + 1
                        )));
                    }
                    if *op == ' ' {
                        out.push_str(text);
                    }
                    cursor += 1;
                    consumed += 1;
                }
            }
        }
        if consumed != hunk.old_len {
            return Err(TesseraError::LayerMismatch(format!(
                "hunk expected {} base line(s), found {}",
                hunk.old_len, consumed
            )));
        }
    }
    for line in &base_lines[cursor..] {
        out.push_str(line);
    }
    Ok(out.into_bytes())
}
