//! Line-based three-way merge.
//!
//! The base is aligned with each side through a longest-common-subsequence
//! match, which yields each side's changed ranges (hunks). Hunks whose base
//! ranges overlap are grouped: a group touched by one side only takes that
//! side, a group changed identically on both sides is taken once, anything
//! else is a conflict. Edits on neighbouring lines do not overlap and merge
//! cleanly.
//!
//! Without a base the two sides are aligned directly and every divergent
//! range is a conflict, since there is no way to tell who changed what.

use serde::{Deserialize, Serialize};
use std::ops::Range;

const MARKER_LOCAL: &str = "<<<<<<< local";
const MARKER_BASE: &str = "||||||| base";
const MARKER_SEP: &str = "=======";
const MARKER_REMOTE: &str = ">>>>>>> remote";

/// Largest alignment table built for one pair of inputs. Past it the
/// differing middle is left unaligned and surfaces as a single region.
const MAX_LCS_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineConflict {
    /// 1-based line of the opening marker in `merged_content`.
    pub line_number: usize,
    pub local_content: String,
    pub remote_content: String,
    pub base_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub success: bool,
    pub merged_content: String,
    pub conflicts: Vec<LineConflict>,
    pub warnings: Vec<String>,
}

/// Merge `local` and `remote`, using `base` as common ancestor when known.
pub fn three_way_merge(base: Option<&str>, local: &str, remote: &str) -> MergeResult {
    if local == remote {
        return MergeResult {
            success: true,
            merged_content: local.to_string(),
            conflicts: Vec::new(),
            warnings: Vec::new(),
        };
    }

    let local_lines = split_lines(local);
    let remote_lines = split_lines(remote);

    let mut out = MergeOutput::default();
    let mut warnings = Vec::new();

    match base {
        Some(base) => {
            let base_lines = split_lines(base);
            merge_with_base(&base_lines, &local_lines, &remote_lines, &mut out);
        }
        None => {
            warnings.push(
                "No common base available; every divergent region is treated as a conflict".to_string(),
            );
            merge_two_way(&local_lines, &remote_lines, &mut out);
        }
    }

    if !out.conflicts.is_empty() {
        warnings.push(format!(
            "{} conflicting region(s) require manual resolution",
            out.conflicts.len()
        ));
    }

    MergeResult {
        success: out.conflicts.is_empty(),
        merged_content: out.lines.join("\n"),
        conflicts: out.conflicts,
        warnings,
    }
}

/// Whether `content` still carries conflict markers from a failed merge.
pub fn has_conflict_markers(content: &str) -> bool {
    content.lines().any(|line| {
        line.starts_with("<<<<<<< ") || line.starts_with(">>>>>>> ") || line == MARKER_SEP
    })
}

/// Splits on `\n` only, so joining with `\n` reproduces the input exactly.
fn split_lines(text: &str) -> Vec<&str> {
    text.split('\n').collect()
}

#[derive(Default)]
struct MergeOutput<'a> {
    lines: Vec<&'a str>,
    conflicts: Vec<LineConflict>,
}

impl<'a> MergeOutput<'a> {
    fn take(&mut self, chunk: &[&'a str]) {
        self.lines.extend_from_slice(chunk);
    }

    fn conflict(&mut self, local: &[&'a str], remote: &[&'a str], base: Option<&[&'a str]>) {
        let line_number = self.lines.len() + 1;
        self.lines.push(MARKER_LOCAL);
        self.lines.extend_from_slice(local);
        if let Some(base) = base {
            self.lines.push(MARKER_BASE);
            self.lines.extend_from_slice(base);
        }
        self.lines.push(MARKER_SEP);
        self.lines.extend_from_slice(remote);
        self.lines.push(MARKER_REMOTE);

        self.conflicts.push(LineConflict {
            line_number,
            local_content: local.join("\n"),
            remote_content: remote.join("\n"),
            base_content: base.map(|b| b.join("\n")),
        });
    }
}

/// A change one side made: `base` lines replaced by `side` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk {
    base: Range<usize>,
    side: Range<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

/// Changed ranges of one side relative to the base, in base order.
fn hunks(matches: &[Option<usize>], side_len: usize) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let (mut o, mut a) = (0usize, 0usize);
    for (i, matched) in matches.iter().enumerate() {
        if let Some(j) = *matched {
            if o < i || a < j {
                hunks.push(Hunk { base: o..i, side: a..j });
            }
            o = i + 1;
            a = j + 1;
        }
    }
    if o < matches.len() || a < side_len {
        hunks.push(Hunk {
            base: o..matches.len(),
            side: a..side_len,
        });
    }
    hunks
}

/// Whether two base ranges touch the same lines. Insertions overlap another
/// insertion at the same point, or a replacement strictly containing them.
fn overlaps(x: &Range<usize>, y: &Range<usize>) -> bool {
    match (x.is_empty(), y.is_empty()) {
        (true, true) => x.start == y.start,
        (true, false) => y.start < x.start && x.start < y.end,
        (false, true) => x.start < y.start && y.start < x.end,
        (false, false) => x.start < y.end && y.start < x.end,
    }
}

/// One side's text for `range` of the base, given that side's hunks inside it.
fn side_text<'a>(base: &[&'a str], side: &[&'a str], range: &Range<usize>, hunks: &[&Hunk]) -> Vec<&'a str> {
    let mut lines = Vec::new();
    let mut o = range.start;
    for hunk in hunks {
        lines.extend_from_slice(&base[o..hunk.base.start]);
        lines.extend_from_slice(&side[hunk.side.clone()]);
        o = hunk.base.end;
    }
    lines.extend_from_slice(&base[o..range.end]);
    lines
}

fn merge_with_base<'a>(base: &[&'a str], local: &[&'a str], remote: &[&'a str], out: &mut MergeOutput<'a>) {
    let local_hunks = hunks(&lcs_matches(base, local), local.len());
    let remote_hunks = hunks(&lcs_matches(base, remote), remote.len());

    let mut all: Vec<(Side, &Hunk)> = local_hunks
        .iter()
        .map(|h| (Side::Local, h))
        .chain(remote_hunks.iter().map(|h| (Side::Remote, h)))
        .collect();
    all.sort_by_key(|(_, h)| (h.base.start, h.base.end));

    let mut o = 0usize;
    let mut idx = 0usize;
    while idx < all.len() {
        // Group every hunk overlapping the growing range.
        let mut range = all[idx].1.base.clone();
        let mut group = vec![all[idx]];
        idx += 1;
        while idx < all.len() && overlaps(&range, &all[idx].1.base) {
            let hunk = all[idx].1;
            range = range.start.min(hunk.base.start)..range.end.max(hunk.base.end);
            group.push(all[idx]);
            idx += 1;
        }

        out.take(&base[o..range.start]);
        o = range.end;

        let local_part: Vec<&Hunk> = group.iter().filter(|(s, _)| *s == Side::Local).map(|(_, h)| *h).collect();
        let remote_part: Vec<&Hunk> = group.iter().filter(|(s, _)| *s == Side::Remote).map(|(_, h)| *h).collect();
        let local_text = side_text(base, local, &range, &local_part);
        let remote_text = side_text(base, remote, &range, &remote_part);

        if remote_part.is_empty() || local_text == remote_text {
            out.take(&local_text);
        } else if local_part.is_empty() {
            out.take(&remote_text);
        } else {
            out.conflict(&local_text, &remote_text, Some(&base[range]));
        }
    }
    out.take(&base[o..]);
}

fn merge_two_way<'a>(local: &[&'a str], remote: &[&'a str], out: &mut MergeOutput<'a>) {
    let to_remote = lcs_matches(local, remote);

    let (mut a, mut b) = (0usize, 0usize);
    loop {
        while a < local.len() && to_remote[a] == Some(b) {
            out.lines.push(local[a]);
            a += 1;
            b += 1;
        }

        let (next_a, next_b) = (a..local.len())
            .find_map(|i| to_remote[i].map(|j| (i, j)))
            .unwrap_or((local.len(), remote.len()));

        let local_chunk = &local[a..next_a];
        let remote_chunk = &remote[b..next_b];
        if !local_chunk.is_empty() || !remote_chunk.is_empty() {
            out.conflict(local_chunk, remote_chunk, None);
        }

        a = next_a;
        b = next_b;
        if a >= local.len() && b >= remote.len() {
            break;
        }
    }
}

/// For every line of `a`, the index of the line of `b` it is matched with in
/// a longest common subsequence. Matches are strictly increasing.
fn lcs_matches(a: &[&str], b: &[&str]) -> Vec<Option<usize>> {
    lcs_matches_within(a, b, MAX_LCS_CELLS)
}

fn lcs_matches_within(a: &[&str], b: &[&str], max_cells: usize) -> Vec<Option<usize>> {
    let (n, m) = (a.len(), b.len());
    let mut matches = vec![None; n];

    // Common prefix and suffix need no table.
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    for (i, slot) in matches.iter_mut().enumerate().take(prefix) {
        *slot = Some(i);
    }
    for k in 0..suffix {
        matches[n - 1 - k] = Some(m - 1 - k);
    }

    let a_mid = &a[prefix..n - suffix];
    let b_mid = &b[prefix..m - suffix];
    let (rows, cols) = (a_mid.len(), b_mid.len());
    if rows == 0 || cols == 0 {
        return matches;
    }
    if (rows + 1).saturating_mul(cols + 1) > max_cells {
        log::warn!("Merge inputs too large to align ({rows}x{cols} lines); treating the middle as one change");
        return matches;
    }

    // table[i][j] = LCS length of a_mid[i..] and b_mid[j..]
    let width = cols + 1;
    let mut table = vec![0u32; (rows + 1) * width];
    for i in (0..rows).rev() {
        for j in (0..cols).rev() {
            table[i * width + j] = if a_mid[i] == b_mid[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < rows && j < cols {
        if a_mid[i] == b_mid[j] {
            matches[prefix + i] = Some(prefix + j);
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }

    matches
}
