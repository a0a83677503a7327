// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of redgreen.
//
// redgreen is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// redgreen is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with redgreen.  If not,
// see <http://www.gnu.org/licenses/>.

//! # diff
//!
//! An anchored unified diff over lines of text.
//!
//! # Introduction
//!
//! Classic Unix diff implementations search for an edit script with the smallest number of
//! inserted & removed lines, which in the worst case takes time quadratic in the input. This
//! module instead minimizes the number of *unique* lines inserted & removed, where a unique line
//! is one appearing exactly once on each side. Those lines "anchor" the matched regions (hence,
//! "anchored diff"; some systems call this a "patience diff"). Beyond the O(n log n) bound, the
//! output tends to read better on source code: the algorithm will not reuse unrelated blank lines
//! or lone closing braces to stitch together regions that have nothing to do with one another.
//!
//! The longest common subsequence of anchors is computed per Szymanski, "A Special Case of the
//! Maximal Common Subsequence Problem," Princeton TR #170 (January 1975).
//!
//! Equality between lines is pluggable: [Options::normal] may supply a normalization applied to
//! a *comparison* form of each line, while the *display* form (what ends up in the output) is
//! left untouched. [ignore_all_space] and [ignore_space_change] implement the two conventional
//! whitespace modes.

use std::collections::HashMap;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          public types                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The unified diff of two texts; the return type of [diff] & [diff_with_options]
#[derive(Clone, Debug, Default)]
pub struct Unified {
    pub old_name: String,
    pub new_name: String,
    pub hunks: Vec<Hunk>,
}

impl Unified {
    /// True iff the two inputs compared equal (nothing to show)
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }
}

impl std::fmt::Display for Unified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.hunks.is_empty() {
            return Ok(());
        }
        writeln!(f, "diff {} {}", self.old_name, self.new_name)?;
        writeln!(f, "--- {}", self.old_name)?;
        writeln!(f, "+++ {}", self.new_name)?;
        for hunk in &self.hunks {
            writeln!(
                f,
                "@@ -{},{} +{},{} @@",
                hunk.line_old, hunk.count_old, hunk.line_new, hunk.count_new
            )?;
            for line in &hunk.lines {
                writeln!(f, "{}", line.value)?;
            }
        }
        Ok(())
    }
}

/// A single hunk of a [Unified] diff
///
/// `line_old`/`line_new` are 1-indexed; a side contributing zero lines reports its 0-indexed
/// insertion point instead (`0` for an empty file, per the usual unified-diff convention).
#[derive(Clone, Debug)]
pub struct Hunk {
    pub line_old: usize,
    pub count_old: usize,
    pub line_new: usize,
    pub count_new: usize,
    pub lines: Vec<HunkLine>,
}

/// Padding rows needed to align the two columns of a split-view rendering
#[derive(Clone, Debug, Default)]
pub struct SplitViewPaddings {
    /// line index within the hunk |-> number of blank rows to emit after it, old column
    pub red: HashMap<usize, usize>,
    /// ditto, new column
    pub green: HashMap<usize, usize>,
}

impl Hunk {
    /// Compute the padding each column of a split view needs so that paired insert/delete runs
    /// line up row-for-row, with the surplus side overflowing into blanks.
    pub fn split_view_paddings(&self) -> SplitViewPaddings {
        let mut paddings = SplitViewPaddings::default();
        let mut i = 0;
        while i < self.lines.len() {
            if self.lines[i].kind() == LineKind::Equal {
                i += 1;
                continue;
            }
            let (ins, del) = count_next_insert_delete(&self.lines[i..]);
            if ins > del {
                paddings.red.insert(i + del, ins - del);
            } else if del > ins {
                paddings.green.insert(i + ins, del - ins);
            }
            i += ins + del;
        }
        paddings
    }
}

/// Count the insertions & deletions at the head of `lines`, stopping at the first equal line
fn count_next_insert_delete(lines: &[HunkLine]) -> (usize, usize) {
    let (mut ins, mut del) = (0, 0);
    for line in lines {
        match line.kind() {
            LineKind::Insert => ins += 1,
            LineKind::Delete => del += 1,
            LineKind::Equal => break,
        }
    }
    (ins, del)
}

/// Classification of a [HunkLine] by its leading symbol
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineKind {
    Insert,
    Delete,
    Equal,
}

/// An individual line in a [Hunk]
///
/// `value` carries the leading `+`/`-`/` ` symbol; `number_x`/`number_y` are the 1-indexed line
/// numbers on the old & new sides, `None` on whichever side the line does not appear.
#[derive(Clone, Debug)]
pub struct HunkLine {
    pub number_x: Option<usize>,
    pub number_y: Option<usize>,
    pub value: String,
}

impl HunkLine {
    pub fn kind(&self) -> LineKind {
        match self.value.as_bytes().first() {
            Some(b'+') => LineKind::Insert,
            Some(b'-') => LineKind::Delete,
            _ => LineKind::Equal,
        }
    }
    pub fn symbol(&self) -> char {
        match self.kind() {
            LineKind::Insert => '+',
            LineKind::Delete => '-',
            LineKind::Equal => ' ',
        }
    }
    pub fn content(&self) -> &str {
        &self.value[1..]
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     options & normalizers                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A line normalization; maps each line to the form in which it is *compared*
pub type Normal = fn(&str) -> String;

/// Options accepted by [diff_with_options]
#[derive(Clone, Copy)]
pub struct Options {
    /// Equal lines of context to include around each change
    pub context: usize,
    /// Normalization applied to the comparison form of each line; display is unaffected
    pub normal: Option<Normal>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            context: 3,
            normal: None,
        }
    }
}

fn is_space_not_newline(c: char) -> bool {
    c.is_whitespace() && c != '\n'
}

/// diff's `-w`: whitespace is entirely ignored when comparing lines
pub fn ignore_all_space(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|&c| !is_space_not_newline(c))
        .collect()
}

/// diff's `-b`: trailing whitespace is ignored, interior runs compare equal to a single space,
/// and a line beginning with whitespace keeps a single leading space
pub fn ignore_space_change(s: &str) -> String {
    let trimmed = s.trim_end();
    let mut out = String::with_capacity(trimmed.len());
    if trimmed.chars().next().is_some_and(char::is_whitespace) {
        out.push(' ');
    }
    let mut first = true;
    for field in trimmed
        .split(is_space_not_newline)
        .filter(|f| !f.is_empty())
    {
        if !first {
            out.push(' ');
        }
        first = false;
        out.push_str(field);
    }
    out
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the algorithm                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Compute the anchored diff of `old` & `new` with three lines of context
pub fn diff(old_name: &str, old: &[u8], new_name: &str, new: &[u8]) -> Unified {
    diff_with_options(old_name, old, new_name, new, Options::default())
}

/// Compute the anchored diff of `old` & `new`
///
/// If the inputs are byte-equal the result carries no hunks. The operation is total: arbitrary
/// (non-UTF-8) bytes are accepted & rendered lossily.
pub fn diff_with_options(
    old_name: &str,
    old: &[u8],
    new_name: &str,
    new: &[u8],
    opts: Options,
) -> Unified {
    let mut u = Unified {
        old_name: old_name.to_owned(),
        new_name: new_name.to_owned(),
        hunks: Vec::new(),
    };
    if old == new {
        return u;
    }
    let (x_disp, x) = lines(old, opts.normal);
    let (y_disp, y) = lines(new, opts.normal);
    let ctx = opts.context;

    // Loop over the anchor matches, expanding each to the surrounding equal lines & emitting
    // diff chunks. tgs() brackets the sequence with {0,0} and {|x|,|y|} sentinels so there are
    // no special cases outside the loop.
    let mut done = (0usize, 0usize); // emitted up to x[..done.0] / y[..done.1]
    let mut chunk = (0usize, 0usize); // start lines of the open chunk
    let mut count = (0usize, 0usize); // lines from each side in the open chunk
    let mut ctext: Vec<HunkLine> = Vec::new();
    for m in tgs(&x, &y) {
        if m.0 < done.0 {
            // Already handled scanning forward from an earlier match.
            continue;
        }

        // Establish the maximal equal run x[start.0..end.0] == y[start.1..end.1] around m. On
        // the leading (and trailing) sentinel iterations the run may be empty.
        let mut start = m;
        while start.0 > done.0 && start.1 > done.1 && x[start.0 - 1] == y[start.1 - 1] {
            start.0 -= 1;
            start.1 -= 1;
        }
        let mut end = m;
        while end.0 < x.len() && end.1 < y.len() && x[end.0] == y[end.1] {
            end.0 += 1;
            end.1 += 1;
        }

        // The mismatched lines before the run belong to the open chunk.
        for s in &x_disp[done.0..start.0] {
            count.0 += 1;
            ctext.push(HunkLine {
                number_x: Some(chunk.0 + count.0),
                number_y: None,
                value: format!("-{s}"),
            });
        }
        for s in &y_disp[done.1..start.1] {
            count.1 += 1;
            ctext.push(HunkLine {
                number_x: None,
                number_y: Some(chunk.1 + count.1),
                value: format!("+{s}"),
            });
        }

        // If we're not at EOF and the equal run is too short to close the chunk, absorb it as
        // context & keep going.
        if (end.0 < x.len() || end.1 < y.len())
            && (end.0 - start.0 < ctx || (!ctext.is_empty() && end.0 - start.0 < 2 * ctx))
        {
            for s in &x_disp[start.0..end.0] {
                count.0 += 1;
                count.1 += 1;
                ctext.push(HunkLine {
                    number_x: Some(chunk.0 + count.0),
                    number_y: Some(chunk.1 + count.1),
                    value: format!(" {s}"),
                });
            }
            done = end;
            continue;
        }

        // Close the open chunk, appending up to `ctx` equal lines of trailing context.
        if !ctext.is_empty() {
            let n = (end.0 - start.0).min(ctx);
            for s in &x_disp[start.0..start.0 + n] {
                count.0 += 1;
                count.1 += 1;
                ctext.push(HunkLine {
                    number_x: Some(chunk.0 + count.0),
                    number_y: Some(chunk.1 + count.1),
                    value: format!(" {s}"),
                });
            }
            done = (start.0 + n, start.1 + n);

            // 1-index the start lines; a side with no lines keeps its 0-indexed position (an
            // empty file shows up as 0,0 rather than 1,0).
            if count.0 > 0 {
                chunk.0 += 1;
            }
            if count.1 > 0 {
                chunk.1 += 1;
            }
            u.hunks.push(Hunk {
                line_old: chunk.0,
                count_old: count.0,
                line_new: chunk.1,
                count_new: count.1,
                lines: std::mem::take(&mut ctext),
            });
            count = (0, 0);
        }

        if end.0 >= x.len() && end.1 >= y.len() {
            break;
        }

        // Open the next chunk, pre-filled with up to `ctx` lines of leading context. The branch
        // above guarantees end.0 - start.0 >= ctx here, so the subtraction can't wrap.
        chunk = (end.0 - ctx, end.1 - ctx);
        for s in &x_disp[chunk.0..end.0] {
            count.0 += 1;
            count.1 += 1;
            ctext.push(HunkLine {
                number_x: Some(chunk.0 + count.0),
                number_y: Some(chunk.1 + count.1),
                value: format!(" {s}"),
            });
        }
        done = end;
    }

    u
}

/// Split `x` into lines, returning (display forms, comparison forms)
///
/// If the input does not end in a newline, the display form of the final line gets the
/// conventional BSD/GNU marker appended (leading backslash included); normalization, when
/// given, applies to the comparison forms only.
fn lines(x: &[u8], normal: Option<Normal>) -> (Vec<String>, Vec<String>) {
    let text = String::from_utf8_lossy(x);
    let mut disp: Vec<String> = text.split('\n').map(str::to_owned).collect();
    if disp.last().is_some_and(|l| l.is_empty()) {
        disp.pop();
    } else if let Some(last) = disp.last_mut() {
        last.push_str("\n\\ No newline at end of file");
    }
    let cmp = match normal {
        None => disp.clone(),
        Some(f) => disp.iter().map(|s| f(s)).collect(),
    };
    (disp, cmp)
}

/// Return the longest common subsequence of *unique* lines in `x` & `y` as pairs of indexes,
/// bracketed by (0,0) and (|x|,|y|) sentinels
fn tgs(x: &[String], y: &[String]) -> Vec<(usize, usize)> {
    // Count occurrences per side; we only care about 0, 1, many, encoded as 0, -1, -2 for the x
    // side and 0, -4, -8 for the y side. Negative codes leave non-negative values free to hold
    // line indexes below.
    let mut m: HashMap<&String, i64> = HashMap::new();
    for s in x {
        let c = m.entry(s).or_insert(0);
        if *c > -2 {
            *c -= 1;
        }
    }
    for s in y {
        let c = m.entry(s).or_insert(0);
        if *c > -8 {
            *c -= 4;
        }
    }

    // A line unique on both sides now has code -5. Gather:
    //   xi[i] = increasing indexes of unique lines in x
    //   yi[j] = increasing indexes of unique lines in y
    //   inv[i] = j such that x[xi[i]] == y[yi[j]]
    let mut xi: Vec<usize> = Vec::new();
    let mut yi: Vec<usize> = Vec::new();
    let mut inv: Vec<usize> = Vec::new();
    for (i, s) in y.iter().enumerate() {
        if m.get(s) == Some(&-5) {
            m.insert(s, yi.len() as i64);
            yi.push(i);
        }
    }
    for (i, s) in x.iter().enumerate() {
        if let Some(&j) = m.get(s) {
            if j >= 0 {
                xi.push(i);
                inv.push(j as usize);
            }
        }
    }

    // Szymanski's Algorithm A, with A = J = inv and B = [0, n).
    let n = xi.len();
    let mut t = vec![n + 1; n];
    let mut l = vec![0usize; n];
    for i in 0..n {
        let k = t.partition_point(|&v| v < inv[i]);
        t[k] = inv[i];
        l[i] = k + 1;
    }
    let kmax = l.iter().copied().max().unwrap_or(0);

    let mut seq = vec![(0usize, 0usize); 2 + kmax];
    seq[1 + kmax] = (x.len(), y.len());
    let mut k = kmax;
    let mut lastj = n;
    for i in (0..n).rev() {
        if l[i] == k && inv[i] < lastj {
            seq[k] = (xi[i], yi[inv[i]]);
            lastj = inv[i];
            k -= 1;
        }
    }
    seq[0] = (0, 0);
    seq
}

#[cfg(test)]
mod tests {

    use super::*;

    /// Re-derive the new file by applying a [Unified] against the old; the tests' ground truth
    fn apply(old: &str, u: &Unified) -> String {
        let mut old_lines: Vec<&str> = old.split('\n').collect();
        if old_lines.last().is_some_and(|l| l.is_empty()) {
            old_lines.pop();
        }
        let mut out: Vec<String> = Vec::new();
        let mut idx = 0;
        for h in &u.hunks {
            let start = if h.count_old == 0 {
                h.line_old
            } else {
                h.line_old - 1
            };
            while idx < start {
                out.push(old_lines[idx].to_owned());
                idx += 1;
            }
            for line in &h.lines {
                match line.kind() {
                    LineKind::Equal => {
                        out.push(line.content().to_owned());
                        idx += 1;
                    }
                    LineKind::Delete => {
                        idx += 1;
                    }
                    LineKind::Insert => {
                        out.push(line.content().to_owned());
                    }
                }
            }
        }
        while idx < old_lines.len() {
            out.push(old_lines[idx].to_owned());
            idx += 1;
        }
        if out.is_empty() {
            return String::new();
        }
        let mut joined = out.join("\n");
        joined.push('\n');
        joined
    }

    #[test]
    fn identical_inputs_yield_no_hunks() {
        let u = diff("a", b"x\ny\n", "b", b"x\ny\n");
        assert!(u.is_empty());
        assert_eq!(u.to_string(), "");
    }

    #[test]
    fn simple_change() {
        let u = diff("a.txt", b"a\nb\nc\nd\n", "b.txt", b"a\nd\ne\n");
        let expected = concat!(
            "diff a.txt b.txt\n",
            "--- a.txt\n",
            "+++ b.txt\n",
            "@@ -1,4 +1,3 @@\n",
            " a\n",
            "-b\n",
            "-c\n",
            " d\n",
            "+e\n",
        );
        assert_eq!(u.to_string(), expected);
    }

    #[test]
    fn applying_the_diff_reconstructs_the_new_file() {
        let cases: &[(&str, &str)] = &[
            ("a\nb\nc\nd\n", "a\nd\ne\n"),
            ("", "one\ntwo\n"),
            ("one\ntwo\n", ""),
            ("x\n", "x\ny\nz\n"),
            (
                "fn main() {\n    foo();\n}\n",
                "fn main() {\n    foo();\n    bar();\n}\n",
            ),
            ("1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n", "1\nX\n3\n4\n5\n6\n7\n8\nY\n10\n"),
        ];
        for (old, new) in cases {
            for context in [0, 1, 3] {
                let u = diff_with_options(
                    "old",
                    old.as_bytes(),
                    "new",
                    new.as_bytes(),
                    Options {
                        context,
                        normal: None,
                    },
                );
                if old == new {
                    assert!(u.is_empty());
                } else {
                    assert_eq!(&apply(old, &u), new, "old={old:?} context={context}");
                }
            }
        }
    }

    #[test]
    fn hunk_counts_account_for_every_line() {
        let u = diff(
            "old",
            b"a\nb\nc\nd\ne\nf\ng\nh\n",
            "new",
            b"a\nB\nc\nd\ne\nf\nG\nh\n",
        );
        for h in &u.hunks {
            let old = h
                .lines
                .iter()
                .filter(|l| l.kind() != LineKind::Insert)
                .count();
            let new = h
                .lines
                .iter()
                .filter(|l| l.kind() != LineKind::Delete)
                .count();
            assert_eq!(h.count_old, old);
            assert_eq!(h.count_new, new);
        }
    }

    #[test]
    fn distant_changes_produce_separate_hunks() {
        let old = b"A\n1\n2\n3\n4\n5\n6\n7\n8\n9\nB\n";
        let new = b"a\n1\n2\n3\n4\n5\n6\n7\n8\n9\nb\n";
        // Nine equal lines between the changes: more than 2*3, so two hunks at the default
        // context...
        let u = diff("old", old, "new", new);
        assert_eq!(u.hunks.len(), 2);
        // ...but a single merged hunk once the context grows past half the gap.
        let u = diff_with_options(
            "old",
            old,
            "new",
            new,
            Options {
                context: 5,
                normal: None,
            },
        );
        assert_eq!(u.hunks.len(), 1);
    }

    #[test]
    fn line_numbers_track_each_side() {
        let u = diff("old", b"a\nb\nc\n", "new", b"a\nc\n");
        let h = &u.hunks[0];
        assert_eq!((h.line_old, h.count_old, h.line_new, h.count_new), (1, 3, 1, 2));
        let deleted = h
            .lines
            .iter()
            .find(|l| l.kind() == LineKind::Delete)
            .unwrap();
        assert_eq!(deleted.number_x, Some(2));
        assert_eq!(deleted.number_y, None);
    }

    #[test]
    fn missing_trailing_newline_is_marked() {
        let u = diff("old", b"a\nb", "new", b"a\nc");
        let text = u.to_string();
        assert!(text.contains("\\ No newline at end of file"));
        // The marker belongs to the display form only; equal final lines still compare equal.
        let u = diff("old", b"a\nb", "new", b"a\nb");
        assert!(u.is_empty());
    }

    #[test]
    fn ignore_all_space_mode() {
        let old = b"a b\nnext\n";
        let new = b"ab\nnext\n";
        assert!(!diff("old", old, "new", new).is_empty());
        let u = diff_with_options(
            "old",
            old,
            "new",
            new,
            Options {
                context: 3,
                normal: Some(ignore_all_space),
            },
        );
        assert!(u.is_empty());
    }

    #[test]
    fn ignore_space_change_mode() {
        let opts = Options {
            context: 3,
            normal: Some(ignore_space_change),
        };
        // Trailing whitespace & interior runs are collapsed...
        let u = diff_with_options("old", b"a  b \n", "new", b"a b\n", opts);
        assert!(u.is_empty());
        // ...but introducing leading whitespace is still a change,
        let u = diff_with_options("old", b"ab\n", "new", b"  ab\n", opts);
        assert!(!u.is_empty());
        // while *changing* the amount of leading whitespace is not.
        let u = diff_with_options("old", b" ab\n", "new", b"   ab\n", opts);
        assert!(u.is_empty());
    }

    #[test]
    fn display_form_survives_normalization() {
        let u = diff_with_options(
            "old",
            b"keep  spacing\ngone\n",
            "new",
            b"keep spacing\ngone\nnew\n",
            Options {
                context: 3,
                normal: Some(ignore_all_space),
            },
        );
        // "keep  spacing" compares equal to "keep spacing", and the emitted context line shows
        // the old side's original bytes.
        let text = u.to_string();
        assert!(text.contains(" keep  spacing\n"));
        assert!(text.contains("+new\n"));
    }

    #[test]
    fn split_view_paddings_align_unbalanced_runs() {
        // 2 deletions paired with 1 insertion: the green column needs one blank after the
        // insertion row.
        let u = diff("old", b"a\nb\nc\nz\n", "new", b"a\nq\nz\n");
        let h = &u.hunks[0];
        let pad = h.split_view_paddings();
        assert!(pad.red.is_empty());
        assert_eq!(pad.green.len(), 1);
        assert_eq!(pad.green.values().copied().sum::<usize>(), 1);
    }

    #[test]
    fn anchors_are_unique_lines_only() {
        // The blank line appears repeatedly on both sides; an anchored diff must not match
        // through it, so the two functions move as units.
        let old = b"fn a() {\n}\n\nfn b() {\n}\n";
        let new = b"fn b() {\n}\n\nfn c() {\n}\n";
        let u = diff_with_options(
            "old",
            old,
            "new",
            new,
            Options {
                context: 0,
                normal: None,
            },
        );
        assert_eq!(
            apply(std::str::from_utf8(old).unwrap(), &u),
            std::str::from_utf8(new).unwrap()
        );
    }
}
