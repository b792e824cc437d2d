// src/core/patch.rs — Structural validation and extraction of unified diffs
//
// Validation never touches the filesystem. A patch that fails here is never
// handed to the tool manager.

use std::fmt;

const BEGIN_MARKER: &str = "BEGIN_PATCH";
const END_MARKER: &str = "END_PATCH";

/// Git extended header lines that may appear between file sections.
const EXTENDED_HEADERS: &[&str] = &[
    "diff ",
    "index ",
    "new file mode",
    "deleted file mode",
    "old mode",
    "new mode",
    "similarity index",
    "dissimilarity index",
    "rename from",
    "rename to",
    "copy from",
    "copy to",
    "Binary files",
];

/// First structural check a patch failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchRejection {
    Empty,
    MissingDiffHeader,
    MissingFileHeaders,
    MissingHunk,
    MalformedHunkRange { line: usize, text: String },
    UnexpectedLine { line: usize, text: String },
}

impl fmt::Display for PatchRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchRejection::Empty => write!(f, "patch is empty"),
            PatchRejection::MissingDiffHeader => write!(f, "no diff header found"),
            PatchRejection::MissingFileHeaders => {
                write!(f, "missing paired '--- ' / '+++ ' file headers")
            }
            PatchRejection::MissingHunk => write!(f, "no hunk header found"),
            PatchRejection::MalformedHunkRange { line, text } => {
                write!(f, "malformed hunk range on line {line}: {text}")
            }
            PatchRejection::UnexpectedLine { line, text } => {
                write!(f, "unexpected line {line} inside hunk: {text}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchVerdict {
    Valid,
    Invalid(PatchRejection),
}

impl PatchVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, PatchVerdict::Valid)
    }
}

/// Parsed `@@ -a,b +c,d @@` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkRange {
    pub old_start: u32,
    pub old_len: u32,
    pub new_start: u32,
    pub new_len: u32,
}

/// Checks run in order; the first failure determines the reason.
pub fn validate_patch(text: &str) -> PatchVerdict {
    use PatchRejection::*;

    if text.trim().is_empty() {
        return PatchVerdict::Invalid(Empty);
    }

    let lines: Vec<&str> = text.lines().collect();

    let first = lines
        .iter()
        .map(|l| l.trim_start())
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if !(first.starts_with("diff ") || first.starts_with("--- ")) {
        return PatchVerdict::Invalid(MissingDiffHeader);
    }

    let paired = lines
        .windows(2)
        .any(|w| w[0].starts_with("--- ") && w[1].starts_with("+++ "));
    if !paired {
        return PatchVerdict::Invalid(MissingFileHeaders);
    }

    let mut saw_hunk = false;
    for (idx, line) in lines.iter().enumerate() {
        if line.starts_with("@@") {
            if parse_hunk_header(line).is_none() {
                return PatchVerdict::Invalid(MalformedHunkRange {
                    line: idx + 1,
                    text: line.to_string(),
                });
            }
            saw_hunk = true;
        }
    }
    if !saw_hunk {
        return PatchVerdict::Invalid(MissingHunk);
    }

    for (idx, line) in lines.iter().enumerate() {
        if !is_diff_line(line) {
            return PatchVerdict::Invalid(UnexpectedLine {
                line: idx + 1,
                text: line.to_string(),
            });
        }
    }

    PatchVerdict::Valid
}

pub fn is_valid_patch(text: &str) -> bool {
    validate_patch(text).is_valid()
}

fn is_diff_line(line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    if matches!(line.as_bytes()[0], b' ' | b'+' | b'-' | b'\\' | b'@') {
        return true;
    }
    EXTENDED_HEADERS.iter().any(|h| line.starts_with(h))
}

pub fn parse_hunk_header(line: &str) -> Option<HunkRange> {
    let rest = line.strip_prefix("@@ ")?;
    let end = rest.find(" @@")?;
    let mut parts = rest[..end].split(' ');
    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;
    if parts.next().is_some() {
        return None;
    }
    let (old_start, old_len) = parse_range(old)?;
    let (new_start, new_len) = parse_range(new)?;
    Some(HunkRange {
        old_start,
        old_len,
        new_start,
        new_len,
    })
}

fn parse_range(s: &str) -> Option<(u32, u32)> {
    match s.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((s.parse().ok()?, 1)),
    }
}

/// Pull a patch out of a developer response.
///
/// Text between `BEGIN_PATCH` / `END_PATCH` wins; otherwise the response is
/// scanned for a raw unified diff. Markdown fences are dropped.
pub fn extract_patch(response: &str) -> Option<String> {
    let body = if let Some(start) = response.find(BEGIN_MARKER) {
        let after = &response[start + BEGIN_MARKER.len()..];
        match after.find(END_MARKER) {
            Some(end) => &after[..end],
            None => after,
        }
    } else if let Some(start) = find_line_start(response, "diff ") {
        &response[start..]
    } else if let Some(start) = find_line_start(response, "--- ") {
        if !response[start..].contains("@@") {
            return None;
        }
        &response[start..]
    } else {
        return None;
    };

    let mut out = String::new();
    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    let trimmed = out.trim_matches('\n');
    if trimmed.trim().is_empty() {
        return None;
    }
    Some(format!("{trimmed}\n"))
}

fn find_line_start(text: &str, prefix: &str) -> Option<usize> {
    if text.starts_with(prefix) {
        return Some(0);
    }
    text.match_indices('\n')
        .map(|(i, _)| i + 1)
        .find(|&i| text[i..].starts_with(prefix))
}

/// Paths touched by a patch, from its `+++` headers (or `---` for deletions).
pub fn changed_files(patch: &str) -> Vec<String> {
    let mut files = Vec::new();
    let mut old_path: Option<&str> = None;
    for line in patch.lines() {
        if let Some(p) = line.strip_prefix("--- ") {
            old_path = Some(strip_prefix_dir(p));
        } else if let Some(p) = line.strip_prefix("+++ ") {
            let new_path = strip_prefix_dir(p);
            let path = if new_path == "/dev/null" {
                old_path.unwrap_or(new_path)
            } else {
                new_path
            };
            if path != "/dev/null" && !files.iter().any(|f| f == path) {
                files.push(path.to_string());
            }
            old_path = None;
        }
    }
    files
}

fn strip_prefix_dir(path: &str) -> &str {
    let path = path.split('\t').next().unwrap_or(path).trim();
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}
