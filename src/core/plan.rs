// src/core/plan.rs — Planner output parsing
//
// Turns free-form planner text into ordered plan entries. Numbered lines
// ("1." / "1)"), "Step N:" lines and top-level bullets start entries;
// indented or trailing lines attach to the entry above as detail.

use serde::{Deserialize, Serialize};

use crate::core::types::{ActionType, Step};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub description: String,
    pub details: Vec<String>,
    pub files: Vec<String>,
    pub action: ActionType,
}

impl PlanEntry {
    fn new(description: &str) -> Self {
        Self {
            description: description.trim().to_string(),
            details: Vec::new(),
            files: Vec::new(),
            action: ActionType::Other,
        }
    }

    /// Full text handed to the developer for this entry.
    pub fn instruction(&self) -> String {
        if self.details.is_empty() {
            return self.description.clone();
        }
        format!("{}\n{}", self.description, self.details.join("\n"))
    }

    pub fn into_step(self, step_number: u32) -> Step {
        let instruction = self.instruction();
        let mut step = Step::new(step_number, instruction);
        step.action = self.action;
        step.files = self.files;
        step
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanParseError {
    Empty,
    NoSteps,
}

impl std::fmt::Display for PlanParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanParseError::Empty => write!(f, "plan is empty"),
            PlanParseError::NoSteps => write!(f, "no ordered steps found in plan"),
        }
    }
}

impl std::error::Error for PlanParseError {}

pub fn parse_plan(text: &str) -> Result<Vec<PlanEntry>, PlanParseError> {
    if text.trim().is_empty() {
        return Err(PlanParseError::Empty);
    }

    // If the plan numbers its steps, bullets are sub-points of those steps.
    let numbered = text.lines().any(|l| numbered_item(l.trim()).is_some());

    let mut entries: Vec<PlanEntry> = Vec::new();
    let mut in_fence = false;
    for raw in text.lines() {
        let line = raw.trim();
        if line.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || line.is_empty() || line.starts_with('#') {
            continue;
        }
        let indented = raw.starts_with(' ') || raw.starts_with('\t');

        let start = if numbered {
            numbered_item(line)
        } else if !indented {
            bullet_item(line)
        } else {
            None
        };

        match (start, entries.last_mut()) {
            (Some(desc), _) if !desc.is_empty() => entries.push(PlanEntry::new(desc)),
            (_, Some(current)) => attach_detail(current, line),
            _ => {}
        }
    }

    if entries.is_empty() {
        return Err(PlanParseError::NoSteps);
    }

    for entry in &mut entries {
        entry.action = detect_action(&entry.description);
        let mut files = extract_files(&entry.description);
        files.append(&mut entry.files);
        dedup_in_order(&mut files);
        entry.files = files;
    }
    Ok(entries)
}

/// "1. foo", "2) foo", "Step 3: foo", "Étape 4 - foo"
fn numbered_item(line: &str) -> Option<&str> {
    let line = line.trim_start_matches(['*', '_']);
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        let rest = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')'))?;
        if rest.starts_with(' ') {
            return Some(clean_title(rest));
        }
        return None;
    }

    let lower = line.to_lowercase();
    for keyword in ["step ", "étape ", "etape "] {
        if let Some(rest) = lower.strip_prefix(keyword) {
            let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
            if digits == 0 {
                continue;
            }
            // Byte offsets differ between `lower` and `line` only for É.
            let offset = line.len() - rest.len() + digits;
            let tail = line.get(offset..)?;
            let tail = tail.trim_start_matches([':', '.', '-', ')', ' ', '*']);
            return Some(clean_title(tail));
        }
    }
    None
}

fn bullet_item(line: &str) -> Option<&str> {
    ["- ", "* ", "+ "]
        .iter()
        .find_map(|b| line.strip_prefix(b))
        .map(clean_title)
}

fn clean_title(s: &str) -> &str {
    s.trim().trim_matches('*').trim()
}

fn attach_detail(entry: &mut PlanEntry, line: &str) {
    let body = line.trim_start_matches(['-', '*', '+', ' ']);
    let lower = body.to_lowercase();
    for label in ["files:", "fichiers:", "file:"] {
        if lower.starts_with(label) {
            let list = &body[label.len()..];
            entry.files.extend(
                list.split(',')
                    .map(|f| f.trim().trim_matches('`').to_string())
                    .filter(|f| !f.is_empty()),
            );
            return;
        }
    }
    entry.files.extend(extract_files(body));
    entry.details.push(body.to_string());
}

/// Path-like tokens: `backticked` or bare words with an extension or a slash.
fn extract_files(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')')
        .map(|t| t.trim_matches(|c: char| c == '`' || c == '"' || c == '\'' || c == ':'))
        .map(|t| t.trim_end_matches('.'))
        .filter(|t| looks_like_path(t))
        .map(str::to_string)
        .collect()
}

fn looks_like_path(token: &str) -> bool {
    if token.len() < 3 || token.starts_with("http") || token.contains("..") {
        return false;
    }
    let name = token.rsplit('/').next().unwrap_or(token);
    match name.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
                && !ext.chars().all(|c| c.is_ascii_digit())
        }
        None => token.ends_with('/') && token.len() > 1,
    }
}

fn dedup_in_order(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|f| seen.insert(f.clone()));
}

pub fn detect_action(description: &str) -> ActionType {
    let d = description.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| d.contains(w));

    if has(&["create", "créer", "generate", "make"])
        && has(&[
            "model",
            "controller",
            "service",
            "file",
            "fichier",
            ".php",
            ".js",
            ".py",
        ])
    {
        return ActionType::CreateFile;
    }
    if has(&["modify", "update", "edit", "change", "adjust", "amend", "add", "ajouter"]) {
        return ActionType::ModifyFile;
    }
    if has(&["delete", "remove", "supprimer", "drop"]) {
        return ActionType::DeleteFile;
    }
    if has(&["test", "pytest", "phpunit", "pest"]) {
        return ActionType::RunTests;
    }
    if has(&["install", "require", "composer", "npm", "pip", "package"]) {
        return ActionType::InstallPackage;
    }
    if has(&["configure", "setup", "set up", "config"]) {
        return ActionType::Configure;
    }
    if has(&["debug", "fix", "resolve", "bug"]) {
        return ActionType::Debug;
    }
    if has(&["refactor", "clean up", "simplify"]) {
        return ActionType::Refactor;
    }
    ActionType::Other
}
