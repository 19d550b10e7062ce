//! Breakpoint set
//!
//! Breakpoints are identified by `(file, line)`; the function name is what the
//! probe installer and the frame processor actually use. Disabled breakpoints
//! stay in the set (and on disk) but are never installed and never match.
//!
//! The set persists per project in `.debug_breakpoints.json`.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::domain::{BreakpointError, BreakpointId};

/// File name of the persisted set, relative to the project root
pub const BREAKPOINTS_FILE: &str = ".debug_breakpoints.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub function: String,
    pub enabled: bool,
}

/// One probe to install: a function and the breakpoint id it reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub function: String,
    pub breakpoint_id: BreakpointId,
}

/// Result of [`BreakpointSet::add`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added(Breakpoint),
    /// `(file, line)` already existed; its enabled flag was flipped
    Toggled(Breakpoint),
}

#[derive(Debug, Clone, Default)]
pub struct BreakpointSet {
    entries: BTreeMap<(String, u32), Breakpoint>,
    next_id: u32,
}

#[derive(Serialize, Deserialize)]
struct PersistedBreakpoints {
    #[serde(default)]
    next_id: u32,
    breakpoints: Vec<Breakpoint>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a breakpoint, or toggle the existing one at `(file, line)`
    ///
    /// Without an explicit `function`, the name is inferred from the C source
    /// at `file`. An unreadable file leaves the function empty.
    pub fn add(&mut self, file: &str, line: u32, function: Option<&str>) -> AddOutcome {
        let key = (file.to_string(), line);
        if let Some(existing) = self.entries.get_mut(&key) {
            existing.enabled = !existing.enabled;
            debug!("Toggled existing breakpoint {}:{} -> {}", file, line, existing.enabled);
            return AddOutcome::Toggled(existing.clone());
        }

        let function = match function {
            Some(name) => name.to_string(),
            None => infer_function_from_file(Path::new(file), line).unwrap_or_default(),
        };

        self.next_id = self.next_id.max(1);
        let breakpoint =
            Breakpoint { id: BreakpointId(self.next_id), file: key.0.clone(), line, function, enabled: true };
        self.next_id += 1;
        self.entries.insert(key, breakpoint.clone());
        AddOutcome::Added(breakpoint)
    }

    /// # Errors
    /// Returns `BreakpointError::NotFound` if nothing is set at `(file, line)`
    pub fn remove(&mut self, file: &str, line: u32) -> Result<Breakpoint, BreakpointError> {
        self.entries
            .remove(&(file.to_string(), line))
            .ok_or_else(|| BreakpointError::NotFound { file: file.to_string(), line })
    }

    /// Flip the enabled flag, returning the new value
    ///
    /// # Errors
    /// Returns `BreakpointError::NotFound` if nothing is set at `(file, line)`
    pub fn toggle(&mut self, file: &str, line: u32) -> Result<bool, BreakpointError> {
        let breakpoint = self
            .entries
            .get_mut(&(file.to_string(), line))
            .ok_or_else(|| BreakpointError::NotFound { file: file.to_string(), line })?;
        breakpoint.enabled = !breakpoint.enabled;
        Ok(breakpoint.enabled)
    }

    /// All breakpoints ordered by `(file, line)`
    pub fn list(&self) -> Vec<Breakpoint> {
        self.entries.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_enabled(&self) -> bool {
        self.entries.values().any(|bp| bp.enabled && !bp.function.is_empty())
    }

    /// Deduplicated probe targets, sorted by function name
    ///
    /// When several enabled breakpoints share a function, the one with the
    /// lowest `(file, line)` supplies the id.
    pub fn probe_targets(&self) -> Vec<ProbeTarget> {
        let mut by_function: BTreeMap<&str, BreakpointId> = BTreeMap::new();
        for bp in self.entries.values().filter(|bp| bp.enabled && !bp.function.is_empty()) {
            by_function.entry(bp.function.as_str()).or_insert(bp.id);
        }
        by_function
            .into_iter()
            .map(|(function, breakpoint_id)| ProbeTarget { function: function.to_string(), breakpoint_id })
            .collect()
    }

    /// Immutable view handed to the frame processor
    pub fn snapshot(&self) -> BreakpointSnapshot {
        BreakpointSnapshot(Arc::new(self.list()))
    }

    /// Load `<project>/.debug_breakpoints.json`; a missing file is an empty set
    ///
    /// Duplicate ids in a hand-edited file are reassigned.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed
    pub fn load(project_root: &Path) -> Result<Self, BreakpointError> {
        let path = project_root.join(BREAKPOINTS_FILE);
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(&path)?;
        let persisted: PersistedBreakpoints = serde_json::from_str(&content)?;

        let max_id = persisted.breakpoints.iter().map(|bp| bp.id.0).max().unwrap_or(0);
        let mut set = Self { entries: BTreeMap::new(), next_id: persisted.next_id.max(max_id + 1) };
        let mut seen = std::collections::BTreeSet::new();
        for mut bp in persisted.breakpoints {
            if !seen.insert(bp.id) {
                bp.id = BreakpointId(set.next_id);
                set.next_id += 1;
                seen.insert(bp.id);
            }
            set.entries.insert((bp.file.clone(), bp.line), bp);
        }
        info!("✓ Loaded {} breakpoints from {}", set.len(), path.display());
        Ok(set)
    }

    /// # Errors
    /// Returns an error if the file cannot be written
    pub fn save(&self, project_root: &Path) -> Result<(), BreakpointError> {
        let persisted = PersistedBreakpoints { next_id: self.next_id, breakpoints: self.list() };
        let json = serde_json::to_string_pretty(&persisted)?;
        fs::write(project_root.join(BREAKPOINTS_FILE), json)?;
        Ok(())
    }
}

/// Shared, immutable breakpoint list ordered by `(file, line)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakpointSnapshot(Arc<Vec<Breakpoint>>);

impl BreakpointSnapshot {
    pub fn from_breakpoints(mut breakpoints: Vec<Breakpoint>) -> Self {
        breakpoints.sort_by(|a, b| (&a.file, a.line).cmp(&(&b.file, b.line)));
        Self(Arc::new(breakpoints))
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.0
    }

    /// Enabled breakpoint for `function` with the lowest `(file, line)`
    ///
    /// Breakpoints without a function name never match.
    pub fn find_by_function(&self, function: &str) -> Option<&Breakpoint> {
        self.0.iter().find(|bp| bp.enabled && !bp.function.is_empty() && bp.function == function)
    }
}

// ============================================================================
// Function name inference from C source
// ============================================================================

const C_KEYWORDS: &[&str] = &[
    "if", "else", "while", "for", "do", "switch", "case", "return", "break", "continue", "sizeof",
    "typedef", "struct", "union", "enum", "goto", "default",
];

/// Read `path` and infer the enclosing function of `line` (1-based)
pub fn infer_function_from_file(path: &Path, line: u32) -> Option<String> {
    let source = fs::read_to_string(path).ok()?;
    infer_function(&source, line)
}

/// Scan upward from `line` for the nearest C function definition
///
/// Blank and comment lines are skipped; a line closing a block without opening
/// one ends the search, since it belongs to a previous function.
pub fn infer_function(source: &str, line: u32) -> Option<String> {
    let lines: Vec<&str> = source.lines().collect();
    let line = line as usize;
    if line == 0 || line > lines.len() {
        return None;
    }

    for raw in lines[..line].iter().rev() {
        let text = raw.trim();
        if text.is_empty() || text.starts_with("//") || text.starts_with("/*") || text.starts_with('*')
        {
            continue;
        }
        if let Some(name) = function_definition_name(text) {
            return Some(name);
        }
        if text.contains('}') && !text.contains('{') {
            break;
        }
    }
    None
}

/// `static int foo(` / `void *bar(` / `baz(` → the identifier before `(`
fn function_definition_name(text: &str) -> Option<String> {
    if text.ends_with(';') || text.starts_with('#') {
        return None;
    }
    let paren = text.find('(')?;
    let before = text[..paren].trim_end();
    let word = before.split_whitespace().last()?.trim_start_matches('*');
    let valid = !word.is_empty()
        && word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !word.starts_with(|c: char| c.is_ascii_digit())
        && !C_KEYWORDS.contains(&word);
    valid.then(|| word.to_string())
}
