//! Conversation state - turns, context budget, persistence
//!
//! A conversation is an ordered, append-only list of role-tagged turns plus
//! a system preamble that is sent with every request. Payloads handed to the
//! backend are bounded by a token budget; the oldest turns fall out first.
//!
//! Saved sessions are single JSON documents:
//! `{"format": "shellmind-session", "version": 1, "turns": [...]}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use unicode_width::UnicodeWidthChar;

use crate::error::PersistError;

const SESSION_FORMAT: &str = "shellmind-session";
const SESSION_VERSION: u32 = 1;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Assistant reply cut short by the user
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            partial: false,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn partial_assistant(text: impl Into<String>) -> Self {
        Self {
            partial: true,
            ..Self::assistant(text)
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// TOKEN ESTIMATION
// ═══════════════════════════════════════════════════════════════

/// Per-message overhead (role tag, delimiters)
pub const TURN_OVERHEAD: usize = 4;

/// Pluggable token accounting
pub trait TokenEstimator: Send + Sync {
    /// Estimated tokens for a piece of text
    fn estimate(&self, text: &str) -> usize;

    /// Estimated tokens for a whole turn including framing
    fn turn_cost(&self, turn: &Turn) -> usize {
        self.estimate(&turn.text) + TURN_OVERHEAD
    }

    /// Longest prefix of `text` whose estimate fits in `max_tokens`
    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if self.estimate(text) <= max_tokens {
            return text.to_string();
        }
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();

        // Binary search over char boundaries for the longest fitting prefix
        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if self.estimate(&text[..boundaries[mid]]) <= max_tokens {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        text[..boundaries[lo]].to_string()
    }
}

/// Character-count estimator (~4 chars per token)
#[derive(Debug, Clone, Copy)]
pub struct CharEstimator {
    pub chars_per_token: usize,
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> usize {
        let per = self.chars_per_token.max(1);
        // Round up so short strings never count as free
        (text.chars().count() + per - 1) / per
    }
}

// ═══════════════════════════════════════════════════════════════
// CONVERSATION
// ═══════════════════════════════════════════════════════════════

/// Ordered turn history with a bounded payload view
pub struct Conversation {
    preamble: Option<String>,
    turns: Vec<Turn>,
    budget: usize,
    estimator: Box<dyn TokenEstimator>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("turns", &self.turns.len())
            .field("budget", &self.budget)
            .finish()
    }
}

impl Conversation {
    pub fn new(budget: usize) -> Self {
        Self {
            preamble: None,
            turns: Vec::new(),
            budget,
            estimator: Box::new(CharEstimator::default()),
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        let text = preamble.into();
        self.preamble = (!text.trim().is_empty()).then_some(text);
        self
    }

    pub fn with_estimator(mut self, estimator: impl TokenEstimator + 'static) -> Self {
        self.estimator = Box::new(estimator);
        self
    }

    pub fn preamble(&self) -> Option<&str> {
        self.preamble.as_deref()
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Append a turn
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Append several turns in order
    pub fn extend(&mut self, turns: impl IntoIterator<Item = Turn>) {
        self.turns.extend(turns);
    }

    /// Drop all turns (the preamble stays)
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Replace the history wholesale (after a successful load)
    pub fn replace(&mut self, turns: Vec<Turn>) {
        self.turns = turns;
    }

    /// Turns to send with the next request, oldest first.
    ///
    /// `pending` are turns staged for this request but not yet committed;
    /// they are treated as the newest part of the history. The preamble is
    /// not included in the result, only charged against the budget.
    ///
    /// Budget goes first to the newest user turn, then to system turns
    /// (newest first), then to chat turns walking back from the newest.
    /// Chat selection stops at the first turn that does not fit, so the
    /// oldest chat is what gets evicted.
    pub fn assemble_payload(&self, pending: &[Turn]) -> Vec<Turn> {
        let all: Vec<&Turn> = self.turns.iter().chain(pending.iter()).collect();
        if all.is_empty() {
            return Vec::new();
        }

        let est = self.estimator.as_ref();
        let preamble_cost = self
            .preamble
            .as_deref()
            .map(|p| est.estimate(p) + TURN_OVERHEAD)
            .unwrap_or(0);
        let mut remaining = self.budget.saturating_sub(preamble_cost);

        // The newest user turn always goes out, shortened if it must be
        let anchor = all.iter().rposition(|t| t.role == Role::User);
        let mut anchor_turn = None;
        if let Some(idx) = anchor {
            let turn = all[idx];
            let cost = est.turn_cost(turn);
            if cost <= remaining {
                remaining -= cost;
                anchor_turn = Some(turn.clone());
            } else {
                let room = remaining.saturating_sub(TURN_OVERHEAD);
                let text = est.truncate(&turn.text, room);
                tracing::debug!(
                    original = turn.text.len(),
                    kept = text.len(),
                    "truncating newest user turn to fit context budget"
                );
                remaining = 0;
                anchor_turn = Some(Turn {
                    text,
                    ..turn.clone()
                });
            }
        }

        let mut kept = vec![false; all.len()];
        let mut replaced: Vec<(usize, Turn)> = Vec::new();
        if let (Some(idx), Some(turn)) = (anchor, anchor_turn) {
            kept[idx] = true;
            replaced.push((idx, turn));
        }

        // System turns carry command output; they outrank chat history.
        // The newest one is shortened rather than dropped.
        let mut newest_system = true;
        for idx in (0..all.len()).rev() {
            if kept[idx] || all[idx].role != Role::System {
                continue;
            }
            let turn = all[idx];
            let cost = est.turn_cost(turn);
            if cost <= remaining {
                remaining -= cost;
                kept[idx] = true;
            } else if newest_system && remaining > TURN_OVERHEAD {
                let text = est.truncate(&turn.text, remaining - TURN_OVERHEAD);
                tracing::debug!(
                    original = turn.text.len(),
                    kept = text.len(),
                    "truncating newest system turn to fit context budget"
                );
                remaining = 0;
                kept[idx] = true;
                replaced.push((idx, Turn { text, ..turn.clone() }));
            }
            newest_system = false;
        }

        // Chat turns fill what is left, newest first, up to the first misfit
        for idx in (0..all.len()).rev() {
            if kept[idx] || all[idx].role == Role::System {
                continue;
            }
            let cost = est.turn_cost(all[idx]);
            if cost > remaining {
                break;
            }
            remaining -= cost;
            kept[idx] = true;
        }

        let payload: Vec<Turn> = all
            .iter()
            .enumerate()
            .filter(|(idx, _)| kept[*idx])
            .map(|(idx, turn)| {
                replaced
                    .iter()
                    .find(|(r, _)| *r == idx)
                    .map(|(_, t)| t.clone())
                    .unwrap_or_else(|| (*turn).clone())
            })
            .collect();

        let evicted = all.len() - payload.len();
        if evicted > 0 {
            tracing::debug!(evicted, budget = self.budget, "evicted oldest turns from payload");
        }
        payload
    }

    /// Estimated size of a payload including the preamble
    pub fn payload_cost(&self, payload: &[Turn]) -> usize {
        let preamble = self
            .preamble
            .as_deref()
            .map(|p| self.estimator.estimate(p) + TURN_OVERHEAD)
            .unwrap_or(0);
        preamble + payload.iter().map(|t| self.estimator.turn_cost(t)).sum::<usize>()
    }

    /// Save the history to `path` atomically
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        save_turns(path, &self.turns)
    }

    /// Load turns from `path` and replace the history. On failure the
    /// in-memory history is left as it was.
    pub fn restore(&mut self, path: &Path) -> Result<usize, PersistError> {
        let turns = load_turns(path)?;
        let count = turns.len();
        self.replace(turns);
        Ok(count)
    }

    /// One line per turn, each fitting in `width` columns (for `!history`)
    pub fn summary_lines(&self, width: usize) -> Vec<String> {
        self.turns
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let prefix = format!("{:>3}. {:<9} ", i + 1, t.role.as_str());
                let flat = t.text.replace('\n', " ");
                let room = width.saturating_sub(prefix.len());
                let mut line = prefix;
                line.push_str(&truncate_width(&flat, room));
                if t.partial {
                    line.push_str(" [partial]");
                }
                line
            })
            .collect()
    }
}

/// Truncate to at most `width` display columns, marking the cut with `...`
pub fn truncate_width(text: &str, width: usize) -> String {
    let total: usize = text.chars().map(|c| c.width().unwrap_or(0)).sum();
    if total <= width {
        return text.to_string();
    }
    let limit = width.saturating_sub(3);
    let mut used = 0;
    let mut out = String::new();
    for c in text.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > limit {
            break;
        }
        used += w;
        out.push(c);
    }
    out.push_str("...");
    out
}

// ═══════════════════════════════════════════════════════════════
// PERSISTENCE
// ═══════════════════════════════════════════════════════════════

/// On-disk session document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSession {
    pub format: String,
    pub version: u32,
    pub id: String,
    pub saved_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
}

impl SavedSession {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            format: SESSION_FORMAT.to_string(),
            version: SESSION_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            saved_at: Utc::now(),
            turns,
        }
    }
}

/// Write turns as a session document (temp file + rename)
pub fn save_turns(path: &Path, turns: &[Turn]) -> Result<(), PersistError> {
    let write_err = |source| PersistError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let doc = SavedSession::new(turns.to_vec());
    let content = serde_json::to_string_pretty(&doc)
        .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "session".to_string());
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp_path, content).map_err(write_err)?;
    fs::rename(&tmp_path, path).map_err(write_err)?;

    tracing::info!(path = %path.display(), turns = turns.len(), "session saved");
    Ok(())
}

/// Read turns from a session document
pub fn load_turns(path: &Path) -> Result<Vec<Turn>, PersistError> {
    let content = fs::read_to_string(path).map_err(|source| PersistError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let corrupt = |reason: String| PersistError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let doc: SavedSession = serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;
    if doc.format != SESSION_FORMAT {
        return Err(corrupt(format!("unexpected format tag `{}`", doc.format)));
    }
    if doc.version != SESSION_VERSION {
        return Err(corrupt(format!("unsupported version {}", doc.version)));
    }

    tracing::info!(path = %path.display(), turns = doc.turns.len(), "session loaded");
    Ok(doc.turns)
}

/// Listing entry for saved sessions
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub name: String,
    pub path: PathBuf,
    pub saved_at: DateTime<Utc>,
    pub turns: usize,
}

/// List saved sessions in `dir`, newest first. Unreadable files are skipped.
pub fn list_saved(dir: &Path) -> Vec<SessionInfo> {
    let mut sessions: Vec<SessionInfo> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|x| x == "json").unwrap_or(false))
                .filter_map(|path| {
                    let content = fs::read_to_string(&path).ok()?;
                    let doc: SavedSession = serde_json::from_str(&content).ok()?;
                    let name = path.file_stem()?.to_string_lossy().to_string();
                    (doc.format == SESSION_FORMAT).then(|| SessionInfo {
                        name,
                        saved_at: doc.saved_at,
                        turns: doc.turns.len(),
                        path,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    sessions.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
    sessions
}
