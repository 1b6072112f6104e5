//! Scenario store: story parsing and variable replacement.
//!
//! A story is a line-oriented text file describing one experiment run.
//! Variable tokens (`$name`) are replaced before a line is interpreted, so
//! one story can drive a family of runs via the `--replacements` input.
//!
//! Grammar (one logical record per line, `#` starts a comment):
//!
//! ```text
//! id nightly-swarm-42          # optional run identifier directive
//! logfile on                   # optional metrics-to-file directive
//!
//! at 0s   register-tracker T0 torrent=input/vod.torrent
//! at 10s  join n1,n2
//! at 12s  join $late deferred=1
//! at 20s  leave n1
//! at 25s  note seeding phase over
//! ```
//!
//! Parsing never touches the clock; scheduling is a separate step so the
//! action list can be unit-tested without a live kernel.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::sim_interface::{NodeId, SimTime, MILLIS_PER_SECOND};
use crate::sim_reserve::ReserveEntry;

// ============================================================================
// Actions
// ============================================================================

/// Kind of a scheduled story action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionKind {
    /// A node enters the swarm and starts its task.
    NodeJoin,

    /// A node departs (churn); an unfinished task counts as failed.
    NodeLeave,

    /// The tracker node registers the shared torrent.
    TrackerRegister,

    /// Free-text marker, scheduled but side-effect free.
    Note,
}

/// One scheduled unit of work, immutable after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioAction {
    /// Simulated fire time in milliseconds, relative to run start.
    pub fire_time: SimTime,

    pub kind: ActionKind,

    /// One or more node identities this action applies to.
    pub targets: Vec<NodeId>,

    /// Keyword-specific parameters, fully resolved.
    pub params: IndexMap<String, String>,

    /// Position in the story file; tiebreak for equal fire times.
    pub story_index: usize,
}

impl ScenarioAction {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// A join marked deferred admits the node out of the reserve pool.
    pub fn is_deferred(&self) -> bool {
        matches!(self.param("deferred"), Some("1") | Some("true"))
    }
}

/// Result of parsing one story file.
#[derive(Debug)]
pub struct ParsedStory {
    pub simulation_id: String,

    /// Whether the metrics report also goes to a file.
    pub log_to_file: bool,

    /// Actions in story order; the scheduler establishes fire-time order.
    pub actions: Vec<ScenarioAction>,

    /// Deferred-admission participants captured at parse time.
    pub reserve: Vec<ReserveEntry>,
}

// ============================================================================
// Variable Bindings
// ============================================================================

/// Variable name to replacement value, from `"var1:value1/var2:value2"`.
///
/// A duplicate name is a parse error: the intent is ambiguous and the run
/// must not start on a guess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableBinding {
    vars: IndexMap<String, String>,
}

impl VariableBinding {
    pub fn empty() -> Self {
        VariableBinding::default()
    }

    pub fn parse(text: &str) -> Result<Self, StoryError> {
        let mut vars = IndexMap::new();
        if text.trim().is_empty() {
            return Ok(VariableBinding { vars });
        }
        for segment in text.split('/') {
            let (name, value) = segment
                .split_once(':')
                .ok_or_else(|| StoryError::MalformedReplacement { segment: segment.to_string() })?;
            if name.is_empty() {
                return Err(StoryError::MalformedReplacement { segment: segment.to_string() });
            }
            if vars.contains_key(name) {
                return Err(StoryError::DuplicateVariable { name: name.to_string() });
            }
            vars.insert(name.to_string(), value.to_string());
        }
        Ok(VariableBinding { vars })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Replace every `$name` token in `line`. An unbound token is an error,
    /// never a silent default.
    pub fn substitute(&self, line: &str, line_no: usize) -> Result<String, StoryError> {
        let mut out = String::with_capacity(line.len());
        let mut chars = line.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch != '$' {
                out.push(ch);
                continue;
            }
            let mut name = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    name.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                out.push('$');
                continue;
            }
            match self.vars.get(&name) {
                Some(value) => out.push_str(value),
                None => return Err(StoryError::UnresolvedVariable { line: line_no, name }),
            }
        }
        Ok(out)
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Read a story file from disk and parse it against `horizon` (milliseconds).
pub fn read_story(
    path: &Path,
    horizon: SimTime,
    binding: &VariableBinding,
) -> Result<ParsedStory, StoryError> {
    if !path.is_file() {
        return Err(StoryError::MissingStoryFile(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)
        .map_err(|e| StoryError::Io { path: path.to_path_buf(), message: e.to_string() })?;
    let mut story = parse_story(&text, horizon, binding)?;
    if story.simulation_id == DEFAULT_SIMULATION_ID {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            story.simulation_id = stem.to_string();
        }
    }
    Ok(story)
}

const DEFAULT_SIMULATION_ID: &str = "simulation";

/// Parse story text into an ordered action list.
///
/// Fails on unknown keywords, unresolved variables, malformed times and on
/// any action scheduled past `horizon`: scheduled work the run can never
/// reach is an operator mistake, not something to drop quietly.
pub fn parse_story(
    text: &str,
    horizon: SimTime,
    binding: &VariableBinding,
) -> Result<ParsedStory, StoryError> {
    let mut story = ParsedStory {
        simulation_id: DEFAULT_SIMULATION_ID.to_string(),
        log_to_file: false,
        actions: Vec::new(),
        reserve: Vec::new(),
    };

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let raw = match raw.split_once('#') {
            Some((before, _)) => before.trim(),
            None => raw.trim(),
        };
        if raw.is_empty() {
            continue;
        }
        let line = binding.substitute(raw, line_no)?;

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens[0] {
            "id" => {
                let name = tokens.get(1).ok_or_else(|| StoryError::MalformedLine {
                    line: line_no,
                    reason: "id directive needs a value".to_string(),
                })?;
                story.simulation_id = name.to_string();
            }
            "logfile" => {
                story.log_to_file = match tokens.get(1).copied() {
                    Some("on") | Some("1") => true,
                    Some("off") | Some("0") => false,
                    other => {
                        return Err(StoryError::MalformedLine {
                            line: line_no,
                            reason: format!("logfile expects on/off, got {:?}", other),
                        })
                    }
                };
            }
            "at" => {
                let action = parse_action(&tokens, line_no, story.actions.len())?;
                if action.fire_time > horizon {
                    return Err(StoryError::BeyondHorizon {
                        line: line_no,
                        fire_time: action.fire_time,
                        horizon,
                    });
                }
                if action.kind == ActionKind::NodeJoin && action.is_deferred() {
                    for target in &action.targets {
                        story.reserve.push(ReserveEntry {
                            id: target.clone(),
                            admission: action.clone(),
                        });
                    }
                }
                story.actions.push(action);
            }
            other => {
                return Err(StoryError::UnknownKeyword {
                    line: line_no,
                    word: other.to_string(),
                })
            }
        }
    }

    Ok(story)
}

fn parse_action(
    tokens: &[&str],
    line_no: usize,
    story_index: usize,
) -> Result<ScenarioAction, StoryError> {
    let time_text = tokens.get(1).ok_or_else(|| StoryError::MalformedLine {
        line: line_no,
        reason: "missing fire time".to_string(),
    })?;
    let fire_time = parse_time(time_text, line_no)?;

    let keyword = tokens.get(2).ok_or_else(|| StoryError::MalformedLine {
        line: line_no,
        reason: "missing action keyword".to_string(),
    })?;

    let (kind, rest) = match *keyword {
        "join" => (ActionKind::NodeJoin, &tokens[3..]),
        "leave" => (ActionKind::NodeLeave, &tokens[3..]),
        "register-tracker" => (ActionKind::TrackerRegister, &tokens[3..]),
        "note" => {
            let text = tokens[3..].join(" ");
            let mut params = IndexMap::new();
            params.insert("text".to_string(), text);
            return Ok(ScenarioAction {
                fire_time,
                kind: ActionKind::Note,
                targets: Vec::new(),
                params,
                story_index,
            });
        }
        other => {
            return Err(StoryError::UnknownKeyword { line: line_no, word: other.to_string() })
        }
    };

    let target_text = rest.first().ok_or_else(|| StoryError::MalformedLine {
        line: line_no,
        reason: format!("{} needs a target selector", keyword),
    })?;
    let targets: Vec<NodeId> = target_text
        .split(',')
        .filter(|t| !t.is_empty())
        .map(NodeId::from)
        .collect();
    if targets.is_empty() {
        return Err(StoryError::MalformedLine {
            line: line_no,
            reason: format!("{} needs a target selector", keyword),
        });
    }

    let mut params = IndexMap::new();
    for pair in &rest[1..] {
        let (key, value) = pair.split_once('=').ok_or_else(|| StoryError::MalformedLine {
            line: line_no,
            reason: format!("expected key=value parameter, got {:?}", pair),
        })?;
        params.insert(key.to_string(), value.to_string());
    }

    Ok(ScenarioAction { fire_time, kind, targets, params, story_index })
}

/// Parse `10s`, `1.5s`, `500ms` or a bare seconds count into milliseconds.
fn parse_time(text: &str, line_no: usize) -> Result<SimTime, StoryError> {
    let bad = || StoryError::BadTime { line: line_no, text: text.to_string() };

    let millis = if let Some(ms) = text.strip_suffix("ms") {
        ms.parse::<u64>().map_err(|_| bad())? as f64
    } else {
        let seconds = text.strip_suffix('s').unwrap_or(text);
        let value = seconds.parse::<f64>().map_err(|_| bad())?;
        if !value.is_finite() || value < 0.0 {
            return Err(bad());
        }
        value * MILLIS_PER_SECOND as f64
    };
    Ok(millis.round() as SimTime)
}

// ============================================================================
// Errors
// ============================================================================

/// Story grammar or replacement violations; all fatal to startup.
#[derive(Debug, Clone, PartialEq)]
pub enum StoryError {
    /// The story file is absent.
    MissingStoryFile(PathBuf),

    /// The story file could not be read.
    Io { path: PathBuf, message: String },

    /// A `"name:value"` replacement segment did not parse.
    MalformedReplacement { segment: String },

    /// The same variable name was bound twice.
    DuplicateVariable { name: String },

    /// A `$name` token has no binding.
    UnresolvedVariable { line: usize, name: String },

    /// First word of a record is not a known directive or action keyword.
    UnknownKeyword { line: usize, word: String },

    /// A record is structurally broken.
    MalformedLine { line: usize, reason: String },

    /// A fire time did not parse or is negative.
    BadTime { line: usize, text: String },

    /// An action is scheduled past the simulation horizon.
    BeyondHorizon { line: usize, fire_time: SimTime, horizon: SimTime },
}

impl fmt::Display for StoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoryError::MissingStoryFile(path) => {
                write!(f, "story file not found: {}", path.display())
            }
            StoryError::Io { path, message } => {
                write!(f, "cannot read story file {}: {}", path.display(), message)
            }
            StoryError::MalformedReplacement { segment } => {
                write!(f, "malformed replacement segment {:?}, expected name:value", segment)
            }
            StoryError::DuplicateVariable { name } => {
                write!(f, "variable {:?} bound more than once", name)
            }
            StoryError::UnresolvedVariable { line, name } => {
                write!(f, "line {}: unresolved variable ${}", line, name)
            }
            StoryError::UnknownKeyword { line, word } => {
                write!(f, "line {}: unknown keyword {:?}", line, word)
            }
            StoryError::MalformedLine { line, reason } => {
                write!(f, "line {}: {}", line, reason)
            }
            StoryError::BadTime { line, text } => {
                write!(f, "line {}: invalid fire time {:?}", line, text)
            }
            StoryError::BeyondHorizon { line, fire_time, horizon } => {
                write!(
                    f,
                    "line {}: fire time {}ms is past the simulation horizon of {}ms",
                    line, fire_time, horizon
                )
            }
        }
    }
}
