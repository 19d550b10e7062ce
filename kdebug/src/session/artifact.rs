//! # Session Artifact
//!
//! A session persists as one pretty-printed JSON document (`.frames`). Maps
//! are ordered and every frame carries its raw event as lowercase hex, so
//! saving the same session twice yields identical bytes.
//!
//! Loading validates before it builds anything: a document that is not JSON,
//! has another `format_version` or carries raw events of the wrong size is a
//! schema mismatch; broken frame-id or timestamp sequences are invalid.
//! Unknown top-level fields are ignored unless `strict` is requested.

use chrono::{DateTime, Local, Utc};
use kdebug_common::EVENT_SIZE;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::store::{
    validate_frames, ProjectInfo, Session, SessionStatistics, SessionStatus, SystemEnvironment,
};
use crate::breakpoints::Breakpoint;
use crate::domain::SessionError;
use crate::frames::{ClockAnchor, Frame};

pub const FORMAT_VERSION: u64 = 1;

/// File extension of session artifacts
pub const ARTIFACT_EXTENSION: &str = "frames";

const KNOWN_FIELDS: &[&str] = &[
    "format_version",
    "session_id",
    "session_name",
    "start_time",
    "end_time",
    "duration_ms",
    "status",
    "current_index",
    "project",
    "environment",
    "statistics",
    "clock_anchor",
    "breakpoints",
    "frames",
];

#[derive(Serialize, Deserialize)]
struct SessionArtifact<'a> {
    format_version: u64,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    session_name: String,
    start_time: DateTime<Utc>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    status: SessionStatus,
    #[serde(default)]
    current_index: Option<usize>,
    #[serde(default)]
    project: ProjectInfo,
    #[serde(default)]
    environment: SystemEnvironment,
    #[serde(default)]
    statistics: SessionStatistics,
    #[serde(default)]
    clock_anchor: Option<ClockAnchor>,
    #[serde(default)]
    breakpoints: Cow<'a, [Breakpoint]>,
    frames: Cow<'a, [Frame]>,
}

impl<'a> SessionArtifact<'a> {
    #[allow(clippy::cast_possible_truncation)]
    fn borrowed(session: &'a Session) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            session_id: session.id.clone(),
            session_name: session.name.clone(),
            start_time: session.start_time,
            end_time: session.end_time,
            duration_ms: session.duration().as_millis() as u64,
            status: session.status,
            current_index: session.current_index(),
            project: session.project.clone(),
            environment: session.environment.clone(),
            statistics: session.statistics.clone(),
            clock_anchor: Some(session.clock_anchor),
            breakpoints: Cow::Borrowed(&session.breakpoints),
            frames: Cow::Borrowed(&session.frames),
        }
    }
}

/// Write `session` to `path`
///
/// The document goes to a temporary sibling first and is renamed into place,
/// so a failed save never truncates an existing artifact.
///
/// # Errors
/// Returns `SessionError::Persist` if the file cannot be written
pub fn save(session: &Session, path: &Path) -> Result<(), SessionError> {
    let json = serde_json::to_string_pretty(&SessionArtifact::borrowed(session))?;
    let tmp = path.with_extension(format!("{ARTIFACT_EXTENSION}.tmp"));
    let persist = |source| SessionError::Persist { path: path.to_path_buf(), source };

    fs::write(&tmp, json).map_err(persist)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(persist(e));
    }
    info!("✓ Saved {} frames to {}", session.len(), path.display());
    Ok(())
}

/// Read, validate and normalise a session artifact
///
/// The loaded session is ended, its cursor is at frame 0 and it has a session
/// id (a fresh one if the artifact had none).
///
/// # Errors
/// - `SessionError::NotFound` if `path` does not exist
/// - `SessionError::SchemaMismatch` for malformed or foreign documents
/// - `SessionError::Invalid` for broken frame sequences
pub fn load(path: &Path, strict: bool) -> Result<Session, SessionError> {
    let content = match fs::read_to_string(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(SessionError::NotFound(path.to_path_buf()));
        }
        other => other?,
    };

    let value: Value = serde_json::from_str(&content)
        .map_err(|e| SessionError::SchemaMismatch(format!("not a JSON document: {e}")))?;
    check_header(&value, strict)?;

    let artifact: SessionArtifact<'static> =
        serde_json::from_value(value).map_err(|e| SessionError::SchemaMismatch(e.to_string()))?;

    if let Some(frame) = artifact.frames.iter().find(|f| f.raw_event.len() != EVENT_SIZE) {
        return Err(SessionError::SchemaMismatch(format!(
            "frame {} carries a {}-byte raw event, expected {EVENT_SIZE}",
            frame.id,
            frame.raw_event.len()
        )));
    }
    validate_frames(&artifact.frames).map_err(SessionError::Invalid)?;

    let session = normalise(artifact);
    debug!("Loaded session {} ({} frames)", session.id, session.len());
    Ok(session)
}

fn check_header(value: &Value, strict: bool) -> Result<(), SessionError> {
    let object = value
        .as_object()
        .ok_or_else(|| SessionError::SchemaMismatch("top level is not an object".to_string()))?;

    match object.get("format_version").and_then(Value::as_u64) {
        Some(FORMAT_VERSION) => {}
        Some(other) => {
            return Err(SessionError::SchemaMismatch(format!(
                "unsupported format_version {other}"
            )));
        }
        None => return Err(SessionError::SchemaMismatch("missing format_version".to_string())),
    }

    if strict {
        if let Some(field) = object.keys().find(|k| !KNOWN_FIELDS.contains(&k.as_str())) {
            return Err(SessionError::SchemaMismatch(format!("unknown field `{field}`")));
        }
    }
    Ok(())
}

fn normalise(artifact: SessionArtifact<'static>) -> Session {
    let frames = artifact.frames.into_owned();
    let id = if artifact.session_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        artifact.session_id
    };
    let clock_anchor = artifact.clock_anchor.unwrap_or_else(|| match frames.first() {
        Some(first) => ClockAnchor::fixed(first.monotonic_ns, first.timestamp),
        None => ClockAnchor::fixed(0, artifact.start_time),
    });
    let end_time = artifact
        .end_time
        .or_else(|| frames.last().map(|f| f.timestamp.max(artifact.start_time)))
        .unwrap_or(artifact.start_time);

    let mut statistics = artifact.statistics;
    statistics.frame_count = frames.len() as u64;

    Session {
        id,
        name: artifact.session_name,
        start_time: artifact.start_time,
        end_time: Some(end_time),
        status: SessionStatus::Ended,
        project: artifact.project,
        environment: artifact.environment,
        statistics,
        clock_anchor,
        breakpoints: artifact.breakpoints.into_owned(),
        frames,
        current_index: 0,
    }
}

const AUTOSAVE_STEM: &str = "debug_session_%Y%m%d_%H%M%S";

/// `debug_session_YYYYMMDD_HHMMSS.frames`, in local time
pub fn autosave_file_name(start_time: DateTime<Utc>) -> String {
    format!("{}.{ARTIFACT_EXTENSION}", autosave_stem(start_time))
}

fn autosave_stem(start_time: DateTime<Utc>) -> String {
    start_time.with_timezone(&Local).format(AUTOSAVE_STEM).to_string()
}

/// First free autosave path in `dir` for a session started at `start_time`
///
/// Recordings started within the same second get `_2`, `_3`, ... suffixes.
pub fn autosave_path(dir: &Path, start_time: DateTime<Utc>) -> PathBuf {
    let first = dir.join(autosave_file_name(start_time));
    if !first.exists() {
        return first;
    }
    let stem = autosave_stem(start_time);
    (2u32..)
        .map(|n| dir.join(format!("{stem}_{n}.{ARTIFACT_EXTENSION}")))
        .find(|path| !path.exists())
        .unwrap_or(first)
}

/// Artifact file names in `dir`, newest first
///
/// # Errors
/// Returns an error if `dir` cannot be read
pub fn list_sessions(dir: &Path) -> Result<Vec<String>, SessionError> {
    let mut sessions: Vec<(SystemTime, String)> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let path: PathBuf = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
                return None;
            }
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, entry.file_name().to_string_lossy().into_owned()))
        })
        .collect();

    sessions.sort_by(|a, b| b.cmp(a));
    Ok(sessions.into_iter().map(|(_, name)| name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoints::BreakpointSnapshot;
    use crate::capture::synthetic::SyntheticEvent;
    use crate::domain::{FrameId, ValidationFailure};
    use crate::frames::FrameProcessor;
    use tempfile::TempDir;

    fn recorded(count: u64) -> Session {
        let anchor = ClockAnchor::fixed(0, DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let processor = FrameProcessor::new(anchor);
        let mut session =
            Session::new("demo".into(), ProjectInfo::from_root(Path::new("/p")), anchor, Vec::new());
        for i in 1..=count {
            let event = SyntheticEvent::new("foo").timestamp_ns(i * 100).build();
            let frame = processor.build_frame(&event, FrameId(i), &BreakpointSnapshot::default());
            session.append(frame).unwrap();
        }
        session.seal(DateTime::from_timestamp(1_700_000_001, 0).unwrap());
        session
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = load(&dir.path().join("nope.frames"), false).unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[test]
    fn test_load_normalises_cursor_and_status() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.frames");
        let session = recorded(3);
        save(&session, &path).unwrap();

        let loaded = load(&path, false).unwrap();
        assert_eq!(loaded.current_index(), Some(0), "cursor reset on load");
        assert_eq!(loaded.status(), SessionStatus::Ended);
        assert_eq!(loaded.id(), session.id());
        assert_eq!(loaded.frames(), session.frames());
        assert_eq!(loaded.clock_anchor(), session.clock_anchor());
    }

    #[test]
    fn test_missing_session_id_gets_fresh_uuid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.frames");
        save(&recorded(1), &path).unwrap();

        let mut doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc.as_object_mut().unwrap().remove("session_id");
        doc.as_object_mut().unwrap().remove("current_index");
        fs::write(&path, doc.to_string()).unwrap();

        let loaded = load(&path, false).unwrap();
        assert_eq!(loaded.id().len(), 36, "uuid assigned");
        assert_eq!(loaded.current_index(), Some(0));
    }

    #[test]
    fn test_unknown_fields_only_fail_in_strict_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.frames");
        save(&recorded(1), &path).unwrap();

        let mut doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc.as_object_mut().unwrap().insert("ui_layout".into(), Value::from("wide"));
        fs::write(&path, doc.to_string()).unwrap();

        assert!(load(&path, false).is_ok());
        let err = load(&path, true).unwrap_err();
        assert!(matches!(err, SessionError::SchemaMismatch(ref m) if m.contains("ui_layout")));
    }

    #[test]
    fn test_schema_mismatches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.frames");

        fs::write(&path, "not json").unwrap();
        assert!(matches!(load(&path, false), Err(SessionError::SchemaMismatch(_))));

        save(&recorded(1), &path).unwrap();
        let mut doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc["format_version"] = Value::from(2);
        fs::write(&path, doc.to_string()).unwrap();
        let err = load(&path, false).unwrap_err();
        assert!(err.to_string().contains("format_version 2"), "got: {err}");

        doc["format_version"] = Value::from(1);
        doc["frames"][0]["raw_event"] = Value::from("00ff");
        fs::write(&path, doc.to_string()).unwrap();
        assert!(matches!(load(&path, false), Err(SessionError::SchemaMismatch(_))));
    }

    #[test]
    fn test_gap_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.frames");
        save(&recorded(3), &path).unwrap();

        let mut doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc["frames"][2]["id"] = Value::from(4);
        fs::write(&path, doc.to_string()).unwrap();

        let err = load(&path, false).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Invalid(ValidationFailure::Gap { expected: FrameId(3), found: FrameId(4) })
        ));
    }

    #[test]
    fn test_autosave_file_name_shape() {
        let name = autosave_file_name(Utc::now());
        assert!(name.starts_with("debug_session_"));
        assert!(name.ends_with(".frames"));
        assert_eq!(name.len(), "debug_session_YYYYMMDD_HHMMSS.frames".len());
    }

    #[test]
    fn test_autosave_path_never_reuses_a_name() {
        let dir = TempDir::new().unwrap();
        let start = Utc::now();
        let first = autosave_path(dir.path(), start);
        assert_eq!(first, dir.path().join(autosave_file_name(start)));

        fs::write(&first, "{}").unwrap();
        let second = autosave_path(dir.path(), start);
        assert_ne!(second, first, "same-second recordings must not collide");
        assert!(second.to_string_lossy().ends_with("_2.frames"), "got {}", second.display());

        fs::write(&second, "{}").unwrap();
        assert!(autosave_path(dir.path(), start).to_string_lossy().ends_with("_3.frames"));
    }

    #[test]
    fn test_environment_and_hits_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.frames");
        let mut session = recorded(2);
        session.environment = SystemEnvironment {
            kernel_release: "6.8.0-45-generic".into(),
            machine: "x86_64".into(),
            hostname: "buildbox".into(),
        };
        session.statistics.breakpoint_hits.insert(3, 2);
        save(&session, &path).unwrap();

        let loaded = load(&path, true).unwrap();
        assert_eq!(loaded.environment(), session.environment());
        assert_eq!(loaded.statistics().breakpoint_hits.get(&3), Some(&2));
    }

    #[test]
    fn test_artifact_without_environment_still_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.frames");
        save(&recorded(1), &path).unwrap();

        let mut doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc.as_object_mut().unwrap().remove("environment");
        doc["statistics"].as_object_mut().unwrap().remove("breakpoint_hits");
        fs::write(&path, doc.to_string()).unwrap();

        let loaded = load(&path, true).unwrap();
        assert_eq!(loaded.environment(), &SystemEnvironment::default());
        assert!(loaded.statistics().breakpoint_hits.is_empty());
    }

    #[test]
    fn test_save_to_missing_directory_is_persist_error() {
        let dir = TempDir::new().unwrap();
        let err = save(&recorded(1), &dir.path().join("missing/s.frames")).unwrap_err();
        assert!(matches!(err, SessionError::Persist { .. }));
    }
}
