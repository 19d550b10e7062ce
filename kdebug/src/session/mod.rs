//! Sessions: the frame log of one recording, its artifact format and replay

pub mod artifact;
pub mod cursor;
pub mod store;

pub use artifact::{
    autosave_file_name, autosave_path, list_sessions, load, save, ARTIFACT_EXTENSION,
};
pub use cursor::ReplayCursor;
pub use store::{
    validate_frames, ProjectInfo, Session, SessionStatistics, SessionStatus, SystemEnvironment,
};
