//! Replay cursor
//!
//! A position over a loaded, immutable session. Cursors share the session
//! through an `Arc` and keep their own index, so any number of them can walk
//! the same session independently.

use std::sync::Arc;

use super::store::Session;
use crate::domain::NavigationError;
use crate::frames::Frame;

#[derive(Debug, Clone)]
pub struct ReplayCursor {
    session: Arc<Session>,
    index: usize,
}

impl ReplayCursor {
    /// Start at the session's stored cursor position
    pub fn new(session: Arc<Session>) -> Self {
        let index = session.current_index().unwrap_or(0);
        Self { session, index }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Zero-based position; `None` for an empty session
    pub fn index(&self) -> Option<usize> {
        (!self.session.is_empty()).then_some(self.index)
    }

    pub fn len(&self) -> usize {
        self.session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.session.is_empty()
    }

    /// # Errors
    /// Returns `NavigationError::NoSession` if the session has no frames
    pub fn current(&self) -> Result<&Frame, NavigationError> {
        self.session.frame(self.index).ok_or(NavigationError::NoSession)
    }

    /// # Errors
    /// - `NavigationError::NoSession` if the session has no frames
    /// - `NavigationError::OutOfRange` if `index` is not a frame position
    pub fn jump(&mut self, index: usize) -> Result<&Frame, NavigationError> {
        if self.session.is_empty() {
            return Err(NavigationError::NoSession);
        }
        if index >= self.session.len() {
            return Err(NavigationError::OutOfRange { index, len: self.session.len() });
        }
        self.index = index;
        self.current()
    }

    /// # Errors
    /// `NavigationError::AtBoundary` on the last frame
    pub fn next_frame(&mut self) -> Result<&Frame, NavigationError> {
        if self.session.is_empty() {
            return Err(NavigationError::NoSession);
        }
        if self.index + 1 >= self.session.len() {
            return Err(NavigationError::AtBoundary);
        }
        self.index += 1;
        self.current()
    }

    /// # Errors
    /// `NavigationError::AtBoundary` on the first frame
    pub fn prev_frame(&mut self) -> Result<&Frame, NavigationError> {
        if self.session.is_empty() {
            return Err(NavigationError::NoSession);
        }
        if self.index == 0 {
            return Err(NavigationError::AtBoundary);
        }
        self.index -= 1;
        self.current()
    }
}
