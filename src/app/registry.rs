use std::collections::HashMap;

use crate::error::{AppError, Result};
use crate::serial::SerialSession;

/// Open sessions keyed by display name, plus which one the terminal shows.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, SerialSession>,
    active: Option<String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` and make it active. Display names are unique.
    pub fn insert(&mut self, session: SerialSession) -> Result<()> {
        let name = session.name().to_string();
        if self.sessions.contains_key(&name) {
            return Err(AppError::ValidationError(format!(
                "A session named {name} is already open"
            )));
        }
        self.sessions.insert(name.clone(), session);
        self.active = Some(name);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&SerialSession> {
        self.sessions.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SerialSession> {
        self.sessions.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<SerialSession> {
        if self.active.as_deref() == Some(name) {
            self.active = None;
        }
        self.sessions.remove(name)
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active(&self) -> Option<&SerialSession> {
        self.active.as_deref().and_then(|name| self.sessions.get(name))
    }

    pub fn active_mut(&mut self) -> Option<&mut SerialSession> {
        let name = self.active.as_deref()?;
        self.sessions.get_mut(name)
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        if !self.sessions.contains_key(name) {
            return Err(AppError::ValidationError(format!("No session named {name}")));
        }
        self.active = Some(name.to_string());
        Ok(())
    }

    /// Display names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut SerialSession)> {
        self.sessions.iter_mut()
    }

    pub fn drain(&mut self) -> Vec<SerialSession> {
        self.active = None;
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
