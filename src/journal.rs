//! Persistent layer journal.
//!
//! Maps an app name to the ordered list of engine layer ids its image
//! was imported as. The map is flat on purpose: dumps are deterministic
//! and cheap, and callers persist them with a write-temp-then-rename.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::{Read, Write};

/// App name → ordered imported layer ids.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Journal {
    apps: BTreeMap<String, Vec<String>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the journal contents with a previously dumped snapshot.
    pub fn load<R: Read>(&mut self, reader: R) -> Result<()> {
        self.apps = serde_json::from_reader(reader)?;
        Ok(())
    }

    /// Serializes the journal; key order is deterministic.
    pub fn dump<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, &self.apps)?;
        Ok(())
    }

    /// Records the imported layer list for an app, overwriting any
    /// previous entry.
    pub fn insert_layers(&mut self, app: &str, layers: Vec<String>) {
        self.apps.insert(app.to_string(), layers);
    }

    /// Ordered layer ids for an app, if it was spooled.
    pub fn layers_for(&self, app: &str) -> Option<&[String]> {
        self.apps.get(app).map(Vec::as_slice)
    }

    /// Drops every entry referencing a layer the engine no longer
    /// knows; run once at startup against the engine's layer list.
    pub fn retain_known_layers(&mut self, known: &HashSet<String>) {
        self.apps
            .retain(|_, layers| layers.iter().all(|l| known.contains(l)));
    }

    /// Number of recorded apps.
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

impl fmt::Display for Journal {
    /// Compact snapshot for logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (app, layers) in &self.apps {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            write!(f, "{}:{}", app, layers.join(";"))?;
        }
        Ok(())
    }
}
