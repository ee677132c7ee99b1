use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use super::error::Result;
use super::types::ItemId;

static ARTIFACT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(json|jpg)$").expect("hardcoded regex pattern is valid"));

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Artifacts {
    json: bool,
    jpg: bool,
}

/// Identifiers already harvested, rebuilt from the output directory.
#[derive(Debug, Default, Clone)]
pub struct CompletionSet {
    done: HashSet<ItemId>,
    incomplete: Vec<ItemId>,
}

impl CompletionSet {
    /// Scans `dir` once. A missing directory is an empty ledger.
    ///
    /// An identifier counts once its `.json` record exists; with `strict`
    /// the `.jpg` must exist too. A lone `.jpg` never counts, since the
    /// image is written before the record.
    pub fn load(dir: &Path, strict: bool) -> Result<Self> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "output directory absent, empty ledger");
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        let set = Self::from_names(names.iter().map(String::as_str), strict);
        info!("{} found in {}.", set.len(), dir.display());
        Ok(set)
    }

    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>, strict: bool) -> Self {
        let mut seen = BTreeMap::<String, Artifacts>::new();
        for name in names {
            let Some(caps) = ARTIFACT_NAME.captures(name) else {
                continue;
            };
            let entry = seen.entry(caps[1].to_string()).or_default();
            match &caps[2] {
                "json" => entry.json = true,
                _ => entry.jpg = true,
            }
        }

        let mut set = Self::default();
        for (id, artifacts) in seen {
            let id = ItemId::new(id);
            let complete = artifacts.json && artifacts.jpg;
            if !complete {
                warn!(%id, json = artifacts.json, jpg = artifacts.jpg, "partial artifacts on disk");
                set.incomplete.push(id.clone());
            }
            if complete || (!strict && artifacts.json) {
                set.done.insert(id);
            }
        }
        set
    }

    pub fn contains(&self, id: &str) -> bool {
        self.done.contains(id)
    }

    /// Called once per item, after its image and record are both written.
    pub fn insert(&mut self, id: ItemId) {
        self.incomplete.retain(|x| x != &id);
        self.done.insert(id);
    }

    pub fn len(&self) -> usize {
        self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }

    /// Identifiers with only one of the two artifacts on disk.
    pub fn incomplete(&self) -> &[ItemId] {
        &self.incomplete
    }
}
