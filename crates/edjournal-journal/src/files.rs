use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::types::file_name_of;

/// Creation-stamp formats seen in journal file names, newest first.
const STAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H%M%S", "%Y%m%d%H%M%S", "%y%m%d%H%M%S"];

/// A journal file identified by the creation stamp embedded in its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalFile {
    pub path: PathBuf,
    pub created: NaiveDateTime,
    pub part: u32,
}

impl JournalFile {
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let (created, part) = parse_journal_name(name)?;
        Some(Self {
            path,
            created,
            part,
        })
    }

    pub fn name(&self) -> String {
        file_name_of(&self.path)
    }
}

impl Ord for JournalFile {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created
            .cmp(&other.created)
            .then(self.part.cmp(&other.part))
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for JournalFile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Split `Journal.<stamp>.<part>.log` into its creation stamp and part number.
pub fn parse_journal_name(name: &str) -> Option<(NaiveDateTime, u32)> {
    let inner = name.strip_prefix("Journal.")?.strip_suffix(".log")?;
    let (stamp, part) = inner.rsplit_once('.')?;
    let part: u32 = part.parse().ok()?;
    let created = STAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(stamp, fmt).ok())?;
    Some((created, part))
}

/// List journal files in `dir`, oldest creation stamp first.
///
/// Modification times are ignored; they are unreliable under rotation.
pub async fn list_journal_files(dir: &Path) -> io::Result<Vec<JournalFile>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(file) = JournalFile::from_path(path) {
            files.push(file);
        }
    }
    files.sort();
    Ok(files)
}

/// Whether a changed path is one the tailer cares about.
pub fn is_journal_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .and_then(parse_journal_name)
        .is_some()
}
