use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::types::{LogEntry, NodeId};

/// On-disk layout for the bits of state that must survive a restart.
/// `term_<NodeId>` holds exactly an ASCII integer, matching the original
/// deployment's term file so operators inspecting the data dir see the
/// same thing they always have. `voted_<NodeId>` is this node's own
/// addition: the original never persisted a vote, which meant a node
/// that crashed right after granting one could grant a second in the
/// same term after restart. We keep it a separate file instead of folding
/// it into term_<NodeId> so the term file's format stays exactly ASCII.
/// `log_<NodeId>` holds the replicated log itself, one JSON-encoded entry
/// per line, rewritten in full whenever the in-memory log changes so a
/// restarted node replays exactly what it had before rather than relying
/// on a full AppendEntries backfill from whatever leader happens to be up.
pub struct PersistentPaths {
    term_file: PathBuf,
    voted_file: PathBuf,
    log_file: PathBuf,
}

impl PersistentPaths {
    pub fn new(data_dir: &str, node_id: NodeId) -> Self {
        let dir = Path::new(data_dir);
        PersistentPaths {
            term_file: dir.join(format!("term_{node_id}")),
            voted_file: dir.join(format!("voted_{node_id}")),
            log_file: dir.join(format!("log_{node_id}")),
        }
    }

    pub fn load_term(&self) -> Result<u64> {
        if !self.term_file.exists() {
            return Ok(0);
        }
        let raw = std::fs::read_to_string(&self.term_file)
            .with_context(|| format!("reading {}", self.term_file.display()))?;
        raw.trim()
            .parse::<u64>()
            .with_context(|| format!("corrupt term file {}", self.term_file.display()))
    }

    pub fn save_term(&self, term: u64) -> Result<()> {
        std::fs::write(&self.term_file, term.to_string())
            .with_context(|| format!("writing {}", self.term_file.display()))
    }

    pub fn load_voted_for(&self) -> Result<Option<NodeId>> {
        if !self.voted_file.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.voted_file)
            .with_context(|| format!("reading {}", self.voted_file.display()))?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let id = trimmed
            .parse::<NodeId>()
            .with_context(|| format!("corrupt voted-for file {}", self.voted_file.display()))?;
        Ok(Some(id))
    }

    pub fn save_voted_for(&self, voted_for: Option<NodeId>) -> Result<()> {
        let contents = voted_for.map(|id| id.to_string()).unwrap_or_default();
        std::fs::write(&self.voted_file, contents)
            .with_context(|| format!("writing {}", self.voted_file.display()))
    }

    pub fn load_log(&self) -> Result<Vec<LogEntry>> {
        if !self.log_file.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.log_file)
            .with_context(|| format!("reading {}", self.log_file.display()))?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .with_context(|| format!("corrupt log file {}", self.log_file.display()))
            })
            .collect()
    }

    pub fn save_log(&self, log: &[LogEntry]) -> Result<()> {
        let mut buf = String::new();
        for entry in log {
            buf.push_str(&serde_json::to_string(entry).context("serializing log entry")?);
            buf.push('\n');
        }
        std::fs::write(&self.log_file, buf)
            .with_context(|| format!("writing {}", self.log_file.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_default_to_term_zero_and_no_vote() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PersistentPaths::new(dir.path().to_str().unwrap(), 217);
        assert_eq!(paths.load_term().unwrap(), 0);
        assert_eq!(paths.load_voted_for().unwrap(), None);
    }

    #[test]
    fn term_and_vote_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PersistentPaths::new(dir.path().to_str().unwrap(), 217);
        paths.save_term(7).unwrap();
        paths.save_voted_for(Some(536)).unwrap();
        assert_eq!(paths.load_term().unwrap(), 7);
        assert_eq!(paths.load_voted_for().unwrap(), Some(536));

        paths.save_voted_for(None).unwrap();
        assert_eq!(paths.load_voted_for().unwrap(), None);
    }

    #[test]
    fn corrupt_term_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PersistentPaths::new(dir.path().to_str().unwrap(), 217);
        std::fs::write(dir.path().join("term_217"), "not-a-number").unwrap();
        assert!(paths.load_term().is_err());
    }

    #[test]
    fn missing_log_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PersistentPaths::new(dir.path().to_str().unwrap(), 217);
        assert_eq!(paths.load_log().unwrap(), Vec::new());
    }

    #[test]
    fn log_round_trips_through_restart() {
        use super::super::types::Command;

        let dir = tempfile::tempdir().unwrap();
        let paths = PersistentPaths::new(dir.path().to_str().unwrap(), 217);
        let log = vec![
            LogEntry { term: 1, command: Command::SetLeader { leader_id: 217 } },
            LogEntry {
                term: 1,
                command: Command::ReplicateFile {
                    filename: "toyota_corolla_ottawa.csv".to_string(),
                    bytes: vec![1, 2, 3],
                },
            },
        ];
        paths.save_log(&log).unwrap();
        assert_eq!(paths.load_log().unwrap(), log);
    }

    #[test]
    fn save_log_overwrites_rather_than_appends() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PersistentPaths::new(dir.path().to_str().unwrap(), 217);
        paths.save_log(&[entry_at(1)]).unwrap();
        paths.save_log(&[entry_at(1), entry_at(2)]).unwrap();
        assert_eq!(paths.load_log().unwrap().len(), 2);
    }

    fn entry_at(term: u64) -> LogEntry {
        use super::super::types::Command;
        LogEntry { term, command: Command::SetLeader { leader_id: 217 } }
    }
}
