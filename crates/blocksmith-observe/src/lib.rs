use anyhow::Result;
use blocksmith_core::{EventEnvelope, ObserveConfig, runtime_dir};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only session log at `.blocksmith/observe.log`, plus stderr output
/// for warnings and (optionally) verbose progress lines.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path, cfg: &ObserveConfig) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: cfg.verbose,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn record_event(&self, event: &EventEnvelope) -> Result<()> {
        self.append_log_line(&format!(
            "{} EVENT {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(event)?
        ))
    }

    /// Enable or disable verbose logging to stderr.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Log a message to stderr with `[blocksmith]` prefix when verbose mode is on.
    /// The message is written to the log file either way.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[blocksmith] {msg}");
        }
        let _ = self.append_log_line(&format!("{} INFO {msg}", Utc::now().to_rfc3339()));
    }

    /// Log a warning: always written to the log file and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[blocksmith WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksmith_core::{EventKind, SessionPhase};
    use uuid::Uuid;

    fn sample_event() -> EventEnvelope {
        EventEnvelope {
            seq_no: 1,
            at: Utc::now(),
            session_id: Uuid::now_v7(),
            kind: EventKind::PhaseChangedV1 {
                from: SessionPhase::Idle,
                to: SessionPhase::AwaitingResponse,
            },
        }
    }

    #[test]
    fn events_are_appended_as_json_lines() {
        let workspace = tempfile::tempdir().expect("workspace");
        let observer = Observer::new(workspace.path(), &ObserveConfig::default()).expect("observer");
        observer.record_event(&sample_event()).expect("record");
        observer.record_event(&sample_event()).expect("record");

        let log = fs::read_to_string(observer.log_path()).expect("read log");
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" EVENT "));
        let json = lines[0].split_once(" EVENT ").expect("event payload").1;
        let value: serde_json::Value = serde_json::from_str(json).expect("json");
        assert_eq!(value["kind"]["type"], "PhaseChangedV1");
    }

    #[test]
    fn warnings_and_info_reach_the_log_file() {
        let workspace = tempfile::tempdir().expect("workspace");
        let mut observer =
            Observer::new(workspace.path(), &ObserveConfig::default()).expect("observer");
        assert!(!observer.is_verbose());
        observer.set_verbose(true);
        observer.verbose_log("round 1 started");
        observer.warn_log("transcript write failed");
        let log = fs::read_to_string(observer.log_path()).expect("read log");
        assert!(log.contains("INFO round 1 started"));
        assert!(log.contains("WARN transcript write failed"));
    }
}
