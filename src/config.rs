use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;
use tokio::fs;
use tracing::warn;

/// Startup environment for one fuzzing campaign, read once at process start.
/// Every required value missing from the environment is a fatal startup
/// error with a nonzero exit, before any worker is spawned.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(name = "hivefuzz", about = "Broker supervising a pool of afl-fuzz workers")]
pub struct BrokerEnv {
    /// Job collection guid shared by every broker host of this campaign.
    #[arg(long, env = "GUID")]
    pub guid: String,

    /// Identity prefix for worker names on this host.
    #[arg(long, env = "ID")]
    pub id: String,

    /// Number of workers to run: one master plus CPUS - 1 slaves.
    #[arg(long, env = "CPUS")]
    pub cpus: usize,

    /// Memory budget of the campaign; recorded and exposed, not enforced.
    #[arg(long, env = "RAM")]
    pub ram: Option<String>,

    /// Campaign working directory; archives are extracted into it.
    #[arg(long, env = "FUZZ_DIR")]
    pub fuzz_dir: PathBuf,

    /// Directory holding target.zip and corpus.zip.
    #[arg(long, env = "DATA_DIR", default_value = "/work/data")]
    pub data_dir: PathBuf,

    /// Shared result directory, possibly written by sibling broker hosts.
    #[arg(long, env = "RESULT_DIR", default_value = "/work/res")]
    pub result_dir: PathBuf,

    /// Seconds between periodic corpus syncs.
    #[arg(long, env = "SYNC_INTERVAL", default_value_t = 300)]
    pub sync_interval: u64,

    /// Port the control interface listens on.
    #[arg(long, env = "CONTROL_PORT", default_value_t = 50051)]
    pub control_port: u16,
}

impl BrokerEnv {
    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 {
            bail!("CPUS must be at least 1");
        }
        Ok(())
    }

    /// Directory name of this host's master output, e.g. `master_h1`.
    pub fn master_name(&self) -> String {
        format!("master_{}", self.id)
    }

    /// Root the fuzzers write their output under.
    pub fn local_out(&self) -> PathBuf {
        self.fuzz_dir.join("out")
    }
}

const MAX_INTERPOLATION_DEPTH: usize = 10;

/// Campaign configuration read from `config.ini` inside the fuzz directory.
/// Sections hold `key = value` pairs with case-preserving keys; values may
/// reference other values as `${key}` (same section) or `${SECTION:key}`.
/// The `[ENV]` section becomes the environment of every worker process.
#[derive(Debug, Clone, Default)]
pub struct FuzzConfig {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl FuzzConfig {
    /// Read the configuration file. A missing file yields an empty
    /// configuration; the workers then run with an empty environment.
    pub async fn load(path: &Path) -> Result<Self> {
        if fs::metadata(path).await.is_err() {
            warn!(?path, "no configuration file, workers get an empty environment");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read configuration {path:?}"))?;
        Self::parse(&text).with_context(|| format!("failed to parse configuration {path:?}"))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                sections.push((name.trim().to_string(), Vec::new()));
                continue;
            }
            let (key, value) = split_pair(line)
                .with_context(|| format!("malformed line {} in configuration", lineno + 1))?;
            let Some((_, entries)) = sections.last_mut() else {
                bail!("key {key:?} outside of any section (line {})", lineno + 1);
            };
            entries.push((key.to_string(), value.to_string()));
        }
        Self { sections }.expanded()
    }

    /// Resolve every `${...}` reference; expansion errors are configuration
    /// errors and abort startup.
    fn expanded(self) -> Result<Self> {
        let mut sections = Vec::with_capacity(self.sections.len());
        for (name, entries) in &self.sections {
            let mut resolved = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                let expanded = self
                    .expand(name, value, 0)
                    .with_context(|| format!("while expanding {name}:{key}"))?;
                resolved.push((key.clone(), expanded));
            }
            sections.push((name.clone(), resolved));
        }
        Ok(Self { sections })
    }

    fn expand(&self, section: &str, value: &str, depth: usize) -> Result<String> {
        if depth >= MAX_INTERPOLATION_DEPTH {
            bail!("interpolation depth exceeded in {value:?}");
        }
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .with_context(|| format!("unterminated interpolation in {value:?}"))?;
            let reference = &after[..end];
            let (ref_section, ref_key) = match reference.split_once(':') {
                Some((section, key)) => (section, key),
                None => (section, reference),
            };
            let referenced = self
                .get(ref_section, ref_key)
                .with_context(|| format!("unknown interpolation target {reference:?}"))?;
            out.push_str(&self.expand(ref_section, referenced, depth + 1)?);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    pub fn section(&self, name: &str) -> Option<&[(String, String)]> {
        self.sections
            .iter()
            .find(|(section, _)| section == name)
            .map(|(_, entries)| entries.as_slice())
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?
            .iter()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, value)| value.as_str())
    }

    /// The environment inherited by every worker process.
    pub fn worker_env(&self) -> HashMap<String, String> {
        self.section("ENV")
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of all sections, used by the control interface.
    pub fn sections_map(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.sections
            .iter()
            .map(|(name, entries)| (name.clone(), entries.iter().cloned().collect()))
            .collect()
    }
}

fn split_pair(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(['=', ':'])?;
    let (key, value) = line.split_at(idx);
    Some((key.trim(), value[1..].trim()))
}
