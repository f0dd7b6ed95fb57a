//! Export and reload of compiled machines.
//!
//! Each machine writes `<slug>.states.json` and `<slug>.transitions.json`;
//! `index.json` names the primary machine, links the files, and carries
//! the spec checksum (first 16 hex chars of the SHA256 of the spec text).
//! The transitions file includes a reverse index from invariant ID to the
//! transitions that enforce it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::errors::{CoreError, CoreResult, FsmError};
use crate::fsm::model::{Machine, MachineLevel, StateDef, Transition};

/// Hex length of the stored checksum prefix.
const CHECKSUM_PREFIX_LEN: usize = 16;

/// `<slug>.states.json` payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatesFile {
    pub machine: String,
    pub name: String,
    pub level: MachineLevel,
    pub initial: String,
    pub terminals: Vec<String>,
    pub states: Vec<StateDef>,
}

/// `<slug>.transitions.json` payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct TransitionsFile {
    pub machine: String,
    pub transitions: Vec<Transition>,
    /// Reverse index: invariant ID to the transitions enforcing it
    #[serde(default)]
    pub invariant_index: BTreeMap<String, Vec<String>>,
}

/// One machine entry of `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub slug: String,
    pub name: String,
    pub level: MachineLevel,
    pub states_file: String,
    pub transitions_file: String,
}

/// `index.json` payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_machine: Option<String>,
    pub machines: Vec<IndexEntry>,
    pub spec_checksum: String,
}

/// First 16 hex chars of the SHA256 of the spec text.
pub fn spec_checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..CHECKSUM_PREFIX_LEN].to_string()
}

/// Write every machine plus the index into `dir`.
pub fn export_machines(
    dir: &Path,
    machines: &[Machine],
    primary: Option<&str>,
    spec_text: &str,
) -> CoreResult<IndexFile> {
    fs::create_dir_all(dir).map_err(|source| CoreError::IoWriteFailed {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::with_capacity(machines.len());
    for machine in machines {
        let states_file = format!("{}.states.json", machine.slug);
        let transitions_file = format!("{}.transitions.json", machine.slug);

        let states = StatesFile {
            machine: machine.slug.clone(),
            name: machine.name.clone(),
            level: machine.level,
            initial: machine.initial.clone(),
            terminals: machine.terminal_ids().iter().map(|s| s.to_string()).collect(),
            states: machine.states.clone(),
        };
        write_json(&dir.join(&states_file), &states)?;

        let transitions = TransitionsFile {
            machine: machine.slug.clone(),
            transitions: machine.transitions.clone(),
            invariant_index: build_invariant_index(&machine.transitions),
        };
        write_json(&dir.join(&transitions_file), &transitions)?;

        entries.push(IndexEntry {
            slug: machine.slug.clone(),
            name: machine.name.clone(),
            level: machine.level,
            states_file,
            transitions_file,
        });
    }

    let index = IndexFile {
        primary_machine: primary.map(String::from),
        machines: entries,
        spec_checksum: spec_checksum(spec_text),
    };
    write_json(&dir.join("index.json"), &index)?;
    info!(machines = machines.len(), dir = %dir.display(), "exported behavior model");
    Ok(index)
}

fn build_invariant_index(transitions: &[Transition]) -> BTreeMap<String, Vec<String>> {
    let mut index: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for transition in transitions {
        if let Some(id) = transition
            .guard
            .as_ref()
            .and_then(|g| g.invariant_id.as_ref())
        {
            index.entry(id.clone()).or_default().push(transition.id.clone());
        }
    }
    index
}

/// Load `index.json` from an FSM directory.
pub fn load_index(dir: &Path) -> CoreResult<IndexFile> {
    let path = dir.join("index.json");
    if !path.exists() {
        return Err(FsmError::NotFound { path }.into());
    }
    read_json(&path)
}

/// Reassemble one machine from its index entry.
pub fn load_machine(dir: &Path, entry: &IndexEntry) -> CoreResult<Machine> {
    let states: StatesFile = read_json(&dir.join(&entry.states_file))?;
    let transitions: TransitionsFile = read_json(&dir.join(&entry.transitions_file))?;
    Ok(Machine {
        slug: states.machine,
        name: states.name,
        level: states.level,
        initial: states.initial,
        states: states.states,
        transitions: transitions.transitions,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let mut json = serde_json::to_string_pretty(value)
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("fsm serialization: {e}")))?;
    json.push('\n');
    fs::write(path, json.as_bytes()).map_err(|source| CoreError::IoWriteFailed {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> CoreResult<T> {
    if !path.exists() {
        return Err(FsmError::NotFound {
            path: path.to_path_buf(),
        }
        .into());
    }
    let raw = fs::read_to_string(path).map_err(|source| CoreError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| {
            FsmError::CompileFailed {
                workflow: path.display().to_string(),
                detail: e.to_string(),
            }
            .into()
        })
}
