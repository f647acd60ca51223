use std::env;
use std::fs;
use std::path::PathBuf;

use stage_engine::{
    ContextHandle, JsonFileProgressStore, ManifestError, ProgressStoreError, Session,
    SessionManifest, SystemClock,
};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use super::loop_runner::LoopConfig;

const MANIFEST_ENV_VAR: &str = "PLAYTHROUGH_MANIFEST";
const STAGES_ENV_VAR: &str = "PLAYTHROUGH_STAGES";
const DATA_DIR_ENV_VAR: &str = "PLAYTHROUGH_DATA_DIR";
const RETURN_CONTEXT_ENV_VAR: &str = "PLAYTHROUGH_RETURN_CONTEXT";
const DEFAULT_DATA_DIR: &str = "data";
const PROGRESS_FILE_NAME: &str = "progress.json";
const DEFAULT_MANIFEST: &str = include_str!("../../config/default_session.json");

#[derive(Debug, Error)]
pub(crate) enum StartupError {
    #[error("failed to read manifest {path}: {source}")]
    ReadManifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest {origin}: {message}")]
    ParseManifest { origin: String, message: String },
    #[error("invalid manifest {origin}: {source}")]
    InvalidManifest {
        origin: String,
        #[source]
        source: ManifestError,
    },
    #[error(transparent)]
    Progress(#[from] ProgressStoreError),
}

pub(crate) struct AppWiring {
    pub(crate) config: LoopConfig,
    pub(crate) session: Session,
    pub(crate) selection: Vec<usize>,
    pub(crate) return_context: Option<ContextHandle>,
}

pub(crate) fn build_app() -> Result<AppWiring, StartupError> {
    init_tracing();
    info!("=== Playthrough Startup ===");

    let (origin, raw) = read_manifest_source()?;
    let manifest = parse_manifest(&raw).map_err(|message| StartupError::ParseManifest {
        origin: origin.clone(),
        message,
    })?;
    let env = manifest
        .build_environment()
        .map_err(|source| StartupError::InvalidManifest {
            origin: origin.clone(),
            source,
        })?;

    let progress_path = resolve_data_dir().join(PROGRESS_FILE_NAME);
    let progress = JsonFileProgressStore::open(&progress_path)?;
    info!(
        manifest = %origin,
        progress = %progress.path().display(),
        first_time = progress.record().first_time,
        "startup"
    );

    let selection = match env::var(STAGES_ENV_VAR) {
        Ok(raw) => parse_stage_selection(&raw, manifest.flow.stages.len()),
        Err(_) => (0..manifest.flow.stages.len()).collect(),
    };
    let return_context = env::var(RETURN_CONTEXT_ENV_VAR)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(ContextHandle::new);

    let session = Session::new(
        env,
        manifest.session_config(),
        Box::new(SystemClock::default()),
        Box::new(progress),
    );

    Ok(AppWiring {
        config: LoopConfig::default(),
        session,
        selection,
        return_context,
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn read_manifest_source() -> Result<(String, String), StartupError> {
    match env::var_os(MANIFEST_ENV_VAR) {
        Some(path) => {
            let path = PathBuf::from(path);
            let raw = fs::read_to_string(&path).map_err(|source| StartupError::ReadManifest {
                path: path.clone(),
                source,
            })?;
            Ok((path.display().to_string(), raw))
        }
        None => Ok(("<embedded default>".to_string(), DEFAULT_MANIFEST.to_string())),
    }
}

fn resolve_data_dir() -> PathBuf {
    env::var_os(DATA_DIR_ENV_VAR)
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

pub(crate) fn parse_manifest(raw: &str) -> Result<SessionManifest, String> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    match serde_path_to_error::deserialize::<_, SessionManifest>(&mut deserializer) {
        Ok(manifest) => Ok(manifest),
        Err(error) => {
            let path = error.path().to_string();
            let source = error.into_inner();
            if path.is_empty() || path == "." {
                Err(format!("{source}"))
            } else {
                Err(format!("at {path}: {source}"))
            }
        }
    }
}

/// Parses a comma-separated list of stage indices. Entries that are not
/// numbers or fall outside the stage table are skipped. The result is
/// sorted ascending with duplicates removed, matching how selections are
/// collected interactively.
pub(crate) fn parse_stage_selection(raw: &str, stage_count: usize) -> Vec<usize> {
    let mut selection = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        match entry.parse::<usize>() {
            Ok(index) if index < stage_count => selection.push(index),
            Ok(index) => warn!(index, stage_count, "stage_selection_out_of_range"),
            Err(_) => warn!(entry, "stage_selection_not_a_number"),
        }
    }
    selection.sort_unstable();
    selection.dedup();
    selection
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_manifest_parses_and_validates() {
        let manifest = parse_manifest(DEFAULT_MANIFEST).expect("embedded manifest");
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.flow.stages.len(), 3);
        assert!(manifest.build_environment().is_ok());
    }

    #[test]
    fn parse_error_carries_json_path() {
        let raw = r#"{
            "initial_context": "office",
            "contexts": { "office": { "roots": [ { "name": 7 } ] } },
            "flow": { "idle_context": "office", "stages": [] }
        }"#;
        let message = parse_manifest(raw).expect_err("bad name type");
        assert!(message.contains("contexts.office.roots[0].name"), "{message}");
    }

    #[test]
    fn stage_selection_is_sorted_and_skips_invalid_entries() {
        assert_eq!(parse_stage_selection("2, 0,x,,9,1,0", 3), vec![0, 1, 2]);
        assert!(parse_stage_selection("", 3).is_empty());
        assert!(parse_stage_selection("4,5", 3).is_empty());
    }
}
