//  DEPLOY.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the deployment profile engine: each profile watches a
//!   local source tree (polling scanner with a debounce window) and, on
//!   change, runs a pre-script -> file-sync -> post-script job sequence
//!   on every matching node, tracked as a DeploymentExecution. The sync
//!   payload is a content-addressed manifest whose hash is
//!   order-invariant over the file set.
//

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use enum_debug::EnumDebug;
use log::{debug, error, info, warn};
use orbitmesh_cfg::node::FileSyncConfig;
use orbitmesh_reg::registry::NodeRegistry;
use orbitmesh_tsk::manager::JobManager;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use specifications::agents::AgentInfo;
use specifications::jobs::{Job, JobRequest, JobStatus};

pub use crate::errors::DeployError as Error;


/***** CONSTANTS *****/
/// How often running executions poll their current job.
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The command the file-sync capability handler listens on.
pub const SYNC_COMMAND: &str = "file.sync";
/// The command the script capability handler listens on.
pub const SCRIPT_COMMAND: &str = "script.run";





/***** HELPER FUNCTIONS *****/
/// Matches a `*`-wildcard pattern against a string.
fn wild_match(pattern: &[u8], value: &[u8]) -> bool {
    if pattern.is_empty() {
        return value.is_empty();
    }
    if pattern[0] == b'*' {
        wild_match(&pattern[1..], value) || (!value.is_empty() && wild_match(pattern, &value[1..]))
    } else {
        !value.is_empty() && pattern[0] == value[0] && wild_match(&pattern[1..], &value[1..])
    }
}

/// Returns whether a relative path passes the include/exclude filters.
fn path_selected(path: &str, include: &[String], exclude: &[String]) -> bool {
    if exclude.iter().any(|pattern| wild_match(pattern.as_bytes(), path.as_bytes())) {
        return false;
    }
    include.is_empty() || include.iter().any(|pattern| wild_match(pattern.as_bytes(), path.as_bytes()))
}

/// Recursively collects the files under `dir` into `entries`, keyed by their path relative to
/// `root`.
fn collect_files(root: &Path, dir: &Path, include: &[String], exclude: &[String], entries: &mut Vec<ManifestEntry>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path: PathBuf = entry.path();
        if path.is_dir() {
            collect_files(root, &path, include, exclude, entries)?;
            continue;
        }

        let relative: String = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().replace('\\', "/");
        if !path_selected(&relative, include, exclude) {
            continue;
        }
        let contents: Vec<u8> = std::fs::read(&path)?;
        entries.push(ManifestEntry { path: relative, size: contents.len() as u64, checksum: hex::encode(Sha256::digest(&contents)) });
    }
    Ok(())
}





/***** AUXILLARY *****/
/// How the file-sync handler applies the manifest.
#[derive(Clone, Copy, Debug, Default, EnumDebug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Copy changed files, leave everything else alone.
    #[default]
    Update,
    /// Make the target identical to the source tree.
    Mirror,
}

/// The phases a deployment execution moves through.
#[derive(Clone, Copy, Debug, EnumDebug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    /// Created, nothing dispatched yet.
    Starting,
    /// The pre-script job is out.
    PreScript,
    /// The file-sync job is out.
    FileSync,
    /// The post-script job is out.
    PostScript,
    /// Terminal: the whole sequence succeeded.
    Completed,
    /// Terminal: a stage failed (or the execution was cancelled).
    Failed,
}
impl DeploymentPhase {
    /// Returns whether this phase is terminal.
    #[inline]
    pub fn is_terminal(&self) -> bool { matches!(self, Self::Completed | Self::Failed) }
}

/// One file of a sync manifest.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ManifestEntry {
    /// Path relative to the profile's source root, `/`-separated.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Hex-encoded SHA-256 of the file contents.
    pub checksum: String,
}

/// The content-addressed description of a source tree.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SyncManifest {
    /// The selected files.
    pub entries: Vec<ManifestEntry>,
}
impl SyncManifest {
    /// Scans a source tree into a manifest.
    ///
    /// # Arguments
    /// - `root`: The tree to scan.
    /// - `include`: Wildcard patterns a file must match (all files when empty).
    /// - `exclude`: Wildcard patterns that drop a file.
    ///
    /// # Errors
    /// This function errors if the tree cannot be read.
    pub fn scan(root: &Path, include: &[String], exclude: &[String]) -> std::io::Result<Self> {
        let mut entries: Vec<ManifestEntry> = Vec::new();
        collect_files(root, root, include, exclude, &mut entries)?;
        Ok(Self { entries })
    }

    /// Computes the manifest's content hash: identical file sets produce identical hashes in
    /// any order; any change in a path, size or checksum changes it.
    pub fn content_hash(&self) -> String {
        let mut sorted: Vec<&ManifestEntry> = self.entries.iter().collect();
        sorted.sort_by(|lhs, rhs| lhs.path.cmp(&rhs.path));

        let mut hasher: Sha256 = Sha256::new();
        for entry in sorted {
            hasher.update(entry.path.as_bytes());
            hasher.update([0u8]);
            hasher.update(entry.size.to_le_bytes());
            hasher.update(entry.checksum.as_bytes());
            hasher.update([b'\n']);
        }
        hex::encode(hasher.finalize())
    }
}

/// One deployment profile.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeploymentProfile {
    /// Stable id of the profile.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// The local source tree to watch.
    pub source_path: PathBuf,
    /// Wildcard pattern selecting target nodes by name (or id).
    pub target_agent_pattern: String,
    /// File include patterns (all files when empty).
    #[serde(default)]
    pub include: Vec<String>,
    /// File exclude patterns.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Whether files absent from the manifest are deleted on the node.
    #[serde(default)]
    pub delete_orphans: bool,
    /// How the manifest is applied.
    #[serde(default)]
    pub mode: SyncMode,
    /// Script run on the node before the sync.
    #[serde(default)]
    pub pre_script: Option<String>,
    /// Script run on the node after the sync.
    #[serde(default)]
    pub post_script: Option<String>,
    /// The debounce window for the change watcher, in seconds.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    /// Whether the watcher deploys this profile automatically.
    #[serde(default)]
    pub enabled: bool,
}

/// Provides the serde default for `debounce_secs`.
#[inline]
fn default_debounce_secs() -> u64 { 2 }

/// One tracked run of a profile on one node.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeploymentExecution {
    /// Stable id of the execution.
    pub id: String,
    /// The profile that ran.
    pub profile_id: String,
    /// The node it ran on.
    pub agent_id: String,
    /// Current phase.
    pub phase: DeploymentPhase,
    /// The error that failed it, if any.
    #[serde(default)]
    pub error: Option<String>,
    /// The manifest hash that was deployed.
    pub manifest_hash: String,
    /// The job currently out for this execution, if any.
    #[serde(default)]
    pub current_job_id: Option<String>,
    /// When the execution was created.
    pub started_at: DateTime<Utc>,
    /// When it reached a terminal phase.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// The watcher's per-profile change tracking.
#[derive(Debug, Default)]
struct WatchState {
    /// The hash last deployed (or first observed).
    last_hash: Option<String>,
    /// A changed hash waiting out the debounce window.
    pending_hash: Option<String>,
    /// When the pending hash was first seen.
    pending_since: Option<Instant>,
}





/***** LIBRARY *****/
/// The deployment profile engine.
#[derive(Debug)]
pub struct DeploymentEngine {
    /// All profiles, keyed by id.
    profiles: DashMap<String, DeploymentProfile>,
    /// All executions, oldest first.
    executions: RwLock<Vec<DeploymentExecution>>,
    /// The watcher's change tracking, keyed by profile id.
    watch: DashMap<String, WatchState>,
    /// The registry target patterns match against.
    registry: Arc<NodeRegistry>,
    /// The job manager the sequences run through.
    manager: Arc<JobManager>,
    /// The root all source paths must live under, if configured.
    root: Option<PathBuf>,
    /// Whether the feature is enabled at all.
    enabled: bool,
}

impl DeploymentEngine {
    /// Constructor for the DeploymentEngine.
    ///
    /// # Arguments
    /// - `registry`: The node registry.
    /// - `manager`: The job manager.
    /// - `config`: The host's file-sync feature config.
    pub fn new(registry: Arc<NodeRegistry>, manager: Arc<JobManager>, config: &FileSyncConfig) -> Self {
        Self {
            profiles: DashMap::new(),
            executions: RwLock::new(Vec::new()),
            watch: DashMap::new(),
            registry,
            manager,
            root: config.root_path.clone(),
            enabled: config.enabled,
        }
    }

    /// Returns whether the feature is enabled.
    #[inline]
    pub fn is_enabled(&self) -> bool { self.enabled }

    /// Stores a profile (create or update), validating its source path against the root.
    ///
    /// # Errors
    /// This function errors if the feature is disabled or the path escapes the root.
    pub fn store_profile(&self, profile: DeploymentProfile) -> Result<(), Error> {
        if !self.enabled {
            return Err(Error::FeatureDisabled);
        }
        if let Some(root) = &self.root {
            if !profile.source_path.starts_with(root) {
                return Err(Error::OutsideRoot { path: profile.source_path.clone(), root: root.clone() });
            }
        }
        info!("Storing deployment profile '{}' ('{}')", profile.id, profile.name);
        self.profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    /// Returns a clone of the given profile.
    #[inline]
    pub fn get_profile(&self, profile_id: &str) -> Option<DeploymentProfile> { self.profiles.get(profile_id).map(|profile| profile.clone()) }

    /// Returns clones of all profiles, sorted by id.
    pub fn list_profiles(&self) -> Vec<DeploymentProfile> {
        let mut profiles: Vec<DeploymentProfile> = self.profiles.iter().map(|profile| profile.clone()).collect();
        profiles.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
        profiles
    }

    /// Removes the given profile.
    ///
    /// # Errors
    /// This function errors if the profile is unknown.
    pub fn remove_profile(&self, profile_id: &str) -> Result<(), Error> {
        self.watch.remove(profile_id);
        match self.profiles.remove(profile_id) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownProfile { id: profile_id.into() }),
        }
    }

    /// Returns the nodes the given profile's target pattern currently matches.
    ///
    /// # Errors
    /// This function errors if the profile is unknown.
    pub fn matching_agents(&self, profile_id: &str) -> Result<Vec<AgentInfo>, Error> {
        let profile: DeploymentProfile = self.get_profile(profile_id).ok_or_else(|| Error::UnknownProfile { id: profile_id.into() })?;
        let pattern: &[u8] = profile.target_agent_pattern.as_bytes();
        Ok(self
            .registry
            .eligible()
            .into_iter()
            .filter(|agent| wild_match(pattern, agent.name.as_bytes()) || wild_match(pattern, agent.id.as_bytes()))
            .collect())
    }

    /// Deploys the given profile now, to every matching node.
    ///
    /// # Returns
    /// The ids of the created executions (one per matching node).
    ///
    /// # Errors
    /// This function errors if the profile is unknown or its source cannot be scanned.
    pub fn deploy(self: &Arc<Self>, profile_id: &str) -> Result<Vec<String>, Error> {
        let profile: DeploymentProfile = self.get_profile(profile_id).ok_or_else(|| Error::UnknownProfile { id: profile_id.into() })?;
        let manifest: SyncManifest = SyncManifest::scan(&profile.source_path, &profile.include, &profile.exclude)
            .map_err(|err| Error::ScanError { path: profile.source_path.clone(), err })?;
        self.deploy_manifest(&profile, manifest)
    }

    /// Deploys an already-scanned manifest.
    fn deploy_manifest(self: &Arc<Self>, profile: &DeploymentProfile, manifest: SyncManifest) -> Result<Vec<String>, Error> {
        let hash: String = manifest.content_hash();
        let agents: Vec<AgentInfo> = self.matching_agents(&profile.id)?;
        if agents.is_empty() {
            warn!("Deployment profile '{}' matches no eligible nodes", profile.id);
        }

        let mut execution_ids: Vec<String> = Vec::with_capacity(agents.len());
        for agent in agents {
            let execution: DeploymentExecution = DeploymentExecution {
                id: uuid::Uuid::new_v4().to_string(),
                profile_id: profile.id.clone(),
                agent_id: agent.id.clone(),
                phase: DeploymentPhase::Starting,
                error: None,
                manifest_hash: hash.clone(),
                current_job_id: None,
                started_at: Utc::now(),
                completed_at: None,
            };
            execution_ids.push(execution.id.clone());
            self.executions.write().push(execution.clone());

            info!("Deploying profile '{}' to agent '{}' (execution '{}')", profile.id, agent.id, execution.id);
            let engine: Arc<Self> = self.clone();
            let profile: DeploymentProfile = profile.clone();
            let manifest: SyncManifest = manifest.clone();
            tokio::spawn(async move {
                engine.run_sequence(profile, agent.id, manifest, execution.id).await;
            });
        }
        Ok(execution_ids)
    }

    /// Runs the pre-script -> file-sync -> post-script sequence on one node.
    async fn run_sequence(&self, profile: DeploymentProfile, agent_id: String, manifest: SyncManifest, execution_id: String) {
        // Pre-script
        if let Some(script) = &profile.pre_script {
            self.update_execution(&execution_id, |execution| execution.phase = DeploymentPhase::PreScript);
            let params: serde_json::Value = serde_json::json!({ "script": script });
            if let Err(err) = self.run_stage(&execution_id, &agent_id, SCRIPT_COMMAND, params, "pre-script").await {
                self.fail_execution(&execution_id, err);
                return;
            }
        }

        // File sync
        self.update_execution(&execution_id, |execution| execution.phase = DeploymentPhase::FileSync);
        let params: serde_json::Value = serde_json::json!({
            "manifest": manifest,
            "delete_orphans": profile.delete_orphans,
            "mode": profile.mode,
        });
        if let Err(err) = self.run_stage(&execution_id, &agent_id, SYNC_COMMAND, params, "file-sync").await {
            self.fail_execution(&execution_id, err);
            return;
        }

        // Post-script
        if let Some(script) = &profile.post_script {
            self.update_execution(&execution_id, |execution| execution.phase = DeploymentPhase::PostScript);
            let params: serde_json::Value = serde_json::json!({ "script": script });
            if let Err(err) = self.run_stage(&execution_id, &agent_id, SCRIPT_COMMAND, params, "post-script").await {
                self.fail_execution(&execution_id, err);
                return;
            }
        }

        info!("Execution '{execution_id}' completed");
        self.update_execution(&execution_id, |execution| {
            execution.phase = DeploymentPhase::Completed;
            execution.current_job_id = None;
            execution.completed_at = Some(Utc::now());
        });
    }

    /// Enqueues one stage job and waits for its terminal state.
    async fn run_stage(&self, execution_id: &str, agent_id: &str, command: &str, params: serde_json::Value, stage: &str) -> Result<(), String> {
        let mut request: JobRequest = JobRequest::new(command);
        request.idempotency_key = Some(format!("deploy:{execution_id}:{stage}"));
        request.parameters = serde_json::to_vec(&params).unwrap_or_default();
        request.target_agent_id = Some(agent_id.into());
        request.correlation_id = Some(execution_id.into());

        let job: Job = self.manager.enqueue(request).await.map_err(|err| format!("failed to enqueue {stage} job: {err}"))?;
        let job_id: String = job.id().to_string();
        self.update_execution(execution_id, |execution| execution.current_job_id = Some(job_id.clone()));

        loop {
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
            let job: Job = match self.manager.get(&job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => return Err(format!("{stage} job '{job_id}' vanished")),
                Err(err) => return Err(format!("failed to poll {stage} job '{job_id}': {err}")),
            };
            if !job.is_terminal() {
                continue;
            }
            return match job.status {
                JobStatus::Completed => Ok(()),
                other => {
                    let error: String = job.result.and_then(|result| result.error).unwrap_or_else(|| other.to_string());
                    Err(format!("{stage} job ended {other}: {error}"))
                },
            };
        }
    }

    /// Marks an execution failed.
    fn fail_execution(&self, execution_id: &str, error: String) {
        warn!("Execution '{execution_id}' failed: {error}");
        self.update_execution(execution_id, |execution| {
            execution.phase = DeploymentPhase::Failed;
            execution.error = Some(error.clone());
            execution.completed_at = Some(Utc::now());
        });
    }

    /// Applies a mutation to a stored execution.
    fn update_execution(&self, execution_id: &str, mutate: impl FnOnce(&mut DeploymentExecution)) {
        let mut executions = self.executions.write();
        if let Some(execution) = executions.iter_mut().find(|execution| execution.id == execution_id) {
            mutate(execution);
        }
    }

    /// Returns a page of executions, newest first.
    pub fn list_executions(&self, offset: usize, limit: usize) -> Vec<DeploymentExecution> {
        let executions = self.executions.read();
        executions.iter().rev().skip(offset).take(limit).cloned().collect()
    }

    /// Returns a clone of the given execution.
    pub fn get_execution(&self, execution_id: &str) -> Option<DeploymentExecution> {
        self.executions.read().iter().find(|execution| execution.id == execution_id).cloned()
    }

    /// Cancels a running execution (cancelling its current job, if any).
    ///
    /// # Errors
    /// This function errors if the execution is unknown.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<(), Error> {
        let execution: DeploymentExecution =
            self.get_execution(execution_id).ok_or_else(|| Error::UnknownExecution { id: execution_id.into() })?;
        if execution.phase.is_terminal() {
            return Ok(());
        }

        if let Some(job_id) = &execution.current_job_id {
            if let Err(err) = self.manager.cancel(job_id, Some("deployment cancelled".into())).await {
                debug!("Failed to cancel job '{job_id}' of execution '{execution_id}': {err}");
            }
        }
        self.fail_execution(execution_id, "cancelled".into());
        Ok(())
    }

    /// Summarises the executions per phase (for the status endpoint).
    pub fn status_summary(&self) -> HashMap<String, usize> {
        let mut summary: HashMap<String, usize> = HashMap::new();
        for execution in self.executions.read().iter() {
            *summary.entry(format!("{:?}", execution.phase).to_lowercase()).or_insert(0) += 1;
        }
        summary
    }

    /// Runs one watcher pass over every enabled profile: scan, debounce, deploy on settled
    /// change.
    ///
    /// # Returns
    /// The profile ids that were deployed in this pass.
    pub fn watch_once(self: &Arc<Self>) -> Vec<String> {
        let mut deployed: Vec<String> = Vec::new();
        for profile in self.list_profiles() {
            if !profile.enabled {
                continue;
            }
            let manifest: SyncManifest = match SyncManifest::scan(&profile.source_path, &profile.include, &profile.exclude) {
                Ok(manifest) => manifest,
                Err(err) => {
                    warn!("Failed to scan source of profile '{}': {err}", profile.id);
                    continue;
                },
            };
            let hash: String = manifest.content_hash();

            let mut state = self.watch.entry(profile.id.clone()).or_default();
            match &state.last_hash {
                // First observation is the baseline, not a change
                None => {
                    state.last_hash = Some(hash);
                    continue;
                },
                Some(last) if *last == hash => {
                    // Nothing new; also settles a pending change that reverted
                    state.pending_hash = None;
                    state.pending_since = None;
                    continue;
                },
                Some(_) => {},
            }

            // A (still-)changed tree: wait out the debounce window before deploying
            let debounce: Duration = Duration::from_secs(profile.debounce_secs);
            match (&state.pending_hash, state.pending_since) {
                (Some(pending), Some(since)) if *pending == hash => {
                    if since.elapsed() >= debounce {
                        debug!("Change of profile '{}' settled; deploying", profile.id);
                        state.last_hash = Some(hash);
                        state.pending_hash = None;
                        state.pending_since = None;
                        drop(state);
                        match self.deploy_manifest(&profile, manifest) {
                            Ok(_) => deployed.push(profile.id.clone()),
                            Err(err) => error!("Auto-deploy of profile '{}' failed: {err}", profile.id),
                        }
                    }
                },
                _ => {
                    state.pending_hash = Some(hash);
                    state.pending_since = Some(Instant::now());
                },
            }
        }
        deployed
    }

    /// Can be run as a `tokio` background task to watch all profiles.
    ///
    /// # Arguments
    /// - `engine`: Weak handle on the engine; the task ends when it is dropped.
    /// - `interval`: The pause between scans.
    pub async fn watch_cycle(engine: Weak<Self>, interval: Duration) {
        debug!("Starting deployment watcher ({interval:?})");
        loop {
            tokio::time::sleep(interval).await;
            let engine: Arc<Self> = match engine.upgrade() {
                Some(engine) => engine,
                None => {
                    info!("Deployment watcher ending: engine deallocated");
                    break;
                },
            };
            if engine.is_enabled() {
                engine.watch_once();
            }
        }
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use orbitmesh_tsk::manager::JobManagerConfig;
    use orbitmesh_tsk::repository::MemJobRepository;
    use specifications::jobs::JobResult;

    use super::*;

    #[test]
    fn test_manifest_hash_is_order_invariant() {
        let a: ManifestEntry = ManifestEntry { path: "a.txt".into(), size: 3, checksum: "aaa".into() };
        let b: ManifestEntry = ManifestEntry { path: "b/b.txt".into(), size: 5, checksum: "bbb".into() };

        let forwards: SyncManifest = SyncManifest { entries: vec![a.clone(), b.clone()] };
        let backwards: SyncManifest = SyncManifest { entries: vec![b.clone(), a.clone()] };
        assert_eq!(forwards.content_hash(), backwards.content_hash());

        // Any change in path, size or checksum changes the hash
        let mut renamed: SyncManifest = forwards.clone();
        renamed.entries[0].path = "a2.txt".into();
        assert_ne!(renamed.content_hash(), forwards.content_hash());
        let mut resized: SyncManifest = forwards.clone();
        resized.entries[0].size = 4;
        assert_ne!(resized.content_hash(), forwards.content_hash());
        let mut rewritten: SyncManifest = forwards.clone();
        rewritten.entries[0].checksum = "ccc".into();
        assert_ne!(rewritten.content_hash(), forwards.content_hash());
    }

    #[test]
    fn test_wildcard_patterns() {
        assert!(path_selected("src/main.rs", &[], &[]));
        assert!(path_selected("src/main.rs", &["src/*".into()], &[]));
        assert!(!path_selected("docs/readme.md", &["src/*".into()], &[]));
        assert!(!path_selected("build/out.tmp", &[], &["*.tmp".into()]));
        assert!(path_selected("build/out.txt", &[], &["*.tmp".into()]));
    }

    #[test]
    fn test_scan_tempdir() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("nested.txt"), b"world").unwrap();
        std::fs::write(dir.path().join("skip.tmp"), b"junk").unwrap();

        let manifest: SyncManifest = SyncManifest::scan(dir.path(), &[], &["*.tmp".to_string()]).unwrap();
        let mut paths: Vec<&str> = manifest.entries.iter().map(|entry| entry.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["keep.txt", "sub/nested.txt"]);
        assert_eq!(manifest.entries.iter().find(|entry| entry.path == "keep.txt").unwrap().size, 5);
    }

    /// Builds an engine with one registered node and one profile over a temp dir.
    fn engine_with_profile(dir: &Path) -> (Arc<DeploymentEngine>, Arc<JobManager>) {
        let registry: Arc<NodeRegistry> = Arc::new(NodeRegistry::new());
        registry.register(AgentInfo::new("a1", "builder-1"), "conn-1");
        let manager: Arc<JobManager> = Arc::new(JobManager::new(Arc::new(MemJobRepository::new()), JobManagerConfig::default()));

        let engine: Arc<DeploymentEngine> =
            Arc::new(DeploymentEngine::new(registry, manager.clone(), &FileSyncConfig { enabled: true, root_path: None }));
        engine
            .store_profile(DeploymentProfile {
                id: "p1".into(),
                name: "web assets".into(),
                source_path: dir.into(),
                target_agent_pattern: "builder-*".into(),
                include: Vec::new(),
                exclude: Vec::new(),
                delete_orphans: false,
                mode: SyncMode::Update,
                pre_script: Some("echo pre".into()),
                post_script: None,
                debounce_secs: 0,
                enabled: true,
            })
            .unwrap();
        (engine, manager)
    }

    #[tokio::test]
    async fn test_deploy_runs_job_sequence() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("site.html"), b"<html/>").unwrap();
        let (engine, manager) = engine_with_profile(dir.path());

        // The profile targets the registered node
        assert_eq!(engine.matching_agents("p1").unwrap().len(), 1);
        let executions: Vec<String> = engine.deploy("p1").unwrap();
        assert_eq!(executions.len(), 1);

        // Play the node: complete every job the sequence enqueues (pre-script, then sync)
        let mut commands: Vec<String> = Vec::new();
        for _ in 0..200 {
            if let Ok(Some(job)) = manager.dequeue_next(&Default::default(), &Default::default()).await {
                let id: String = job.id().to_string();
                commands.push(job.request.command.clone());
                manager.assign(&id, "a1").await.unwrap();
                manager.acknowledge(&id, "a1").await.unwrap();
                manager.complete(&id, JobResult::completed(&id, vec![], Duration::ZERO)).await.unwrap();
            }
            if engine.get_execution(&executions[0]).map(|execution| execution.phase.is_terminal()).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let execution: DeploymentExecution = engine.get_execution(&executions[0]).unwrap();
        assert_eq!(execution.phase, DeploymentPhase::Completed);
        assert_eq!(commands, vec![SCRIPT_COMMAND.to_string(), SYNC_COMMAND.to_string()]);
        assert!(!execution.manifest_hash.is_empty());
    }

    #[tokio::test]
    async fn test_watcher_debounces_changes() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("site.html"), b"v1").unwrap();
        let (engine, _manager) = engine_with_profile(dir.path());

        // First pass is the baseline
        assert!(engine.watch_once().is_empty());
        // No change, no deploy
        assert!(engine.watch_once().is_empty());

        // A change needs two passes: one to arm the pending hash, one (after the window) to
        // deploy; the profile's window is zero so the second pass fires
        std::fs::write(dir.path().join("site.html"), b"v2").unwrap();
        assert!(engine.watch_once().is_empty());
        assert_eq!(engine.watch_once(), vec!["p1".to_string()]);

        // Settled again
        assert!(engine.watch_once().is_empty());
    }

    #[test]
    fn test_root_confinement() {
        let registry: Arc<NodeRegistry> = Arc::new(NodeRegistry::new());
        let manager: Arc<JobManager> = Arc::new(JobManager::new(Arc::new(MemJobRepository::new()), JobManagerConfig::default()));
        let engine: DeploymentEngine =
            DeploymentEngine::new(registry, manager, &FileSyncConfig { enabled: true, root_path: Some(PathBuf::from("/srv/deploy")) });

        let mut profile: DeploymentProfile = DeploymentProfile {
            id: "p1".into(),
            name: "escapes".into(),
            source_path: PathBuf::from("/etc"),
            target_agent_pattern: "*".into(),
            include: Vec::new(),
            exclude: Vec::new(),
            delete_orphans: false,
            mode: SyncMode::Update,
            pre_script: None,
            post_script: None,
            debounce_secs: 2,
            enabled: false,
        };
        assert!(matches!(engine.store_profile(profile.clone()), Err(Error::OutsideRoot { .. })));
        profile.source_path = PathBuf::from("/srv/deploy/web");
        engine.store_profile(profile).unwrap();
    }
}
