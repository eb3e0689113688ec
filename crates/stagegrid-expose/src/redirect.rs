//! Redirection manager: local ports forwarded to remote workloads.
//!
//! Each redirection owns one port from the allocator and one forwarder
//! process. Setup is idempotent per workload id. A forwarder that fails
//! to start leaves its record behind with `Failed` status; nothing here
//! retries it.
//!
//! The table lock is held only while allocating and inserting the
//! `Pending` record, so two concurrent setups can never observe the
//! same free port. The port scan itself runs on the blocking pool.
//! Spawning, the startup grace wait, and alias writes all happen
//! outside the lock.
//!
//! Reserved ports (the agent's own listeners) are never handed out,
//! even when they are momentarily free.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use stagegrid_core::config::RedirectSection;
use stagegrid_core::{
    ExposureStatus, ExposureSummary, PortRedirection, WorkloadDescriptor, WorkloadId, epoch_secs,
};

use crate::alias::AliasFile;
use crate::error::{ExposeError, ExposeResult};
use crate::ports::PortAllocator;
use crate::process::{ManagedProcess, ProcessSpec};

/// Output lines quoted in the error of a forwarder that died at startup.
const FAILED_OUTPUT_TAIL: usize = 5;

struct RedirectionEntry {
    record: PortRedirection,
    forwarder: Option<ManagedProcess>,
}

pub struct RedirectionManager {
    allocator: PortAllocator,
    forwarder_program: String,
    forwarder_args: Vec<String>,
    startup_grace: Duration,
    aliases: Option<AliasFile>,
    alias_suffix: String,
    reserved: HashSet<u16>,
    entries: RwLock<HashMap<WorkloadId, RedirectionEntry>>,
}

impl RedirectionManager {
    pub fn new(config: &RedirectSection) -> Self {
        Self {
            allocator: PortAllocator::new(
                config.port_range_start,
                config.port_range_end,
                config.bind_host.clone(),
            ),
            forwarder_program: config.forwarder_program.clone(),
            forwarder_args: config.forwarder_args.clone(),
            startup_grace: config.startup_grace(),
            aliases: config
                .enable_alias
                .then(|| AliasFile::new(config.alias_file.clone())),
            alias_suffix: config.alias_suffix.clone(),
            reserved: HashSet::new(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Exclude `ports` from allocation. Port 0 is ignored.
    pub fn with_reserved_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.reserved.extend(ports.into_iter().filter(|p| *p != 0));
        self
    }

    pub fn reserved_ports(&self) -> &HashSet<u16> {
        &self.reserved
    }

    /// Forward a local port to `workload`'s remote address.
    ///
    /// Returns the existing record unchanged if the workload already has
    /// one. Port exhaustion is returned as an error and leaves no record,
    /// so a later call can try again once ports free up.
    pub async fn setup(
        &self,
        workload: &WorkloadDescriptor,
        local_address: &str,
    ) -> ExposeResult<PortRedirection> {
        let mut record = {
            let mut entries = self.entries.write().await;
            if let Some(existing) = entries.get(&workload.id) {
                debug!(
                    workload_id = %workload.id,
                    local_port = existing.record.local_port,
                    "redirection already exists"
                );
                return Ok(existing.record.clone());
            }

            let mut taken: HashSet<u16> = entries.values().map(|e| e.record.local_port).collect();
            taken.extend(&self.reserved);
            let local_port = match self.allocate(taken).await {
                Ok(port) => port,
                Err(e) => {
                    warn!(workload_id = %workload.id, error = %e, "cannot allocate redirection port");
                    return Err(e);
                }
            };

            let now = epoch_secs();
            let record = PortRedirection {
                workload_id: workload.id.clone(),
                workload_name: workload.name.clone(),
                remote_address: workload.remote_address.clone(),
                remote_port: workload.remote_port,
                local_address: local_address.to_string(),
                local_port,
                status: ExposureStatus::Pending,
                alias: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            entries.insert(
                workload.id.clone(),
                RedirectionEntry {
                    record: record.clone(),
                    forwarder: None,
                },
            );
            record
        };

        let forwarder = match self.start_forwarder(&record).await {
            Ok(process) => {
                record.status = ExposureStatus::Active;
                Some(process)
            }
            Err(message) => {
                error_log(&record, &message);
                record.status = ExposureStatus::Failed;
                record.last_error = Some(message);
                None
            }
        };

        if let Some(aliases) = self.aliases.as_ref().filter(|_| !local_address.is_empty()) {
            let hostname = format!("{}{}", workload.name, self.alias_suffix);
            match aliases.add(local_address, &hostname).await {
                Ok(()) => record.alias = Some(hostname),
                Err(e) => {
                    warn!(workload_id = %workload.id, error = %e, "failed to register name alias");
                }
            }
        }
        record.updated_at = epoch_secs();

        let mut entries = self.entries.write().await;
        match entries.get_mut(&workload.id) {
            Some(entry) => {
                entry.record = record.clone();
                entry.forwarder = forwarder;
            }
            None => {
                // Removed while we were starting the forwarder.
                drop(entries);
                if let Some(process) = forwarder {
                    if let Err(e) = process.stop().await {
                        warn!(workload_id = %workload.id, error = %e, "failed to stop orphaned forwarder");
                    }
                }
                if let (Some(aliases), Some(hostname)) = (&self.aliases, &record.alias) {
                    if let Err(e) = aliases.remove(hostname).await {
                        warn!(workload_id = %workload.id, error = %e, "failed to remove orphaned name alias");
                    }
                }
                return Err(ExposeError::RedirectionNotFound(workload.id.clone()));
            }
        }
        drop(entries);

        info!(
            workload_id = %record.workload_id,
            name = %record.workload_name,
            remote = %format!("{}:{}", record.remote_address, record.remote_port),
            local_address = %record.local_address,
            local_port = record.local_port,
            status = %record.status,
            "redirection set up"
        );
        Ok(record)
    }

    async fn allocate(&self, taken: HashSet<u16>) -> ExposeResult<u16> {
        let allocator = self.allocator.clone();
        tokio::task::spawn_blocking(move || allocator.allocate(&taken))
            .await
            .map_err(|e| ExposeError::Io(std::io::Error::other(e)))?
    }

    async fn start_forwarder(&self, record: &PortRedirection) -> Result<ManagedProcess, String> {
        if record.remote_address.trim().is_empty() {
            return Err("workload has no remote address".to_string());
        }
        let spec = ProcessSpec::from_template(
            &self.forwarder_program,
            &self.forwarder_args,
            &[
                ("local_port", record.local_port.to_string()),
                ("remote_host", record.remote_address.clone()),
                ("remote_port", record.remote_port.to_string()),
            ],
        );
        let process = ManagedProcess::spawn(spec).map_err(|e| e.to_string())?;

        tokio::time::sleep(self.startup_grace).await;
        if let Some(status) = process.exit_status().await {
            let output = process.output().await;
            let tail = output
                .iter()
                .rev()
                .take(FAILED_OUTPUT_TAIL)
                .rev()
                .cloned()
                .collect::<Vec<_>>()
                .join("; ");
            return Err(format!("forwarder exited during startup ({status}): {tail}"));
        }
        Ok(process)
    }

    /// Tear down the forwarder and alias, then delete the record.
    pub async fn remove(&self, workload_id: &str) -> ExposeResult<PortRedirection> {
        let entry = self
            .entries
            .write()
            .await
            .remove(workload_id)
            .ok_or_else(|| ExposeError::RedirectionNotFound(workload_id.to_string()))?;

        if let Some(process) = &entry.forwarder {
            if let Err(e) = process.stop().await {
                warn!(%workload_id, error = %e, "failed to stop forwarder");
            }
        }
        if let (Some(aliases), Some(hostname)) = (&self.aliases, &entry.record.alias) {
            if let Err(e) = aliases.remove(hostname).await {
                warn!(%workload_id, error = %e, "failed to remove name alias");
            }
        }

        info!(%workload_id, local_port = entry.record.local_port, "redirection removed");
        Ok(entry.record)
    }

    /// Mark redirections whose forwarder has exited as failed.
    ///
    /// Returns the ids that changed status on this pass.
    pub async fn check_forwarders(&self) -> Vec<WorkloadId> {
        let candidates: Vec<(WorkloadId, ManagedProcess)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, e)| e.record.status == ExposureStatus::Active)
                .filter_map(|(id, e)| e.forwarder.clone().map(|p| (id.clone(), p)))
                .collect()
        };

        let mut exited = Vec::new();
        for (id, process) in candidates {
            if let Some(status) = process.exit_status().await {
                exited.push((id, status.to_string()));
            }
        }
        if exited.is_empty() {
            return Vec::new();
        }

        let mut entries = self.entries.write().await;
        let mut changed = Vec::new();
        for (id, status) in exited {
            if let Some(entry) = entries.get_mut(&id) {
                warn!(workload_id = %id, %status, "forwarder exited");
                entry.record.status = ExposureStatus::Failed;
                entry.record.last_error = Some(format!("forwarder exited ({status})"));
                entry.record.updated_at = epoch_secs();
                changed.push(id);
            }
        }
        changed
    }

    pub async fn get(&self, workload_id: &str) -> Option<PortRedirection> {
        self.entries
            .read()
            .await
            .get(workload_id)
            .map(|e| e.record.clone())
    }

    pub async fn contains(&self, workload_id: &str) -> bool {
        self.entries.read().await.contains_key(workload_id)
    }

    /// All redirections, ordered by local port.
    pub async fn list(&self) -> Vec<PortRedirection> {
        let entries = self.entries.read().await;
        let mut out: Vec<PortRedirection> = entries.values().map(|e| e.record.clone()).collect();
        out.sort_by_key(|r| r.local_port);
        out
    }

    pub async fn by_remote_address(&self, address: &str) -> Option<PortRedirection> {
        self.entries
            .read()
            .await
            .values()
            .find(|e| e.record.remote_address == address)
            .map(|e| e.record.clone())
    }

    pub async fn by_local_address(&self, address: &str) -> Option<PortRedirection> {
        self.entries
            .read()
            .await
            .values()
            .find(|e| e.record.local_address == address)
            .map(|e| e.record.clone())
    }

    pub async fn summary(&self) -> ExposureSummary {
        let entries = self.entries.read().await;
        ExposureSummary::from_statuses(entries.values().map(|e| e.record.status))
    }

    /// Stop every forwarder. Records stay in the table.
    pub async fn shutdown(&self) {
        let processes: Vec<(WorkloadId, ManagedProcess)> = {
            let mut entries = self.entries.write().await;
            entries
                .iter_mut()
                .filter_map(|(id, e)| e.forwarder.take().map(|p| (id.clone(), p)))
                .collect()
        };
        for (id, process) in processes {
            if let Err(e) = process.stop().await {
                warn!(workload_id = %id, error = %e, "failed to stop forwarder on shutdown");
            }
        }
    }
}

fn error_log(record: &PortRedirection, message: &str) {
    warn!(
        workload_id = %record.workload_id,
        local_port = record.local_port,
        error = %message,
        "port forwarding failed"
    );
}
