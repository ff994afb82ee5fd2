//! Agent registry: the single authority on "is agent X reachable now?".
//!
//! Each online agent owns one entry holding the send side of its session's
//! job stream. Entries carry a generation counter so a stale session's
//! teardown can never evict the session that replaced it.

use coffer_protocol::defaults;
use coffer_protocol::{AgentId, JobAssignment};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent {0} is not connected")]
    AgentNotConnected(AgentId),

    #[error("failed to deliver assignment to agent {0}: {1}")]
    SendFailed(AgentId, String),
}

struct Entry {
    sender: mpsc::Sender<JobAssignment>,
    generation: u64,
    hostname: String,
}

/// Process-wide map of online agents. The mutex guards only the map;
/// sends happen on a cloned sender outside the critical section, so
/// distinct agents dispatch in parallel while one agent's sends serialize
/// through its bounded channel.
pub struct Registry {
    agents: Mutex<HashMap<AgentId, Entry>>,
    send_timeout: Duration,
    next_generation: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(defaults::SEND_TIMEOUT)
    }
}

impl Registry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            send_timeout,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Take ownership of a session's send handle. Any prior entry for the
    /// same agent is replaced; dropping its sender closes the stale
    /// session's job stream. Returns the generation to pass back to
    /// [`Registry::deregister`].
    pub fn register(
        &self,
        agent_id: AgentId,
        hostname: &str,
        sender: mpsc::Sender<JobAssignment>,
    ) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        if let Some(old) = agents.insert(
            agent_id,
            Entry {
                sender,
                generation,
                hostname: hostname.to_string(),
            },
        ) {
            info!(agent_id = %agent_id, hostname = %old.hostname, "replaced stale registry entry");
        }
        generation
    }

    /// Remove an agent's entry. Idempotent. Only removes when the stored
    /// generation matches, so an old session cannot deregister its
    /// replacement. Returns whether an entry was removed.
    pub fn deregister(&self, agent_id: AgentId, generation: u64) -> bool {
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        match agents.get(&agent_id) {
            Some(entry) if entry.generation == generation => {
                agents.remove(&agent_id);
                true
            }
            Some(_) => {
                debug!(agent_id = %agent_id, "skipping deregister of newer session");
                false
            }
            None => false,
        }
    }

    /// Push one assignment to a connected agent with a bounded timeout.
    /// On send failure or timeout the entry is dropped: the session is
    /// considered dead and the job stays pending for redelivery.
    pub async fn dispatch(
        &self,
        agent_id: AgentId,
        assignment: JobAssignment,
    ) -> Result<(), RegistryError> {
        let sender = {
            let agents = self.agents.lock().expect("registry lock poisoned");
            match agents.get(&agent_id) {
                Some(entry) => entry.sender.clone(),
                None => return Err(RegistryError::AgentNotConnected(agent_id)),
            }
        };

        match tokio::time::timeout(self.send_timeout, sender.send(assignment)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.drop_entry(agent_id);
                Err(RegistryError::SendFailed(
                    agent_id,
                    "job stream closed".to_string(),
                ))
            }
            Err(_) => {
                self.drop_entry(agent_id);
                Err(RegistryError::SendFailed(
                    agent_id,
                    format!("send timed out after {:?}", self.send_timeout),
                ))
            }
        }
    }

    pub fn is_online(&self, agent_id: AgentId) -> bool {
        self.agents
            .lock()
            .expect("registry lock poisoned")
            .contains_key(&agent_id)
    }

    pub fn online_count(&self) -> usize {
        self.agents.lock().expect("registry lock poisoned").len()
    }

    /// Teardown: drop every send handle, closing all job streams.
    pub fn shutdown(&self) {
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        let drained = agents.len();
        agents.clear();
        if drained > 0 {
            info!(drained, "registry drained");
        }
    }

    fn drop_entry(&self, agent_id: AgentId) {
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        if agents.remove(&agent_id).is_some() {
            warn!(agent_id = %agent_id, "deregistered agent after failed send");
        }
    }
}
