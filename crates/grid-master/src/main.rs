//! Cluster master: agent registry, health monitoring, and storage-node
//! lifecycle (§4.5, §6). Agents and `grid-cli` talk to this over the same
//! framed wire protocol storage nodes use, with `GridRequest`/`GridResponse`
//! standing in for the learn/query vocabulary.

mod txn;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use noema_grid_events::{EventEmitter, GridEvent};
use noema_protocol::{
    decode, encode, read_frame, write_frame, AgentRecord, Client, Frame, GridRequest, GridResponse, NodeRecord,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

const HEARTBEAT_DEGRADED_SECS: u64 = 15;
const HEARTBEAT_OFFLINE_SECS: u64 = 30;
const HEALTH_MONITOR_INTERVAL: Duration = Duration::from_secs(10);
const AGENT_CALL_RETRIES: u32 = 3;
const AGENT_CALL_BASE_BACKOFF: Duration = Duration::from_millis(100);
const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentStatus {
    Healthy,
    Degraded,
    Offline,
}

impl AgentStatus {
    fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Healthy => "healthy",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageNodeStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl StorageNodeStatus {
    fn as_str(self) -> &'static str {
        match self {
            StorageNodeStatus::Starting => "starting",
            StorageNodeStatus::Running => "running",
            StorageNodeStatus::Stopping => "stopping",
            StorageNodeStatus::Stopped => "stopped",
            StorageNodeStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
struct StorageNodeEntry {
    node_id: String,
    endpoint: String,
    pid: Option<u32>,
    status: StorageNodeStatus,
}

#[derive(Debug, Clone)]
struct AgentEntry {
    hostname: String,
    platform: String,
    agent_endpoint: String,
    max_storage_nodes: u32,
    last_heartbeat: u64,
    status: AgentStatus,
    storage_nodes: HashMap<String, StorageNodeEntry>,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Agent registry, node lifecycle, and health tracking (§4.5), dispatched
/// over the shared frame protocol.
struct GridMaster {
    agents: RwLock<HashMap<String, AgentEntry>>,
    agent_clients: Mutex<HashMap<String, Client>>,
    events: Option<EventEmitter>,
}

impl GridMaster {
    fn new(events: Option<EventEmitter>) -> Self {
        GridMaster {
            agents: RwLock::new(HashMap::new()),
            agent_clients: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn emit(&self, event: GridEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    async fn register_agent(
        &self,
        agent_id: String,
        hostname: String,
        platform: String,
        max_storage_nodes: u32,
        agent_endpoint: String,
    ) -> GridResponse {
        let mut agents = self.agents.write().await;
        agents.insert(
            agent_id.clone(),
            AgentEntry {
                hostname: hostname.clone(),
                platform: platform.clone(),
                agent_endpoint: agent_endpoint.clone(),
                max_storage_nodes,
                last_heartbeat: now_secs(),
                status: AgentStatus::Healthy,
                storage_nodes: HashMap::new(),
            },
        );
        drop(agents);
        self.agent_clients.lock().await.remove(&agent_id);
        info!(agent_id, hostname, platform, "agent registered");
        self.emit(GridEvent::AgentRegistered {
            agent_id,
            hostname,
            platform,
            agent_endpoint,
            max_storage_nodes,
            timestamp: Utc::now(),
        });
        GridResponse::RegisterAgentOk {
            accepted: true,
            master_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn unregister_agent(&self, agent_id: String) -> GridResponse {
        self.agents.write().await.remove(&agent_id);
        self.agent_clients.lock().await.remove(&agent_id);
        info!(agent_id, "agent unregistered");
        self.emit(GridEvent::AgentUnregistered {
            agent_id,
            timestamp: Utc::now(),
        });
        GridResponse::UnregisterAgentOk
    }

    async fn heartbeat(&self, agent_id: String, storage_node_count: u32) -> Result<GridResponse> {
        let recovered = {
            let mut agents = self.agents.write().await;
            let agent = agents.get_mut(&agent_id).context("unknown agent")?;
            let downtime = now_secs().saturating_sub(agent.last_heartbeat);
            let was_unhealthy = agent.status != AgentStatus::Healthy;
            agent.last_heartbeat = now_secs();
            agent.status = AgentStatus::Healthy;
            was_unhealthy.then_some(downtime)
        };
        self.emit(GridEvent::AgentHeartbeat {
            agent_id: agent_id.clone(),
            storage_node_count,
            timestamp: Utc::now(),
        });
        if let Some(downtime) = recovered {
            self.emit(GridEvent::AgentRecovered {
                agent_id,
                downtime_seconds: downtime,
                timestamp: Utc::now(),
            });
        }
        Ok(GridResponse::HeartbeatOk)
    }

    /// Connect to (or reuse a cached connection to) an agent, retrying with
    /// exponential backoff (100ms, 200ms, 400ms).
    async fn agent_client(&self, agent_id: &str) -> Result<Client> {
        {
            let clients = self.agent_clients.lock().await;
            if let Some(client) = clients.get(agent_id) {
                return Ok(client.clone());
            }
        }
        let endpoint = {
            let agents = self.agents.read().await;
            agents
                .get(agent_id)
                .map(|a| a.agent_endpoint.clone())
                .with_context(|| format!("unknown agent {agent_id}"))?
        };

        let mut backoff = AGENT_CALL_BASE_BACKOFF;
        let mut last_err = None;
        for attempt in 0..AGENT_CALL_RETRIES {
            match Client::connect(&endpoint).await {
                Ok(client) => {
                    self.agent_clients.lock().await.insert(agent_id.to_string(), client.clone());
                    return Ok(client);
                }
                Err(e) => {
                    warn!(agent_id, attempt, error = %e, "agent connect failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        bail!("could not reach agent {agent_id}: {:?}", last_err)
    }

    async fn spawn_storage_node(
        &self,
        agent_id: String,
        storage_path: String,
        memory_limit_mb: u64,
        port: u16,
    ) -> GridResponse {
        let node_id = uuid::Uuid::new_v4().to_string();
        self.emit(GridEvent::SpawnRequested {
            node_id: node_id.clone(),
            agent_id: agent_id.clone(),
            port: port as u32,
            storage_path: storage_path.clone(),
            memory_limit_mb,
            timestamp: Utc::now(),
        });

        let result: Result<NodeRecord> = async {
            let client = self.agent_client(&agent_id).await?;
            let request = GridRequest::SpawnNode {
                agent_id: agent_id.clone(),
                storage_path,
                memory_limit_mb,
                port,
            };
            let response = call_agent(&client, &request, SPAWN_TIMEOUT).await?;
            match response {
                GridResponse::SpawnNodeOk(record) => Ok(record),
                other => bail!("unexpected agent response to SpawnNode: {other:?}"),
            }
        }
        .await;

        match result {
            Ok(record) => {
                let mut agents = self.agents.write().await;
                if let Some(agent) = agents.get_mut(&agent_id) {
                    agent.storage_nodes.insert(
                        record.node_id.clone(),
                        StorageNodeEntry {
                            node_id: record.node_id.clone(),
                            endpoint: record.endpoint.clone(),
                            pid: record.pid,
                            status: StorageNodeStatus::Running,
                        },
                    );
                }
                drop(agents);
                self.emit(GridEvent::SpawnSucceeded {
                    node_id: record.node_id.clone(),
                    agent_id,
                    pid: record.pid.unwrap_or(0),
                    port: port as u32,
                    timestamp: Utc::now(),
                });
                GridResponse::SpawnNodeOk(record)
            }
            Err(e) => {
                error!(agent_id, error = %e, "spawn failed");
                self.emit(GridEvent::SpawnFailed {
                    node_id,
                    agent_id,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                GridResponse::SpawnNodeOk(NodeRecord {
                    node_id: String::new(),
                    agent_id: String::new(),
                    endpoint: String::new(),
                    status: StorageNodeStatus::Failed.as_str().to_string(),
                    pid: None,
                })
            }
        }
    }

    async fn stop_storage_node(&self, agent_id: String, node_id: String) -> GridResponse {
        self.emit(GridEvent::StopRequested {
            node_id: node_id.clone(),
            agent_id: agent_id.clone(),
            timestamp: Utc::now(),
        });

        let result: Result<()> = async {
            let client = self.agent_client(&agent_id).await?;
            let request = GridRequest::StopNode {
                agent_id: agent_id.clone(),
                node_id: node_id.clone(),
            };
            match call_agent(&client, &request, STOP_TIMEOUT).await? {
                GridResponse::StopNodeOk => Ok(()),
                other => bail!("unexpected agent response to StopNode: {other:?}"),
            }
        }
        .await;

        match result {
            Ok(()) => {
                let mut agents = self.agents.write().await;
                if let Some(agent) = agents.get_mut(&agent_id) {
                    agent.storage_nodes.remove(&node_id);
                }
                drop(agents);
                self.emit(GridEvent::StopSucceeded {
                    node_id,
                    agent_id,
                    timestamp: Utc::now(),
                });
                GridResponse::StopNodeOk
            }
            Err(e) => {
                error!(agent_id, node_id, error = %e, "stop failed");
                self.emit(GridEvent::StopFailed {
                    node_id,
                    agent_id,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                GridResponse::StopNodeOk
            }
        }
    }

    async fn get_storage_node_status(&self, node_id: String) -> Result<GridResponse> {
        let (agent_id, cached) = {
            let agents = self.agents.read().await;
            agents
                .iter()
                .find_map(|(agent_id, agent)| {
                    agent.storage_nodes.get(&node_id).map(|node| {
                        (
                            agent_id.clone(),
                            NodeRecord {
                                node_id: node.node_id.clone(),
                                agent_id: agent_id.clone(),
                                endpoint: node.endpoint.clone(),
                                status: node.status.as_str().to_string(),
                                pid: node.pid,
                            },
                        )
                    })
                })
                .context("node not found")?
        };

        let live: Result<NodeRecord> = async {
            let client = self.agent_client(&agent_id).await?;
            let request = GridRequest::GetNodeStatus { node_id: node_id.clone() };
            match call_agent(&client, &request, STATUS_TIMEOUT).await? {
                GridResponse::NodeStatusOk(record) => Ok(record),
                other => bail!("unexpected agent response to GetNodeStatus: {other:?}"),
            }
        }
        .await;

        Ok(GridResponse::NodeStatusOk(live.unwrap_or(cached)))
    }

    async fn list_agents(&self) -> GridResponse {
        let agents = self.agents.read().await;
        let now = now_secs();
        let records = agents
            .iter()
            .map(|(agent_id, agent)| AgentRecord {
                agent_id: agent_id.clone(),
                hostname: agent.hostname.clone(),
                platform: agent.platform.clone(),
                status: agent.status.as_str().to_string(),
                max_storage_nodes: agent.max_storage_nodes,
                current_storage_nodes: agent.storage_nodes.len() as u32,
                last_heartbeat_secs_ago: now.saturating_sub(agent.last_heartbeat),
            })
            .collect();
        GridResponse::ListAgentsOk(records)
    }

    async fn cluster_status(&self) -> GridResponse {
        let (total_agents, healthy_agents, total_nodes, running_nodes) = self.cluster_counts().await;
        GridResponse::ClusterStatusOk {
            total_agents,
            healthy_agents,
            total_nodes,
            running_nodes,
        }
    }

    async fn cluster_counts(&self) -> (u32, u32, u32, u32) {
        let agents = self.agents.read().await;
        let total_agents = agents.len() as u32;
        let healthy_agents = agents.values().filter(|a| a.status == AgentStatus::Healthy).count() as u32;
        let total_nodes = agents.values().map(|a| a.storage_nodes.len() as u32).sum();
        let running_nodes = agents
            .values()
            .flat_map(|a| a.storage_nodes.values())
            .filter(|n| n.status == StorageNodeStatus::Running)
            .count() as u32;
        (total_agents, healthy_agents, total_nodes, running_nodes)
    }

    /// Flag agents as degraded past 15s without a heartbeat, offline past
    /// 30s, and emit a cluster-wide health rollup.
    async fn check_agent_health(&self) {
        let now = now_secs();
        let mut transitions = Vec::new();
        {
            let mut agents = self.agents.write().await;
            for (agent_id, agent) in agents.iter_mut() {
                let since = now.saturating_sub(agent.last_heartbeat);
                let next = if since >= HEARTBEAT_OFFLINE_SECS {
                    AgentStatus::Offline
                } else if since >= HEARTBEAT_DEGRADED_SECS {
                    AgentStatus::Degraded
                } else {
                    AgentStatus::Healthy
                };
                if next != agent.status {
                    transitions.push((agent_id.clone(), next, since));
                    agent.status = next;
                }
            }
        }
        for (agent_id, status, since) in transitions {
            match status {
                AgentStatus::Degraded => {
                    warn!(agent_id, since, "agent degraded");
                    self.emit(GridEvent::AgentDegraded {
                        agent_id,
                        seconds_since_heartbeat: since,
                        timestamp: Utc::now(),
                    });
                }
                AgentStatus::Offline => {
                    warn!(agent_id, "agent offline");
                    self.emit(GridEvent::AgentOffline {
                        agent_id,
                        last_seen: Utc::now() - chrono::Duration::seconds(since as i64),
                        timestamp: Utc::now(),
                    });
                }
                AgentStatus::Healthy => {}
            }
        }

        let (total_agents, healthy_agents, _, _) = self.cluster_counts().await;
        if total_agents == 0 {
            return;
        }
        let healthy_ratio = healthy_agents as f64 / total_agents as f64;
        if healthy_ratio >= 0.99 {
            let (total_agents, healthy_agents, total_nodes, running_nodes) = self.cluster_counts().await;
            self.emit(GridEvent::ClusterHealthy {
                total_agents,
                healthy_agents,
                total_nodes,
                running_nodes,
                timestamp: Utc::now(),
            });
        } else if healthy_ratio < 0.5 {
            self.emit(GridEvent::ClusterCritical {
                total_agents,
                healthy_agents,
                reason: format!("{healthy_agents}/{total_agents} agents healthy"),
                timestamp: Utc::now(),
            });
        } else {
            self.emit(GridEvent::ClusterDegraded {
                total_agents,
                healthy_agents,
                reason: format!("{healthy_agents}/{total_agents} agents healthy"),
                timestamp: Utc::now(),
            });
        }
    }

    async fn dispatch(&self, request: GridRequest) -> Result<GridResponse> {
        match request {
            GridRequest::RegisterAgent {
                agent_id,
                hostname,
                platform,
                max_storage_nodes,
                agent_endpoint,
            } => Ok(self.register_agent(agent_id, hostname, platform, max_storage_nodes, agent_endpoint).await),
            GridRequest::Heartbeat { agent_id, storage_node_count } => self.heartbeat(agent_id, storage_node_count).await,
            GridRequest::SpawnNode { agent_id, storage_path, memory_limit_mb, port } => {
                Ok(self.spawn_storage_node(agent_id, storage_path, memory_limit_mb, port).await)
            }
            GridRequest::StopNode { agent_id, node_id } => Ok(self.stop_storage_node(agent_id, node_id).await),
            GridRequest::GetNodeStatus { node_id } => self.get_storage_node_status(node_id).await,
            GridRequest::ListNodes { agent_id } => {
                let agents = self.agents.read().await;
                let records = agents
                    .get(&agent_id)
                    .context("unknown agent")?
                    .storage_nodes
                    .values()
                    .map(|n| NodeRecord {
                        node_id: n.node_id.clone(),
                        agent_id: agent_id.clone(),
                        endpoint: n.endpoint.clone(),
                        status: n.status.as_str().to_string(),
                        pid: n.pid,
                    })
                    .collect();
                Ok(GridResponse::ListNodesOk(records))
            }
            GridRequest::ListAgents => Ok(self.list_agents().await),
            GridRequest::GetClusterStatus => Ok(self.cluster_status().await),
            GridRequest::UnregisterAgent { agent_id } => Ok(self.unregister_agent(agent_id).await),
        }
    }
}

async fn call_agent(client: &Client, request: &GridRequest, timeout: Duration) -> Result<GridResponse> {
    let opcode = request.opcode() as u8;
    let payload = encode(request)?;
    let frame = tokio::time::timeout(timeout, client.call(opcode, payload)).await??;
    Ok(decode(&frame.payload)?)
}

async fn handle_connection(master: Arc<GridMaster>, mut stream: TcpStream) {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        let request: GridRequest = match decode(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "malformed grid request, dropping connection");
                return;
            }
        };
        let response_frame = match master.dispatch(request).await {
            Ok(response) => match encode(&response) {
                Ok(payload) => Frame::response(frame.opcode, frame.request_id, payload),
                Err(e) => error_frame(frame.opcode, frame.request_id, &e.to_string()),
            },
            Err(e) => error_frame(frame.opcode, frame.request_id, &e.to_string()),
        };
        if write_frame(&mut stream, &response_frame).await.is_err() {
            return;
        }
    }
}

fn error_frame(opcode: u8, request_id: u16, message: &str) -> Frame {
    let payload = encode(&noema_protocol::ErrorPayload {
        code: 5000,
        message: message.to_string(),
        details: None,
    })
    .unwrap_or_default();
    Frame::error_response(opcode, request_id, payload)
}

async fn health_monitor_loop(master: Arc<GridMaster>) {
    let mut ticker = tokio::time::interval(HEALTH_MONITOR_INTERVAL);
    loop {
        ticker.tick().await;
        master.check_agent_health().await;
    }
}

fn listen_addr() -> String {
    std::env::var("MASTER_LISTEN").unwrap_or_else(|_| "0.0.0.0:7000".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).init();

    let event_endpoint = std::env::var("EVENT_STORAGE").unwrap_or_else(|_| "127.0.0.1:50052".to_string());
    let events = match EventEmitter::new(event_endpoint.clone()).await {
        Ok(emitter) => {
            info!(event_endpoint, "grid master event emitter connected");
            Some(emitter)
        }
        Err(e) => {
            warn!(error = %e, "event storage unreachable, running without event emission");
            None
        }
    };

    let master = Arc::new(GridMaster::new(events));

    let addr = listen_addr();
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    info!(addr, "grid master listening");

    let monitor_master = master.clone();
    tokio::spawn(health_monitor_loop(monitor_master));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let master = master.clone();
                tokio::spawn(async move {
                    info!(%peer, "grid connection accepted");
                    handle_connection(master, stream).await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                return Ok(());
            }
        }
    }
}
