//! Cluster agent: registers with `grid-master`, spawns/stops storage-node
//! processes through a `Platform` adapter (§4.5, §6), and heartbeats on an
//! interval. Talks to the master and exposes its own command surface over
//! the same framed wire protocol storage nodes use.

mod platforms;

use chrono::Utc;
use noema_grid_events::{init_events, EventEmitter, GridEvent};
use noema_protocol::{decode, encode, read_frame, write_frame, Client, Frame, GridRequest, GridResponse, NodeRecord};
use platforms::{create_platform, Platform, PlatformConfig, SpawnConfig};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const MAX_RESTARTS: u32 = 3;
const MAX_RESTART_BACKOFF_SECS: u64 = 60;
const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
struct Config {
    agent: AgentConfig,
    storage: StorageConfig,
    monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct AgentConfig {
    agent_id: String,
    master_host: String,
    platform: String,
    max_storage_nodes: u32,
    agent_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageConfig {
    binary_path: String,
    data_path: String,
    default_memory_mb: u64,
    default_port_range_start: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct MonitoringConfig {
    heartbeat_interval_secs: u64,
    health_check_interval_secs: u64,
    restart_failed_nodes: bool,
}

impl Config {
    fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

struct Agent {
    config: Config,
    platform: Arc<dyn Platform>,
    restart_counts: RwLock<std::collections::HashMap<String, u32>>,
    events: Option<EventEmitter>,
}

impl Agent {
    fn new(config: Config, events: Option<EventEmitter>) -> anyhow::Result<Self> {
        let platform_config = PlatformConfig {
            binary_path: config.storage.binary_path.clone(),
            data_path: config.storage.data_path.clone(),
            docker_image: None,
            k8s_namespace: None,
            k8s_kubeconfig: None,
        };
        let platform: Arc<dyn Platform> = Arc::from(create_platform(&config.agent.platform, platform_config)?);
        Ok(Agent {
            config,
            platform,
            restart_counts: RwLock::new(std::collections::HashMap::new()),
            events,
        })
    }

    fn emit(&self, event: GridEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    async fn spawn_node(&self, node_id: String, storage_path: String, memory_limit_mb: u64, port: u16) -> anyhow::Result<NodeRecord> {
        let node_count = self.platform.list_nodes().await?.len();
        if node_count >= self.config.agent.max_storage_nodes as usize {
            anyhow::bail!("agent at max storage node capacity ({})", self.config.agent.max_storage_nodes);
        }

        let config = SpawnConfig {
            node_id: node_id.clone(),
            port: port as u32,
            storage_path: if storage_path.is_empty() {
                format!("{}/{}", self.config.storage.data_path, node_id)
            } else {
                storage_path
            },
            memory_limit_mb,
            binary_path: self.config.storage.binary_path.clone(),
        };
        let node = self.platform.spawn_node(config).await?;
        Ok(NodeRecord {
            node_id: node.node_id,
            agent_id: self.config.agent.agent_id.clone(),
            endpoint: format!("{}:{}", hostname_string(), node.port),
            status: "running".to_string(),
            pid: Some(node.pid),
        })
    }

    async fn dispatch(&self, request: GridRequest) -> anyhow::Result<GridResponse> {
        match request {
            GridRequest::SpawnNode { storage_path, memory_limit_mb, port, .. } => {
                let node_id = uuid_v4_ish();
                match self.spawn_node(node_id, storage_path, memory_limit_mb, port).await {
                    Ok(record) => Ok(GridResponse::SpawnNodeOk(record)),
                    Err(e) => {
                        error!(error = %e, "spawn failed");
                        Err(e)
                    }
                }
            }
            GridRequest::StopNode { node_id, .. } => {
                self.platform.stop_node(&node_id).await?;
                Ok(GridResponse::StopNodeOk)
            }
            GridRequest::GetNodeStatus { node_id } => {
                let node = self.platform.get_node_status(&node_id).await?;
                Ok(GridResponse::NodeStatusOk(NodeRecord {
                    node_id: node.node_id,
                    agent_id: self.config.agent.agent_id.clone(),
                    endpoint: format!("{}:{}", hostname_string(), node.port),
                    status: "running".to_string(),
                    pid: Some(node.pid),
                }))
            }
            GridRequest::ListNodes { .. } => {
                let nodes = self.platform.list_nodes().await?;
                let records = nodes
                    .into_iter()
                    .map(|n| NodeRecord {
                        node_id: n.node_id,
                        agent_id: self.config.agent.agent_id.clone(),
                        endpoint: format!("{}:{}", hostname_string(), n.port),
                        status: "running".to_string(),
                        pid: Some(n.pid),
                    })
                    .collect();
                Ok(GridResponse::ListNodesOk(records))
            }
            other => anyhow::bail!("agent does not handle request: {other:?}"),
        }
    }
}

fn hostname_string() -> String {
    hostname::get().map(|h| h.to_string_lossy().to_string()).unwrap_or_else(|_| "localhost".to_string())
}

fn uuid_v4_ish() -> String {
    uuid_like(now_micros())
}

fn uuid_like(seed: u128) -> String {
    format!("node-{seed:032x}")
}

fn now_micros() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
}

async fn serve_commands(agent: Arc<Agent>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let agent = agent.clone();
        tokio::spawn(async move {
            info!(%peer, "master connection accepted");
            handle_connection(agent, stream).await;
        });
    }
}

async fn handle_connection(agent: Arc<Agent>, mut stream: TcpStream) {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        let request: GridRequest = match decode(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "malformed request from master");
                return;
            }
        };
        let response_frame = match agent.dispatch(request).await {
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
    let payload = encode(&noema_protocol::ErrorPayload { code: 5000, message: message.to_string(), details: None })
        .unwrap_or_default();
    Frame::error_response(opcode, request_id, payload)
}

async fn register(agent: &Agent, master: &Client) -> anyhow::Result<()> {
    let hostname = hostname_string();
    let agent_endpoint = format!("{hostname}:{}", agent.config.agent.agent_port);
    let request = GridRequest::RegisterAgent {
        agent_id: agent.config.agent.agent_id.clone(),
        hostname: hostname.clone(),
        platform: agent.config.agent.platform.clone(),
        max_storage_nodes: agent.config.agent.max_storage_nodes,
        agent_endpoint,
    };
    let payload = encode(&request)?;
    let frame = master.call(request.opcode() as u8, payload).await?;
    match decode(&frame.payload)? {
        GridResponse::RegisterAgentOk { accepted: true, master_version } => {
            info!(master_version, agent_id = agent.config.agent.agent_id, %hostname, "registered with master");
            Ok(())
        }
        GridResponse::RegisterAgentOk { accepted: false, .. } => anyhow::bail!("master rejected registration"),
        other => anyhow::bail!("unexpected response to RegisterAgent: {other:?}"),
    }
}

async fn heartbeat_loop(agent: Arc<Agent>, master_host: String) {
    let interval_secs = agent.config.monitoring.heartbeat_interval_secs;
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    let mut client = match Client::connect(&master_host).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "initial master connection failed, heartbeat loop exiting");
            return;
        }
    };

    let mut count = 0u64;
    loop {
        ticker.tick().await;
        let node_count = agent.platform.list_nodes().await.map(|n| n.len()).unwrap_or(0) as u32;
        let request = GridRequest::Heartbeat {
            agent_id: agent.config.agent.agent_id.clone(),
            storage_node_count: node_count,
        };
        let payload = match encode(&request) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to encode heartbeat");
                continue;
            }
        };
        match client.call(request.opcode() as u8, payload).await {
            Ok(_) => {
                count += 1;
                if count % 12 == 0 {
                    info!(count, "heartbeat acknowledged");
                }
            }
            Err(e) => {
                warn!(error = %e, "heartbeat failed, reconnecting");
                tokio::time::sleep(Duration::from_secs(5)).await;
                match Client::connect(&master_host).await {
                    Ok(new_client) => {
                        client = new_client;
                        if let Err(e) = register(&agent, &client).await {
                            error!(error = %e, "re-registration failed");
                        }
                    }
                    Err(e) => error!(error = %e, "reconnect to master failed"),
                }
            }
        }
    }
}

/// Watch running nodes; on crash, emit `NodeCrashed` and restart with
/// exponential backoff (capped at 60s) up to `MAX_RESTARTS` attempts.
async fn monitor_loop(agent: Arc<Agent>) {
    if !agent.config.monitoring.restart_failed_nodes {
        return;
    }
    let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
    loop {
        ticker.tick().await;
        let nodes = match agent.platform.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "failed to list nodes for health check");
                continue;
            }
        };
        for node in nodes {
            let alive = agent.platform.is_node_alive(&node.node_id).await.unwrap_or(false);
            if alive {
                continue;
            }
            warn!(node_id = %node.node_id, pid = node.pid, "storage node crashed");
            agent.emit(GridEvent::NodeCrashed {
                node_id: node.node_id.clone(),
                agent_id: agent.config.agent.agent_id.clone(),
                exit_code: None,
                timestamp: Utc::now(),
            });

            let restart_count = {
                let mut counts = agent.restart_counts.write().await;
                let entry = counts.entry(node.node_id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if restart_count > MAX_RESTARTS {
                error!(node_id = %node.node_id, restart_count, "giving up on node after max restarts");
                continue;
            }

            let backoff = Duration::from_secs((2u64.pow(restart_count.min(5))).min(MAX_RESTART_BACKOFF_SECS));
            tokio::time::sleep(backoff).await;

            match agent.spawn_node(node.node_id.clone(), node.storage_path.clone(), agent.config.storage.default_memory_mb, node.port as u16).await {
                Ok(record) => {
                    info!(node_id = %node.node_id, new_pid = ?record.pid, restart_count, "node restarted");
                    agent.emit(GridEvent::NodeRestarted {
                        node_id: node.node_id,
                        agent_id: agent.config.agent.agent_id.clone(),
                        restart_count,
                        new_pid: record.pid.unwrap_or(0),
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => error!(node_id = %node.node_id, error = %e, "restart failed"),
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "agent-config.toml".to_string());
    info!(config_path, "loading agent config");
    let config = Config::load(&config_path)?;
    info!(agent_id = config.agent.agent_id, platform = config.agent.platform, max_nodes = config.agent.max_storage_nodes, "agent config loaded");

    let event_storage = std::env::var("EVENT_STORAGE").unwrap_or_else(|_| "127.0.0.1:50052".to_string());
    let events = match init_events(event_storage.clone()).await {
        Ok(events) => {
            info!(event_storage, "event emission enabled");
            Some(events)
        }
        Err(e) => {
            warn!(error = %e, "event storage unreachable, continuing without events");
            None
        }
    };

    let agent = Arc::new(Agent::new(config, events)?);

    let master = Client::connect(&agent.config.agent.master_host).await?;
    register(&agent, &master).await?;

    let command_addr = format!("0.0.0.0:{}", agent.config.agent.agent_port);
    let listener = TcpListener::bind(&command_addr).await?;
    info!(addr = command_addr, "agent command server listening");

    let server_agent = agent.clone();
    tokio::spawn(serve_commands(server_agent, listener));

    let monitor_agent = agent.clone();
    tokio::spawn(monitor_loop(monitor_agent));

    let master_host = agent.config.agent.master_host.clone();
    heartbeat_loop(agent, master_host).await;

    Ok(())
}
