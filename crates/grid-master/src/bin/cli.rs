//! `grid-cli`: operator tool for inspecting and driving the cluster plane
//! (§6) — talks to `grid-master` over the same framed wire protocol as
//! agents, via `noema_protocol::Client`.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use noema_protocol::{decode, encode, Client, GridRequest, GridResponse};

#[derive(Parser)]
#[command(name = "grid-cli")]
#[command(about = "CLI for the cluster master", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    master: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all registered agents
    ListAgents,

    /// Get cluster status
    Status,

    /// Spawn a storage node on an agent
    Spawn {
        #[arg(short, long)]
        agent: String,
        #[arg(short, long)]
        port: u16,
        #[arg(short, long, default_value = "/tmp/storage")]
        storage_path: String,
        #[arg(short, long, default_value = "512")]
        memory: u64,
    },

    /// Stop a storage node
    Stop {
        #[arg(short, long)]
        node: String,
        #[arg(short, long)]
        agent: String,
    },

    /// Get status of a specific storage node
    NodeStatus {
        #[arg(short, long)]
        node: String,
    },
}

async fn call(client: &Client, request: GridRequest) -> Result<GridResponse> {
    let opcode = request.opcode() as u8;
    let payload = encode(&request)?;
    let frame = client.call(opcode, payload).await?;
    Ok(decode(&frame.payload)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::connect(&cli.master).await?;

    match cli.command {
        Commands::ListAgents => {
            match call(&client, GridRequest::ListAgents).await? {
                GridResponse::ListAgentsOk(agents) => {
                    println!("Registered agents ({}):", agents.len());
                    println!();
                    for agent in agents {
                        println!("agent: {}", agent.agent_id);
                        println!("  hostname: {}", agent.hostname);
                        println!("  platform: {}", agent.platform);
                        println!("  status: {}", agent.status);
                        println!("  storage nodes: {}/{}", agent.current_storage_nodes, agent.max_storage_nodes);
                        println!("  last heartbeat: {}s ago", agent.last_heartbeat_secs_ago);
                        println!();
                    }
                }
                other => bail!("unexpected response: {other:?}"),
            }
        }

        Commands::Status => match call(&client, GridRequest::GetClusterStatus).await? {
            GridResponse::ClusterStatusOk { total_agents, healthy_agents, total_nodes, running_nodes } => {
                println!("cluster status");
                println!("==============");
                println!("total agents:    {total_agents}");
                println!("healthy agents:  {healthy_agents}");
                println!("total nodes:     {total_nodes}");
                println!("running nodes:   {running_nodes}");
            }
            other => bail!("unexpected response: {other:?}"),
        },

        Commands::Spawn { agent, port, storage_path, memory } => {
            println!("spawning storage node on agent {agent}...");
            match call(
                &client,
                GridRequest::SpawnNode { agent_id: agent, storage_path, memory_limit_mb: memory, port },
            )
            .await?
            {
                GridResponse::SpawnNodeOk(record) if record.status == "running" => {
                    println!("spawned: node {} at {}", record.node_id, record.endpoint);
                }
                GridResponse::SpawnNodeOk(record) => {
                    println!("spawn failed: status={}", record.status);
                }
                other => bail!("unexpected response: {other:?}"),
            }
        }

        Commands::Stop { node, agent } => {
            println!("stopping storage node {node}...");
            match call(&client, GridRequest::StopNode { agent_id: agent, node_id: node }).await? {
                GridResponse::StopNodeOk => println!("stopped"),
                other => bail!("unexpected response: {other:?}"),
            }
        }

        Commands::NodeStatus { node } => match call(&client, GridRequest::GetNodeStatus { node_id: node }).await? {
            GridResponse::NodeStatusOk(record) => {
                println!("node: {}", record.node_id);
                println!("  status:   {}", record.status);
                println!("  pid:      {:?}", record.pid);
                println!("  endpoint: {}", record.endpoint);
            }
            other => bail!("unexpected response: {other:?}"),
        },
    }

    Ok(())
}
