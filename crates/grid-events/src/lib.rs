/*!
# Grid Events

Event-driven observability for the cluster plane, using the storage engine
itself as the backend.

Instead of traditional logs/metrics/telemetry, Grid components emit structured
events that are stored as concepts and associations in the reserved events
shard, queryable the same way as any other part of the graph.

## Architecture

```text
Grid Components → EventEmitter → reserved events shard
```

## Usage

```rust
use noema_grid_events::{EventEmitter, GridEvent};
use chrono::Utc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let emitter = EventEmitter::new("127.0.0.1:50052".to_string()).await?;

    emitter.emit(GridEvent::AgentRegistered {
        agent_id: "agent-001".to_string(),
        hostname: "host1".to_string(),
        platform: "linux".to_string(),
        agent_endpoint: "host1:8001".to_string(),
        max_storage_nodes: 5,
        timestamp: Utc::now(),
    });

    Ok(())
}
```

## Event Types

- **Agent Lifecycle**: Registered, Heartbeat, Degraded, Offline, Recovered, Unregistered
- **Node Lifecycle**: SpawnRequested, SpawnSucceeded, SpawnFailed, StopRequested, StopSucceeded, StopFailed
- **Node Health**: NodeCrashed, NodeRestarted
- **Cluster Health**: ClusterHealthy, ClusterDegraded, ClusterCritical

*/

pub mod events;
pub mod emitter;

pub use events::GridEvent;
pub use emitter::EventEmitter;

/// Connect an event emitter to the reserved events shard.
pub async fn init_events(storage_endpoint: String) -> anyhow::Result<EventEmitter> {
    EventEmitter::new(storage_endpoint).await
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_library_exports() {
        // Ensure all public types are accessible
        let _event_type: Option<GridEvent> = None;
    }
}
