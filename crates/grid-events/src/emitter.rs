use crate::events::GridEvent;
use noema_protocol::{encode, Client, ConceptPayload, Opcode, StorageRequest};
use tokio::sync::mpsc;

/// Associations the emitter draws between an event and its context (§4.5):
/// entity produced event (`Causal`), event falls in a time bucket
/// (`Temporal`) — both from the existing 5-tag `AssociationType` model,
/// there's no separate event-association taxonomy on the wire.
const ASSOC_CAUSAL: u8 = 1;
const ASSOC_TEMPORAL: u8 = 2;

/// Event emitter that writes Grid events into the reserved events shard as
/// concepts, linked to their entity and time bucket (§4.5).
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<GridEvent>,
}

impl EventEmitter {
    /// Connect to the reserved events shard and start the background writer.
    pub async fn new(storage_endpoint: String) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client::connect(&storage_endpoint).await?;
        tracing::info!(storage_endpoint, "grid event emitter connected");

        tokio::spawn(async move {
            event_worker(client, rx).await;
        });

        Ok(EventEmitter { tx })
    }

    /// Emit an event without waiting for it to be written.
    pub fn emit(&self, event: GridEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::error!(error = %e, "failed to queue grid event");
        }
    }

    pub fn emit_batch(&self, events: Vec<GridEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

async fn event_worker(client: Client, mut rx: mpsc::UnboundedReceiver<GridEvent>) {
    tracing::debug!("grid event worker started");
    while let Some(event) = rx.recv().await {
        if let Err(e) = write_event(&client, &event).await {
            tracing::warn!(error = %e, event_type = event.event_type(), "failed to write grid event");
        }
    }
    tracing::debug!("grid event worker stopped");
}

async fn write_event(client: &Client, event: &GridEvent) -> anyhow::Result<()> {
    let event_json = serde_json::to_string(event)?;

    let learn_payload = encode(&StorageRequest::LearnConcept(ConceptPayload {
        content: event_json,
        embedding: Vec::new(),
        tenant: None,
        metadata: [("event_type".to_string(), event.event_type().to_string())].into_iter().collect(),
    }))?;
    let response = client.call(Opcode::LearnConcept as u8, learn_payload).await?;
    let concept: noema_protocol::StorageResponse = noema_protocol::decode(&response.payload)?;
    let event_concept = match concept {
        noema_protocol::StorageResponse::ConceptOk(view) => view.id,
        other => anyhow::bail!("unexpected response learning event concept: {other:?}"),
    };

    let primary_concept = learn_entity_concept(client, &event.primary_id()).await?;
    link(client, primary_concept, event_concept, ASSOC_CAUSAL).await?;

    let time_bucket = format!("ts-{}", event.timestamp().timestamp() / 3600);
    let time_concept = learn_entity_concept(client, &time_bucket).await?;
    link(client, event_concept, time_concept, ASSOC_TEMPORAL).await?;

    tracing::debug!(entity = %event.primary_id(), event_type = event.event_type(), "wrote grid event");
    Ok(())
}

/// Learn (or touch) a bare-identity concept for an entity/time-bucket id —
/// these carry no embedding, only content, since they exist purely to anchor
/// associations.
async fn learn_entity_concept(client: &Client, content: &str) -> anyhow::Result<[u8; 16]> {
    let payload = encode(&StorageRequest::LearnConcept(ConceptPayload {
        content: content.to_string(),
        embedding: Vec::new(),
        tenant: None,
        metadata: Default::default(),
    }))?;
    let response = client.call(Opcode::LearnConcept as u8, payload).await?;
    let decoded: noema_protocol::StorageResponse = noema_protocol::decode(&response.payload)?;
    match decoded {
        noema_protocol::StorageResponse::ConceptOk(view) => Ok(view.id),
        other => anyhow::bail!("unexpected response learning entity concept: {other:?}"),
    }
}

async fn link(client: &Client, source: [u8; 16], target: [u8; 16], assoc_type: u8) -> anyhow::Result<()> {
    let payload = encode(&StorageRequest::LearnAssociation {
        source,
        target,
        assoc_type,
        confidence: 1.0,
        tenant: None,
    })?;
    client.call(Opcode::LearnAssociation as u8, payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_unreachable_endpoint_fails() {
        let result = EventEmitter::new("127.0.0.1:1".to_string()).await;
        assert!(result.is_err());
    }
}
