//! C4: the wire-protocol server for one shard (§4.4).
//!
//! Each connection gets a reader loop and a writer task joined by a bounded
//! channel — the bound is the connection's only flow control, so a slow
//! client naturally stalls its own dispatch tasks rather than the server.
//! Requests are dispatched onto their own task as soon as they're framed, so
//! responses may legitimately arrive out of order; the client matches by
//! request id.
use crate::config::NodeConfig;
use crate::error::StoreError;
use crate::event_emitter::StorageEventEmitter;
use crate::store::{Store, MAX_BATCH};
use crate::tls::TlsConfigBuilder;
use crate::transaction::{PendingOp, TransactionParticipant};
use crate::types::{AssociationType, Concept, ConceptId, GraphPath, TenantId};
use noema_protocol::{
    decode, encode, read_frame, write_frame, AssociationView, ConceptView, ErrorPayload, Frame, NeighborView,
    Opcode, PathView, StorageRequest, StorageResponse, FLAG_ERROR,
};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Implicit per-request deadline (§4.4, default 30s).
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);
/// Per-connection outbound response queue depth — the backpressure knob.
const RESPONSE_QUEUE_DEPTH: usize = 256;
/// How often `TransactionParticipant` sweeps unresolved prepares.
const TXN_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct ShardServer {
    store: Arc<Store>,
    participant: Arc<TransactionParticipant>,
    events: Arc<StorageEventEmitter>,
    config: NodeConfig,
    auth_token: Option<String>,
    started: Instant,
}

impl ShardServer {
    pub fn new(store: Arc<Store>, events: Arc<StorageEventEmitter>, config: NodeConfig) -> Self {
        let auth_token = std::env::var("AUTH_TOKEN").ok().filter(|s| !s.is_empty());
        Self {
            store,
            participant: Arc::new(TransactionParticipant::new()),
            events,
            config,
            auth_token,
            started: Instant::now(),
        }
    }

    pub fn participant(&self) -> Arc<TransactionParticipant> {
        self.participant.clone()
    }

    /// Bind and serve until the process is signalled to stop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let tls_acceptor = if self.config.tls_enabled {
            Some(TlsConfigBuilder::from_env()?.build()?)
        } else {
            None
        };

        let sweeper = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(TXN_SWEEP_INTERVAL).await;
                let expired = sweeper.participant.sweep_expired();
                if !expired.is_empty() {
                    tracing::warn!(count = expired.len(), "prepared transactions expired unresolved");
                }
            }
        });

        loop {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            let server = self.clone();
            let tls_acceptor = tls_acceptor.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, tls_acceptor).await {
                    tracing::debug!(%peer, error = %e, "connection closed");
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> anyhow::Result<()> {
        let conn = match tls_acceptor {
            Some(acceptor) => Conn::Tls(Box::new(acceptor.accept(stream).await?)),
            None => Conn::Plain(stream),
        };
        let (mut reader, writer) = tokio::io::split(conn);

        let (tx, mut rx) = mpsc::channel::<Frame>(RESPONSE_QUEUE_DEPTH);
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = rx.recv().await {
                if write_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
            }
        });

        let authenticated = Arc::new(AtomicBool::new(self.auth_token.is_none()));
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);

        loop {
            let frame = match timeout(idle_timeout, read_frame(&mut reader)).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::debug!("connection idle, closing");
                    break;
                }
            };

            let server = self.clone();
            let authenticated = authenticated.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let response = server.dispatch_frame(frame.clone(), &authenticated).await;
                let _ = tx.send(response).await;
            });
        }

        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }

    async fn dispatch_frame(&self, frame: Frame, authenticated: &AtomicBool) -> Frame {
        let request_id = frame.request_id;
        let opcode = frame.opcode;

        if let Some(token) = &self.auth_token {
            if !authenticated.load(Ordering::Acquire) {
                if opcode == Opcode::Auth as u8 {
                    match decode::<StorageRequest>(&frame.payload) {
                        Ok(StorageRequest::Auth { token: given }) if &given == token => {
                            authenticated.store(true, Ordering::Release);
                            return ok_frame(opcode, request_id, &StorageResponse::AuthOk);
                        }
                        _ => return error_frame(opcode, request_id, 4010, "invalid auth token"),
                    }
                } else {
                    return error_frame(opcode, request_id, 4011, "authentication required");
                }
            }
        }

        let request: StorageRequest = match decode(&frame.payload) {
            Ok(r) => r,
            Err(e) => return error_frame(opcode, request_id, 4000, &format!("malformed payload: {e}")),
        };

        match timeout(REQUEST_DEADLINE, self.dispatch(request)).await {
            Ok(Ok(response)) => ok_frame(opcode, request_id, &response),
            Ok(Err(err)) => error_frame(opcode, request_id, err.code(), &err.to_string()),
            Err(_) => error_frame(opcode, request_id, 4002, "request deadline exceeded"),
        }
    }

    async fn dispatch(&self, request: StorageRequest) -> Result<StorageResponse, StoreError> {
        match request {
            StorageRequest::LearnConcept(payload) => {
                let tenant = payload.tenant.map(TenantId::from_bytes);
                let concept = self.store.learn_concept(payload.content, payload.embedding, tenant, payload.metadata)?;
                self.events.concept_learned(concept.id);
                Ok(StorageResponse::ConceptOk(concept_view(&concept)))
            }
            StorageRequest::LearnBatch(items) => {
                if items.len() > MAX_BATCH {
                    return Err(StoreError::BatchTooLarge(items.len(), MAX_BATCH));
                }
                let mut last = None;
                for item in items {
                    let tenant = item.tenant.map(TenantId::from_bytes);
                    let concept = self.store.learn_concept(item.content, item.embedding, tenant, item.metadata)?;
                    last = Some(concept);
                }
                match last {
                    Some(concept) => Ok(StorageResponse::ConceptOk(concept_view(&concept))),
                    None => Ok(StorageResponse::StatsOk {
                        concept_count: self.store.concept_count() as u64,
                        association_count: self.store.association_count() as u64,
                        wal_sequence: self.store.wal_sequence(),
                        uptime_seconds: self.started.elapsed().as_secs(),
                    }),
                }
            }
            StorageRequest::LearnAssociation {
                source,
                target,
                assoc_type,
                confidence,
                tenant,
            } => {
                let assoc_type = AssociationType::from_u8(assoc_type).ok_or(StoreError::InvalidType(assoc_type))?;
                let assoc = self.store.learn_association(
                    ConceptId(source),
                    ConceptId(target),
                    assoc_type,
                    confidence,
                    tenant.map(TenantId::from_bytes),
                )?;
                Ok(StorageResponse::AssociationOk(Some(association_view(&assoc))))
            }
            StorageRequest::GetConcept { id } => {
                let concept = self.store.get_concept(ConceptId(id))?;
                Ok(StorageResponse::ConceptOk(concept_view(&concept)))
            }
            StorageRequest::GetNeighbors { id } => {
                let neighbors = self.store.get_neighbors(ConceptId(id));
                Ok(StorageResponse::NeighborsOk(
                    neighbors
                        .into_iter()
                        .map(|n| NeighborView {
                            neighbor: n.neighbor.0,
                            assoc_type: n.assoc_type as u8,
                            weight: n.weight,
                        })
                        .collect(),
                ))
            }
            StorageRequest::GetAssociation { source, target, assoc_type } => {
                let assoc_type = AssociationType::from_u8(assoc_type).ok_or(StoreError::InvalidType(assoc_type))?;
                let assoc = self.store.get_association(ConceptId(source), ConceptId(target), assoc_type);
                Ok(StorageResponse::AssociationOk(assoc.as_ref().map(association_view)))
            }
            StorageRequest::FindPath { source, target, max_depth } => {
                let path = self.store.find_path(ConceptId(source), ConceptId(target), max_depth)?;
                Ok(StorageResponse::PathOk(path.map(|p| path_view(&p))))
            }
            StorageRequest::VectorSearch { query, k, ef_search } => {
                let results = self.store.vector_search(&query, k, ef_search)?;
                Ok(StorageResponse::VectorSearchOk(
                    results.into_iter().map(|(c, score)| (concept_view(&c), score)).collect(),
                ))
            }
            StorageRequest::DecayAndPrune { half_life_seconds, min_score } => {
                let report = self.store.decay_and_prune(half_life_seconds, min_score)?;
                Ok(StorageResponse::PruneOk {
                    associations_pruned: report.associations_pruned,
                })
            }
            StorageRequest::TxnPrepare {
                txn_id,
                source,
                target,
                assoc_type,
                confidence,
                tenant,
            } => {
                let assoc_type = AssociationType::from_u8(assoc_type).ok_or(StoreError::InvalidType(assoc_type))?;
                self.store.get_concept(ConceptId(source))?;
                self.store.get_concept(ConceptId(target))?;
                self.participant.prepare(
                    txn_id,
                    PendingOp::Association {
                        source: ConceptId(source),
                        target: ConceptId(target),
                        assoc_type,
                        confidence,
                        tenant: tenant.map(TenantId::from_bytes),
                    },
                );
                Ok(StorageResponse::TxnAck)
            }
            StorageRequest::TxnCommit { txn_id } => {
                if let Some(PendingOp::Association {
                    source,
                    target,
                    assoc_type,
                    confidence,
                    tenant,
                }) = self.participant.commit(txn_id)
                {
                    self.store.learn_association(source, target, assoc_type, confidence, tenant)?;
                }
                Ok(StorageResponse::TxnAck)
            }
            StorageRequest::TxnAbort { txn_id } => {
                self.participant.abort(txn_id);
                Ok(StorageResponse::TxnAck)
            }
            StorageRequest::Stats => Ok(StorageResponse::StatsOk {
                concept_count: self.store.concept_count() as u64,
                association_count: self.store.association_count() as u64,
                wal_sequence: self.store.wal_sequence(),
                uptime_seconds: self.started.elapsed().as_secs(),
            }),
            StorageRequest::Ping => Ok(StorageResponse::Pong),
            StorageRequest::Auth { .. } => Ok(StorageResponse::AuthOk),
        }
    }
}

fn concept_view(concept: &Concept) -> ConceptView {
    ConceptView {
        id: concept.id.0,
        content: concept.content.clone(),
        strength: concept.strength,
        confidence: concept.confidence,
        access_count: concept.access_count,
    }
}

fn association_view(assoc: &crate::types::Association) -> AssociationView {
    AssociationView {
        source: assoc.source.0,
        target: assoc.target.0,
        assoc_type: assoc.assoc_type as u8,
        weight: assoc.weight,
        confidence: assoc.confidence,
    }
}

fn path_view(path: &GraphPath) -> PathView {
    PathView {
        concepts: path.concepts.iter().map(|c| c.0).collect(),
        edges: path.edges.iter().map(|(a, b, t)| (a.0, b.0, *t as u8)).collect(),
        confidence: path.confidence,
    }
}

fn ok_frame(opcode: u8, request_id: u16, response: &StorageResponse) -> Frame {
    match encode(response) {
        Ok(payload) => Frame::response(opcode, request_id, payload),
        Err(e) => error_frame(opcode, request_id, 4001, &format!("failed to encode response: {e}")),
    }
}

fn error_frame(opcode: u8, request_id: u16, code: u16, message: &str) -> Frame {
    let payload = ErrorPayload {
        code,
        message: message.to_string(),
        details: None,
    };
    let encoded = encode(&payload).unwrap_or_default();
    Frame::error_response(opcode, request_id, encoded)
}

/// A maybe-TLS connection. `tcp_server` only needs `AsyncRead`/`AsyncWrite`
/// over it, so the two branches are switched on at every poll.
enum Conn {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Conn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_emitter::StorageEventEmitter;
    use crate::store::StoreConfig;
    use tempfile::TempDir;

    fn server(dir: &std::path::Path) -> ShardServer {
        let store = Arc::new(Store::open(StoreConfig::new(dir, 4)).unwrap());
        let events = Arc::new(StorageEventEmitter::new());
        let mut config = NodeConfig::from_env().unwrap();
        config.storage_path = dir.to_path_buf();
        ShardServer::new(store, events, config)
    }

    #[tokio::test]
    async fn ping_round_trips() {
        let dir = TempDir::new().unwrap();
        let server = server(dir.path());
        let auth = AtomicBool::new(true);
        let response = server.dispatch(StorageRequest::Ping).await.unwrap();
        assert!(matches!(response, StorageResponse::Pong));
        drop(auth);
    }

    #[tokio::test]
    async fn learn_then_get_concept_round_trips() {
        let dir = TempDir::new().unwrap();
        let server = server(dir.path());
        let payload = noema_protocol::ConceptPayload {
            content: "octopuses have three hearts".into(),
            embedding: vec![1.0, 2.0, 3.0, 4.0],
            tenant: None,
            metadata: Default::default(),
        };
        let learned = server.dispatch(StorageRequest::LearnConcept(payload)).await.unwrap();
        let id = match learned {
            StorageResponse::ConceptOk(view) => view.id,
            other => panic!("unexpected response: {other:?}"),
        };

        let fetched = server.dispatch(StorageRequest::GetConcept { id }).await.unwrap();
        match fetched {
            StorageResponse::ConceptOk(view) => assert_eq!(view.content, "octopuses have three hearts"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_association_type_is_rejected() {
        let dir = TempDir::new().unwrap();
        let server = server(dir.path());
        let err = server
            .dispatch(StorageRequest::LearnAssociation {
                source: [1; 16],
                target: [2; 16],
                assoc_type: 99,
                confidence: 0.5,
                tenant: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidType(99)));
    }
}
