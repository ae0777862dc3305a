//! Request dispatcher — the per-frame server-side state machine.
//!
//! One datagram in, zero or more datagrams out. Every non-HELLO request is
//! authorized against the Location Service first; unknown callers get a
//! bare `unauthorized` STATUS and learn nothing else. Invalid framing gets
//! no response at all, so the wire never becomes a decode oracle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use uuid::Uuid;

use box_core::object::StoredObject;
use box_core::queue::QueuePath;
use box_core::record::NodeRecord;
use box_core::wire::{
    decode_frame, encode_frame, Command, DeletePayload, GetPayload, HelloPayload, LocatePayload,
    PutPayload, StatusCode, StatusPayload, MAX_PAYLOAD, SUPPORTED_VERSIONS,
};
use box_store::QueueStore;

use crate::location::LocationService;

/// How long after a HELLO the follow-up STATUS ping skips authorization.
const HELLO_GRACE: Duration = Duration::from_secs(30);

pub struct Dispatcher {
    store: Arc<QueueStore>,
    location: Arc<LocationService>,
    node_id: Uuid,
    user_id: Uuid,
    build: String,
    /// Remotes that sent a HELLO and still owe us their first STATUS ping.
    greeted: DashMap<SocketAddr, Instant>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<QueueStore>,
        location: Arc<LocationService>,
        node_id: Uuid,
        user_id: Uuid,
        build: impl Into<String>,
    ) -> Self {
        Self {
            store,
            location,
            node_id,
            user_id,
            build: build.into(),
            greeted: DashMap::new(),
        }
    }

    /// Turn one inbound datagram into the datagrams to send back.
    ///
    /// An empty result means the frame was dropped (invalid framing) or the
    /// command carries no response.
    pub fn handle_datagram(&self, remote: SocketAddr, datagram: &[u8]) -> Vec<Bytes> {
        let frame = match decode_frame(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(%remote, error = %e, "dropping undecodable datagram");
                return Vec::new();
            }
        };
        let req = frame.request_id;

        if frame.command == Command::Hello {
            return self.on_hello(remote, req, frame.payload);
        }

        // The first STATUS after a HELLO is the handshake ping; it is how a
        // not-yet-registered node learns who it is talking to.
        if frame.command == Command::Status {
            if let Some((_, greeted_at)) = self.greeted.remove(&remote) {
                if greeted_at.elapsed() <= HELLO_GRACE {
                    return vec![self.status_frame(req, StatusCode::Ok, &self.build)];
                }
            }
        }

        if !self.location.authorize(frame.node_id, frame.user_id) {
            tracing::warn!(
                %remote,
                node = %frame.node_id,
                user = %frame.user_id,
                command = ?frame.command,
                "unauthorized request refused"
            );
            return vec![self.status_frame(req, StatusCode::Unauthorized, "")];
        }

        match frame.command {
            Command::Hello => unreachable!("handled above"),
            Command::Status => vec![self.status_frame(req, StatusCode::Ok, &self.build)],
            Command::Put => self.on_put(req, frame.node_id, frame.user_id, frame.payload),
            Command::Get => self.on_get(req, frame.payload),
            Command::Delete => self.on_delete(req, frame.payload),
            Command::Search => self.on_search(req, frame.payload),
            Command::Locate => self.on_locate(req, frame.payload),
            Command::Bye => {
                self.greeted.remove(&remote);
                vec![self.status_frame(req, StatusCode::Ok, "")]
            }
        }
    }

    // ── Command handlers ──────────────────────────────────────────────────────

    fn on_hello(&self, remote: SocketAddr, req: Uuid, payload: &[u8]) -> Vec<Bytes> {
        match HelloPayload::decode(payload) {
            Ok(hello) => {
                tracing::debug!(%remote, versions = ?hello.versions, "hello received");
            }
            Err(e) => {
                tracing::debug!(%remote, error = %e, "dropping malformed hello");
                return Vec::new();
            }
        }

        self.greeted.retain(|_, greeted_at| greeted_at.elapsed() <= HELLO_GRACE);
        self.greeted.insert(remote, Instant::now());

        let reply = HelloPayload {
            status: StatusCode::Ok,
            versions: SUPPORTED_VERSIONS.to_vec(),
        };
        vec![self.reply(Command::Hello, req, &reply.encode())]
    }

    fn on_put(&self, req: Uuid, node_id: Uuid, user_id: Uuid, payload: &[u8]) -> Vec<Bytes> {
        let put = match PutPayload::decode(payload) {
            Ok(put) => put,
            Err(e) => {
                tracing::debug!(error = %e, "malformed put payload");
                return vec![self.status_frame(req, StatusCode::BadRequest, "malformed payload")];
            }
        };
        let queue = match QueuePath::parse(&put.queue) {
            Ok(queue) => queue,
            Err(e) => {
                return vec![self.status_frame(req, StatusCode::BadRequest, &e.to_string())];
            }
        };
        if put.data.len() > MAX_PAYLOAD {
            return vec![self.status_frame(req, StatusCode::TooLarge, "")];
        }

        if queue.is_whoswho() {
            return vec![self.on_put_whoswho(req, node_id, user_id, &put)];
        }

        let object = StoredObject::new(put.content_type, put.data.to_vec(), node_id, user_id);
        match self.store.put(&queue, &object) {
            Ok(reference) => {
                tracing::info!(queue = %queue, id = %reference.id, "object accepted");
                vec![self.status_frame(req, StatusCode::Ok, "")]
            }
            Err(e) => {
                tracing::error!(queue = %queue, error = %e, "store rejected put");
                vec![self.status_frame(req, StatusCode::InternalError, "")]
            }
        }
    }

    /// `whoswho` writes go through the Location Service, and only for
    /// records whose embedded identity matches the frame header.
    fn on_put_whoswho(&self, req: Uuid, node_id: Uuid, user_id: Uuid, put: &PutPayload) -> Bytes {
        let record: NodeRecord = match serde_json::from_slice(&put.data) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable node record in put");
                return self.status_frame(req, StatusCode::BadRequest, "malformed node record");
            }
        };
        if record.node_uuid != node_id || record.user_uuid != user_id {
            return self.status_frame(req, StatusCode::BadRequest, "subject identity mismatch");
        }
        match self.location.publish_node(&record) {
            Ok(()) => self.status_frame(req, StatusCode::Ok, ""),
            Err(e) => {
                tracing::error!(error = %e, "node record publish failed");
                self.status_frame(req, StatusCode::InternalError, "")
            }
        }
    }

    fn on_get(&self, req: Uuid, payload: &[u8]) -> Vec<Bytes> {
        let queue = match self.queue_of(req, payload) {
            Ok(queue) => queue,
            Err(response) => return vec![response],
        };
        match self.store.get_latest(&queue) {
            Ok(object) => vec![self.put_frame(req, queue.as_str(), &object.content_type, &object.data)],
            Err(e) if e.is_not_found() => vec![self.status_frame(req, StatusCode::NotFound, "")],
            Err(e) => {
                tracing::error!(queue = %queue, error = %e, "store rejected get");
                vec![self.status_frame(req, StatusCode::InternalError, "")]
            }
        }
    }

    fn on_delete(&self, req: Uuid, payload: &[u8]) -> Vec<Bytes> {
        let delete = match DeletePayload::decode(payload) {
            Ok(delete) => delete,
            Err(e) => {
                tracing::debug!(error = %e, "malformed delete payload");
                return vec![self.status_frame(req, StatusCode::BadRequest, "malformed payload")];
            }
        };
        let queue = match QueuePath::parse(&delete.queue) {
            Ok(queue) => queue,
            Err(e) => return vec![self.status_frame(req, StatusCode::BadRequest, &e.to_string())],
        };
        match self.store.remove(&queue, delete.id) {
            Ok(()) => vec![self.status_frame(req, StatusCode::Ok, "")],
            Err(e) if e.is_not_found() => vec![self.status_frame(req, StatusCode::NotFound, "")],
            Err(e) => {
                tracing::error!(queue = %queue, error = %e, "store rejected delete");
                vec![self.status_frame(req, StatusCode::InternalError, "")]
            }
        }
    }

    fn on_search(&self, req: Uuid, payload: &[u8]) -> Vec<Bytes> {
        let queue = match self.queue_of(req, payload) {
            Ok(queue) => queue,
            Err(response) => return vec![response],
        };
        let refs = match self.store.list(&queue) {
            Ok(refs) => refs,
            Err(e) if e.is_not_found() => {
                return vec![self.status_frame(req, StatusCode::NotFound, "")];
            }
            Err(e) => {
                tracing::error!(queue = %queue, error = %e, "store rejected search");
                return vec![self.status_frame(req, StatusCode::InternalError, "")];
            }
        };

        let mut responses = Vec::with_capacity(refs.len() + 1);
        for reference in refs {
            match self.store.read(&reference) {
                Ok(object) => {
                    responses.push(self.put_frame(
                        req,
                        queue.as_str(),
                        &object.content_type,
                        &object.data,
                    ));
                }
                Err(e) => {
                    tracing::warn!(url = %reference.url, error = %e, "skipping unreadable object");
                }
            }
        }
        responses.push(self.status_frame(req, StatusCode::Ok, ""));
        responses
    }

    fn on_locate(&self, req: Uuid, payload: &[u8]) -> Vec<Bytes> {
        let locate = match LocatePayload::decode(payload) {
            Ok(locate) => locate,
            Err(e) => {
                tracing::debug!(error = %e, "malformed locate payload");
                return vec![self.status_frame(req, StatusCode::BadRequest, "malformed payload")];
            }
        };

        // Node first; the kind flag is the client's guess, not a contract.
        match self.location.resolve_node(locate.subject) {
            Ok(Some(record)) => return vec![self.locate_reply(req, &record)],
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "locate lookup failed");
                return vec![self.status_frame(req, StatusCode::InternalError, "")];
            }
        }
        match self.location.resolve_user(locate.subject) {
            Ok(resolution) if !resolution.records.is_empty() => {
                vec![self.locate_reply(req, &resolution)]
            }
            Ok(_) => vec![self.status_frame(req, StatusCode::NotFound, "")],
            Err(e) => {
                tracing::error!(error = %e, "locate lookup failed");
                vec![self.status_frame(req, StatusCode::InternalError, "")]
            }
        }
    }

    // ── Response builders ─────────────────────────────────────────────────────

    fn queue_of(&self, req: Uuid, payload: &[u8]) -> Result<QueuePath, Bytes> {
        let get = GetPayload::decode(payload).map_err(|e| {
            tracing::debug!(error = %e, "malformed queue payload");
            self.status_frame(req, StatusCode::BadRequest, "malformed payload")
        })?;
        QueuePath::parse(&get.queue)
            .map_err(|e| self.status_frame(req, StatusCode::BadRequest, &e.to_string()))
    }

    fn locate_reply<T: serde::Serialize>(&self, req: Uuid, body: &T) -> Bytes {
        match serde_json::to_value(body).and_then(|v| serde_json::to_vec(&v)) {
            Ok(json) => self.put_frame(req, box_core::queue::WHOSWHO, "application/json", &json),
            Err(e) => {
                tracing::error!(error = %e, "locate reply encoding failed");
                self.status_frame(req, StatusCode::InternalError, "")
            }
        }
    }

    fn reply(&self, command: Command, req: Uuid, payload: &[u8]) -> Bytes {
        match encode_frame(command, req, self.node_id, self.user_id, payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "response frame encoding failed");
                self.status_frame(req, StatusCode::InternalError, "")
            }
        }
    }

    fn put_frame(&self, req: Uuid, queue: &str, content_type: &str, data: &[u8]) -> Bytes {
        let payload = PutPayload {
            queue: queue.to_owned(),
            content_type: content_type.to_owned(),
            data: Bytes::copy_from_slice(data),
        };
        match encode_frame(Command::Put, req, self.node_id, self.user_id, &payload.encode()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "object does not fit a response frame");
                self.status_frame(req, StatusCode::TooLarge, "")
            }
        }
    }

    /// STATUS frames are bounded well below the frame budget; encoding one
    /// cannot fail.
    fn status_frame(&self, req: Uuid, status: StatusCode, message: &str) -> Bytes {
        let payload = StatusPayload::new(status, message).encode();
        encode_frame(Command::Status, req, self.node_id, self.user_id, &payload)
            .unwrap_or_default()
    }
}
