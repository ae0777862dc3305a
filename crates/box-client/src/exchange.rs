//! The client-side request state machine, sans IO.
//!
//! Every conversation opens the same way: HELLO, check the version set,
//! STATUS ping. What happens after the ping depends on the action. The
//! machine never touches a socket; the driver feeds it datagrams and acts
//! on the step it returns, which keeps every transition unit-testable.

use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use box_core::options::ClientAction;
use box_core::wire::{
    decode_frame, encode_frame, Command, GetPayload, HelloPayload, LocateKind, LocatePayload,
    PutPayload, StatusCode, StatusPayload, WireError, PROTOCOL_VERSION, SUPPORTED_VERSIONS,
};

/// What the driver should do next.
#[derive(Debug)]
pub enum Step {
    /// Transmit this datagram, then keep receiving.
    Send(Bytes),
    /// Keep receiving.
    Continue,
    /// The conversation is over.
    Done(Outcome),
}

/// Terminal result of a successful conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Handshake,
    Ping { message: String },
    PutAck,
    Got {
        queue: String,
        content_type: String,
        data: Vec<u8>,
    },
    Located { body: serde_json::Value },
    Synced { objects: Vec<SyncedObject> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedObject {
    pub queue: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingForHello,
    WaitingForStatus,
    WaitingForPutAck,
    WaitingForGetResponse,
    WaitingForLocateResponse,
    WaitingForSyncStream,
    Completed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::WaitingForHello => "waiting-for-hello",
            State::WaitingForStatus => "waiting-for-status",
            State::WaitingForPutAck => "waiting-for-put-ack",
            State::WaitingForGetResponse => "waiting-for-get-response",
            State::WaitingForLocateResponse => "waiting-for-locate-response",
            State::WaitingForSyncStream => "waiting-for-sync-stream",
            State::Completed => "completed",
        }
    }
}

pub struct Exchange {
    state: State,
    action: ClientAction,
    node_id: Uuid,
    user_id: Uuid,
    pending_request: Uuid,
    synced: Vec<SyncedObject>,
}

impl Exchange {
    /// Open a conversation. Returns the machine and the HELLO datagram.
    pub fn start(
        action: ClientAction,
        node_id: Uuid,
        user_id: Uuid,
    ) -> Result<(Self, Bytes), ClientError> {
        let request = Uuid::new_v4();
        let hello = HelloPayload {
            status: StatusCode::Ok,
            versions: SUPPORTED_VERSIONS.to_vec(),
        };
        let datagram = encode_frame(Command::Hello, request, node_id, user_id, &hello.encode())?;
        Ok((
            Self {
                state: State::WaitingForHello,
                action,
                node_id,
                user_id,
                pending_request: request,
                synced: Vec::new(),
            },
            datagram,
        ))
    }

    /// Current state, for logging and tests.
    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Feed one inbound datagram.
    pub fn on_datagram(&mut self, datagram: &[u8]) -> Result<Step, ClientError> {
        let frame = decode_frame(datagram)?;

        if frame.request_id != self.pending_request {
            tracing::debug!(
                expected = %self.pending_request,
                got = %frame.request_id,
                "ignoring datagram for a different request"
            );
            return Ok(Step::Continue);
        }

        match self.state {
            State::WaitingForHello => self.on_hello(frame.command, frame.payload),
            State::WaitingForStatus => self.on_status_ping(frame.command, frame.payload),
            State::WaitingForPutAck => {
                let status = self.expect_status(frame.command, frame.payload)?;
                self.state = State::Completed;
                if status.status == StatusCode::Ok {
                    Ok(Step::Done(Outcome::PutAck))
                } else {
                    Err(remote(status))
                }
            }
            State::WaitingForGetResponse => match frame.command {
                Command::Put => {
                    let body = PutPayload::decode(frame.payload)?;
                    self.state = State::Completed;
                    Ok(Step::Done(Outcome::Got {
                        queue: body.queue,
                        content_type: body.content_type,
                        data: body.data.to_vec(),
                    }))
                }
                Command::Status => {
                    let status = StatusPayload::decode(frame.payload)?;
                    self.state = State::Completed;
                    Err(remote(status))
                }
                got => Err(self.unexpected(got)),
            },
            State::WaitingForLocateResponse => match frame.command {
                Command::Put => {
                    let body = PutPayload::decode(frame.payload)?;
                    let value =
                        serde_json::from_slice(&body.data).map_err(ClientError::BadLocateBody)?;
                    self.state = State::Completed;
                    Ok(Step::Done(Outcome::Located { body: value }))
                }
                Command::Status => {
                    let status = StatusPayload::decode(frame.payload)?;
                    self.state = State::Completed;
                    Err(remote(status))
                }
                got => Err(self.unexpected(got)),
            },
            State::WaitingForSyncStream => match frame.command {
                Command::Put => {
                    let body = PutPayload::decode(frame.payload)?;
                    self.synced.push(SyncedObject {
                        queue: body.queue,
                        content_type: body.content_type,
                        data: body.data.to_vec(),
                    });
                    Ok(Step::Continue)
                }
                Command::Status => {
                    let status = StatusPayload::decode(frame.payload)?;
                    self.state = State::Completed;
                    if status.status == StatusCode::Ok {
                        Ok(Step::Done(Outcome::Synced {
                            objects: std::mem::take(&mut self.synced),
                        }))
                    } else {
                        Err(remote(status))
                    }
                }
                got => Err(self.unexpected(got)),
            },
            State::Completed => Err(self.unexpected(frame.command)),
        }
    }

    fn on_hello(&mut self, command: Command, payload: &[u8]) -> Result<Step, ClientError> {
        if command != Command::Hello {
            return Err(self.unexpected(command));
        }
        let hello = HelloPayload::decode(payload)?;
        if !hello.speaks_current() {
            return Err(ClientError::UnsupportedVersion {
                offered: hello.versions,
            });
        }
        let ping = StatusPayload::new(StatusCode::Ok, "ping");
        let datagram = self.request(Command::Status, &ping.encode())?;
        self.state = State::WaitingForStatus;
        Ok(Step::Send(datagram))
    }

    /// The STATUS ping response carries the server's identification string
    /// and gates the action dispatch.
    fn on_status_ping(&mut self, command: Command, payload: &[u8]) -> Result<Step, ClientError> {
        let status = self.expect_status(command, payload)?;
        if status.status != StatusCode::Ok {
            self.state = State::Completed;
            return Err(remote(status));
        }

        match self.action.clone() {
            ClientAction::Handshake => {
                self.state = State::Completed;
                Ok(Step::Done(Outcome::Handshake))
            }
            ClientAction::Ping => {
                self.state = State::Completed;
                Ok(Step::Done(Outcome::Ping {
                    message: status.message,
                }))
            }
            ClientAction::Put {
                queue,
                content_type,
                data,
            } => {
                let put = PutPayload {
                    queue,
                    content_type,
                    data: data.into(),
                };
                let datagram = self.request(Command::Put, &put.encode())?;
                self.state = State::WaitingForPutAck;
                Ok(Step::Send(datagram))
            }
            ClientAction::Get { queue } => {
                let datagram = self.request(Command::Get, &GetPayload { queue }.encode())?;
                self.state = State::WaitingForGetResponse;
                Ok(Step::Send(datagram))
            }
            ClientAction::Locate { subject } => {
                let locate = LocatePayload {
                    subject,
                    // The caller rarely knows which it is; the server
                    // resolves node-first either way.
                    kind: LocateKind::Node,
                };
                let datagram = self.request(Command::Locate, &locate.encode())?;
                self.state = State::WaitingForLocateResponse;
                Ok(Step::Send(datagram))
            }
            ClientAction::Sync { queue } => {
                let datagram = self.request(Command::Search, &GetPayload { queue }.encode())?;
                self.state = State::WaitingForSyncStream;
                Ok(Step::Send(datagram))
            }
        }
    }

    fn expect_status(
        &mut self,
        command: Command,
        payload: &[u8],
    ) -> Result<StatusPayload, ClientError> {
        if command != Command::Status {
            return Err(self.unexpected(command));
        }
        Ok(StatusPayload::decode(payload)?)
    }

    /// Encode a request frame under a fresh request id.
    fn request(&mut self, command: Command, payload: &[u8]) -> Result<Bytes, ClientError> {
        self.pending_request = Uuid::new_v4();
        Ok(encode_frame(
            command,
            self.pending_request,
            self.node_id,
            self.user_id,
            payload,
        )?)
    }

    fn unexpected(&self, got: Command) -> ClientError {
        ClientError::UnexpectedCommand {
            state: self.state.name(),
            got,
        }
    }
}

fn remote(status: StatusPayload) -> ClientError {
    ClientError::Remote {
        status: status.status,
        message: status.message,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("server does not speak protocol version {PROTOCOL_VERSION}, offered {offered:?}")]
    UnsupportedVersion { offered: Vec<u16> },

    #[error("unexpected {got:?} while {state}")]
    UnexpectedCommand { state: &'static str, got: Command },

    #[error("remote returned {status:?}: {message:?}")]
    Remote { status: StatusCode, message: String },

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("no usable endpoint to try")]
    NoEndpoints,

    #[error("locate response is not JSON: {0}")]
    BadLocateBody(serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Errors that end the whole run rather than just this attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientError::UnsupportedVersion { .. } | ClientError::Remote { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_ids() -> (Uuid, Uuid) {
        (Uuid::new_v4(), Uuid::new_v4())
    }

    /// Build a server response to the machine's pending request.
    fn respond(exchange: &Exchange, command: Command, payload: &[u8]) -> Vec<u8> {
        let (node, user) = server_ids();
        encode_frame(command, exchange.pending_request, node, user, payload)
            .unwrap()
            .to_vec()
    }

    fn hello_ok(exchange: &Exchange) -> Vec<u8> {
        respond(
            exchange,
            Command::Hello,
            &HelloPayload {
                status: StatusCode::Ok,
                versions: vec![1],
            }
            .encode(),
        )
    }

    fn status_ok(exchange: &Exchange, message: &str) -> Vec<u8> {
        respond(
            exchange,
            Command::Status,
            &StatusPayload::new(StatusCode::Ok, message).encode(),
        )
    }

    fn advance_to_action(exchange: &mut Exchange) -> Step {
        let hello = hello_ok(exchange);
        let step = exchange.on_datagram(&hello).unwrap();
        assert!(matches!(step, Step::Send(_)), "expected the status ping");
        let status = status_ok(exchange, "boxd/test");
        exchange.on_datagram(&status).unwrap()
    }

    #[test]
    fn handshake_completes_after_ping() {
        let (mut exchange, first) =
            Exchange::start(ClientAction::Handshake, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        assert_eq!(decode_frame(&first).unwrap().command, Command::Hello);
        assert_eq!(exchange.state_name(), "waiting-for-hello");

        match advance_to_action(&mut exchange) {
            Step::Done(Outcome::Handshake) => {}
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(exchange.state_name(), "completed");
    }

    #[test]
    fn ping_captures_the_identification_string() {
        let (mut exchange, _) =
            Exchange::start(ClientAction::Ping, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        match advance_to_action(&mut exchange) {
            Step::Done(Outcome::Ping { message }) => assert_eq!(message, "boxd/test"),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn version_mismatch_aborts() {
        let (mut exchange, _) =
            Exchange::start(ClientAction::Handshake, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        let hello = respond(
            &exchange,
            Command::Hello,
            &HelloPayload {
                status: StatusCode::Ok,
                versions: vec![2, 7],
            }
            .encode(),
        );
        match exchange.on_datagram(&hello).unwrap_err() {
            ClientError::UnsupportedVersion { offered } => assert_eq!(offered, vec![2, 7]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn put_waits_for_the_ack() {
        let action = ClientAction::Put {
            queue: "demo".into(),
            content_type: "text/plain".into(),
            data: b"Hello".to_vec(),
        };
        let (mut exchange, _) = Exchange::start(action, Uuid::new_v4(), Uuid::new_v4()).unwrap();

        let step = advance_to_action(&mut exchange);
        let Step::Send(datagram) = step else {
            panic!("expected the put frame");
        };
        let frame = decode_frame(&datagram).unwrap();
        assert_eq!(frame.command, Command::Put);
        assert_eq!(exchange.state_name(), "waiting-for-put-ack");

        let ack = status_ok(&exchange, "");
        match exchange.on_datagram(&ack).unwrap() {
            Step::Done(Outcome::PutAck) => {}
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn get_accepts_a_put_shaped_response() {
        let action = ClientAction::Get {
            queue: "demo".into(),
        };
        let (mut exchange, _) = Exchange::start(action, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        advance_to_action(&mut exchange);

        let body = PutPayload {
            queue: "demo".into(),
            content_type: "text/plain".into(),
            data: Bytes::from_static(b"Hello"),
        };
        let response = respond(&exchange, Command::Put, &body.encode());
        match exchange.on_datagram(&response).unwrap() {
            Step::Done(Outcome::Got {
                queue,
                content_type,
                data,
            }) => {
                assert_eq!(queue, "demo");
                assert_eq!(content_type, "text/plain");
                assert_eq!(data, b"Hello");
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn get_on_empty_queue_surfaces_the_remote_status() {
        let action = ClientAction::Get {
            queue: "demo".into(),
        };
        let (mut exchange, _) = Exchange::start(action, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        advance_to_action(&mut exchange);

        let response = respond(
            &exchange,
            Command::Status,
            &StatusPayload::new(StatusCode::NotFound, "").encode(),
        );
        match exchange.on_datagram(&response).unwrap_err() {
            ClientError::Remote { status, .. } => assert_eq!(status, StatusCode::NotFound),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn sync_collects_until_the_terminating_status() {
        let action = ClientAction::Sync {
            queue: "feed".into(),
        };
        let (mut exchange, _) = Exchange::start(action, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        advance_to_action(&mut exchange);
        assert_eq!(exchange.state_name(), "waiting-for-sync-stream");

        for body in ["one", "two"] {
            let put = PutPayload {
                queue: "feed".into(),
                content_type: "text/plain".into(),
                data: Bytes::copy_from_slice(body.as_bytes()),
            };
            let datagram = respond(&exchange, Command::Put, &put.encode());
            assert!(matches!(
                exchange.on_datagram(&datagram).unwrap(),
                Step::Continue
            ));
        }

        let done = status_ok(&exchange, "");
        match exchange.on_datagram(&done).unwrap() {
            Step::Done(Outcome::Synced { objects }) => {
                assert_eq!(objects.len(), 2);
                assert_eq!(objects[0].data, b"one");
                assert_eq!(objects[1].data, b"two");
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn stray_request_ids_are_ignored() {
        let (mut exchange, _) =
            Exchange::start(ClientAction::Handshake, Uuid::new_v4(), Uuid::new_v4()).unwrap();

        let stray = encode_frame(
            Command::Hello,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            &HelloPayload {
                status: StatusCode::Ok,
                versions: vec![1],
            }
            .encode(),
        )
        .unwrap();
        assert!(matches!(
            exchange.on_datagram(&stray).unwrap(),
            Step::Continue
        ));
        assert_eq!(exchange.state_name(), "waiting-for-hello");
    }

    #[test]
    fn unexpected_command_terminates_the_machine() {
        let (mut exchange, _) =
            Exchange::start(ClientAction::Handshake, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        let wrong = respond(&exchange, Command::Put, &[0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(
            exchange.on_datagram(&wrong).unwrap_err(),
            ClientError::UnexpectedCommand { .. }
        ));
    }

    #[test]
    fn unauthorized_ping_is_terminal() {
        let (mut exchange, _) =
            Exchange::start(ClientAction::Handshake, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        let hello = hello_ok(&exchange);
        exchange.on_datagram(&hello).unwrap();

        let denial = respond(
            &exchange,
            Command::Status,
            &StatusPayload::new(StatusCode::Unauthorized, "").encode(),
        );
        match exchange.on_datagram(&denial).unwrap_err() {
            e @ ClientError::Remote { .. } => assert!(e.is_terminal()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
