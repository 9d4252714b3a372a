//! Wire framing for the broker's request/reply protocol.
//!
//! Mirrors the ROUTER-socket framing conventions this codebase already uses
//! in its DEALER/ROUTER request/reply layer (see `reqrep.rs`'s module docs):
//! on recv, zeromq-rs prepends the peer identity frame on a ROUTER socket and
//! pops it again on send, so application code only ever builds the frames
//! that follow the identity.
//!
//! Frame layout, identity frame omitted (the socket handles it):
//!
//! ```text
//! client -> broker:  [] [CLIENT_HEADER] [service] [body...]
//! broker -> client:  [] [CLIENT_HEADER] [service] [reply...]
//! broker -> worker:  [] [WORKER_HEADER] [command] [client-envelope] [] [body...]
//! worker -> broker:  [] [WORKER_HEADER] [command] [client-envelope] [] [reply...]
//! ```
//!
//! `client-envelope` above is the worker-facing encoding of the client's
//! identity frame, so that a reply can be routed back without the broker
//! keeping per-request state beyond the registry itself.

use zeromq::ZmqMessage;

/// Client-side protocol header, with an embedded version suffix so
/// incompatible peers can be rejected by byte-comparison.
pub const CLIENT_HEADER: &[u8] = b"MDPC01";

/// Worker-side protocol header.
pub const WORKER_HEADER: &[u8] = b"MDPW01";

/// Prefix reserved for the in-broker management service (see `mgmt.rs`).
pub const MMI_PREFIX: &str = "mmi.";

/// Single-byte command tags exchanged on the worker-facing socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ready,
    Request,
    Reply,
    Heartbeat,
    Disconnect,
    RequestViaEncrypted,
    ReplyViaEncrypted,
}

impl Command {
    const READY: u8 = 0x01;
    const REQUEST: u8 = 0x02;
    const REPLY: u8 = 0x03;
    const HEARTBEAT: u8 = 0x04;
    const DISCONNECT: u8 = 0x05;
    const REQUEST_VIA_ENCRYPTED: u8 = 0x06;
    const REPLY_VIA_ENCRYPTED: u8 = 0x07;

    pub fn as_byte(self) -> u8 {
        match self {
            Command::Ready => Self::READY,
            Command::Request => Self::REQUEST,
            Command::Reply => Self::REPLY,
            Command::Heartbeat => Self::HEARTBEAT,
            Command::Disconnect => Self::DISCONNECT,
            Command::RequestViaEncrypted => Self::REQUEST_VIA_ENCRYPTED,
            Command::ReplyViaEncrypted => Self::REPLY_VIA_ENCRYPTED,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            Self::READY => Some(Command::Ready),
            Self::REQUEST => Some(Command::Request),
            Self::REPLY => Some(Command::Reply),
            Self::HEARTBEAT => Some(Command::Heartbeat),
            Self::DISCONNECT => Some(Command::Disconnect),
            Self::REQUEST_VIA_ENCRYPTED => Some(Command::RequestViaEncrypted),
            Self::REPLY_VIA_ENCRYPTED => Some(Command::ReplyViaEncrypted),
            _ => None,
        }
    }
}

/// Which router endpoint a message arrived on or must egress on.
///
/// The `zeromq` crate this codebase depends on does not implement CURVE, so
/// "encrypted" here denotes the second router endpoint gated by the
/// `Authenticator` (see `auth.rs`), not a literal encrypted socket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Plaintext,
    Encrypted,
}

impl Channel {
    pub fn request_command(self) -> Command {
        match self {
            Channel::Plaintext => Command::Request,
            Channel::Encrypted => Command::RequestViaEncrypted,
        }
    }

    pub fn reply_command(self) -> Command {
        match self {
            Channel::Plaintext => Command::Reply,
            Channel::Encrypted => Command::ReplyViaEncrypted,
        }
    }
}

/// A decoded client-role frame, with the identity already stripped off.
pub enum ClientFrame {
    Request { service: String, body: Vec<Vec<u8>> },
}

/// A decoded worker-role frame, with the identity already stripped off.
pub enum WorkerFrame {
    Ready { service: String },
    Reply { envelope: Vec<u8>, body: Vec<Vec<u8>> },
    ReplyViaEncrypted { envelope: Vec<u8>, body: Vec<Vec<u8>> },
    Heartbeat,
    Disconnect,
}

/// Split the raw frame list (identity already removed by the ROUTER socket)
/// by protocol header, skipping the empty delimiter frame that separates the
/// identity from the header on the wire. Returns `(header, rest)`.
fn split_header(frames: &[bytes::Bytes]) -> Option<(&bytes::Bytes, &[bytes::Bytes])> {
    let start = frames.iter().position(|f| !f.is_empty())?;
    frames[start..].split_first()
}

/// Decode a client-role message. `frames` excludes the identity frame.
pub fn decode_client_frame(frames: &[bytes::Bytes]) -> Result<ClientFrame, String> {
    let (header, rest) = split_header(frames).ok_or("empty client frame")?;
    if header.as_ref() != CLIENT_HEADER {
        return Err("bad client header".into());
    }
    let (service, body) = rest.split_first().ok_or("missing service name")?;
    let service = String::from_utf8(service.to_vec()).map_err(|_| "non-utf8 service name")?;
    Ok(ClientFrame::Request {
        service,
        body: body.iter().map(|b| b.to_vec()).collect(),
    })
}

/// Decode a worker-role message. `frames` excludes the identity frame.
pub fn decode_worker_frame(frames: &[bytes::Bytes]) -> Result<WorkerFrame, String> {
    let (header, rest) = split_header(frames).ok_or("empty worker frame")?;
    if header.as_ref() != WORKER_HEADER {
        return Err("bad worker header".into());
    }
    let (cmd_byte, rest) = rest.split_first().ok_or("missing command byte")?;
    if cmd_byte.len() != 1 {
        return Err("malformed command byte".into());
    }
    let command = Command::from_byte(cmd_byte[0]).ok_or("unknown command byte")?;
    match command {
        Command::Ready => {
            let service = rest.first().ok_or("READY missing service name")?;
            Ok(WorkerFrame::Ready {
                service: String::from_utf8(service.to_vec())
                    .map_err(|_| "non-utf8 service name")?,
            })
        }
        Command::Reply | Command::ReplyViaEncrypted => {
            let envelope = rest.first().ok_or("REPLY missing client envelope")?;
            let body: Vec<Vec<u8>> = rest
                .iter()
                .skip(1)
                .skip_while(|f| f.is_empty())
                .map(|f| f.to_vec())
                .collect();
            let envelope = envelope.to_vec();
            Ok(if command == Command::Reply {
                WorkerFrame::Reply { envelope, body }
            } else {
                WorkerFrame::ReplyViaEncrypted { envelope, body }
            })
        }
        Command::Heartbeat => Ok(WorkerFrame::Heartbeat),
        Command::Disconnect => Ok(WorkerFrame::Disconnect),
        Command::RequestViaEncrypted | Command::Request => {
            Err("REQUEST is broker-to-worker only".into())
        }
    }
}

/// Build a `[identity] [] [CLIENT_HEADER] [service] [body...]` reply message.
pub fn build_client_reply(identity: &[u8], service: &str, body: &[Vec<u8>]) -> ZmqMessage {
    let mut msg = ZmqMessage::from(identity.to_vec());
    msg.push_back(Vec::new().into());
    msg.push_back(CLIENT_HEADER.to_vec().into());
    msg.push_back(service.as_bytes().to_vec().into());
    for frame in body {
        msg.push_back(frame.clone().into());
    }
    msg
}

/// Build a `[identity] [] [WORKER_HEADER] [REQUEST|REQUEST-VIA-ENCRYPTED]
/// [client-envelope] [] [body...]` message for dispatch to a worker.
pub fn build_worker_request(
    worker_identity: &[u8],
    channel: Channel,
    client_envelope: &[u8],
    body: &[Vec<u8>],
) -> ZmqMessage {
    let mut msg = ZmqMessage::from(worker_identity.to_vec());
    msg.push_back(Vec::new().into());
    msg.push_back(WORKER_HEADER.to_vec().into());
    msg.push_back(vec![channel.request_command().as_byte()].into());
    msg.push_back(client_envelope.to_vec().into());
    msg.push_back(Vec::new().into());
    for frame in body {
        msg.push_back(frame.clone().into());
    }
    msg
}

/// Build a `[identity] [] [WORKER_HEADER] [HEARTBEAT]` message.
pub fn build_worker_heartbeat(worker_identity: &[u8]) -> ZmqMessage {
    let mut msg = ZmqMessage::from(worker_identity.to_vec());
    msg.push_back(Vec::new().into());
    msg.push_back(WORKER_HEADER.to_vec().into());
    msg.push_back(vec![Command::Heartbeat.as_byte()].into());
    msg
}

/// Build a `[identity] [] [WORKER_HEADER] [DISCONNECT]` message.
pub fn build_worker_disconnect(worker_identity: &[u8]) -> ZmqMessage {
    let mut msg = ZmqMessage::from(worker_identity.to_vec());
    msg.push_back(Vec::new().into());
    msg.push_back(WORKER_HEADER.to_vec().into());
    msg.push_back(vec![Command::Disconnect.as_byte()].into());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_byte_roundtrip() {
        for cmd in [
            Command::Ready,
            Command::Request,
            Command::Reply,
            Command::Heartbeat,
            Command::Disconnect,
            Command::RequestViaEncrypted,
            Command::ReplyViaEncrypted,
        ] {
            assert_eq!(Command::from_byte(cmd.as_byte()), Some(cmd));
        }
    }

    #[test]
    fn unknown_command_byte_rejected() {
        assert_eq!(Command::from_byte(0xff), None);
    }

    #[test]
    fn channel_picks_matching_commands() {
        assert_eq!(Channel::Plaintext.request_command(), Command::Request);
        assert_eq!(
            Channel::Encrypted.request_command(),
            Command::RequestViaEncrypted
        );
        assert_eq!(Channel::Plaintext.reply_command(), Command::Reply);
        assert_eq!(
            Channel::Encrypted.reply_command(),
            Command::ReplyViaEncrypted
        );
    }

    #[test]
    fn decode_client_request() {
        let frames = vec![
            bytes::Bytes::from_static(CLIENT_HEADER),
            bytes::Bytes::from_static(b"echo"),
            bytes::Bytes::from_static(b"hi"),
        ];
        match decode_client_frame(&frames).unwrap() {
            ClientFrame::Request { service, body } => {
                assert_eq!(service, "echo");
                assert_eq!(body, vec![b"hi".to_vec()]);
            }
        }
    }

    #[test]
    fn decode_client_rejects_bad_header() {
        let frames = vec![bytes::Bytes::from_static(b"bogus")];
        assert!(decode_client_frame(&frames).is_err());
    }

    #[test]
    fn decode_worker_ready() {
        let frames = vec![
            bytes::Bytes::from_static(WORKER_HEADER),
            bytes::Bytes::copy_from_slice(&[Command::Ready.as_byte()]),
            bytes::Bytes::from_static(b"echo"),
        ];
        match decode_worker_frame(&frames).unwrap() {
            WorkerFrame::Ready { service } => assert_eq!(service, "echo"),
            _ => panic!("expected Ready"),
        }
    }

    #[test]
    fn decode_worker_reply() {
        let frames = vec![
            bytes::Bytes::from_static(WORKER_HEADER),
            bytes::Bytes::copy_from_slice(&[Command::Reply.as_byte()]),
            bytes::Bytes::from_static(b"client-id"),
            bytes::Bytes::new(),
            bytes::Bytes::from_static(b"HI"),
        ];
        match decode_worker_frame(&frames).unwrap() {
            WorkerFrame::Reply { envelope, body } => {
                assert_eq!(envelope, b"client-id");
                assert_eq!(body, vec![b"HI".to_vec()]);
            }
            _ => panic!("expected Reply"),
        }
    }

    #[test]
    fn decode_worker_heartbeat_and_disconnect() {
        let hb = vec![
            bytes::Bytes::from_static(WORKER_HEADER),
            bytes::Bytes::copy_from_slice(&[Command::Heartbeat.as_byte()]),
        ];
        assert!(matches!(
            decode_worker_frame(&hb).unwrap(),
            WorkerFrame::Heartbeat
        ));

        let dc = vec![
            bytes::Bytes::from_static(WORKER_HEADER),
            bytes::Bytes::copy_from_slice(&[Command::Disconnect.as_byte()]),
        ];
        assert!(matches!(
            decode_worker_frame(&dc).unwrap(),
            WorkerFrame::Disconnect
        ));
    }

    #[test]
    fn decode_worker_rejects_broker_only_command() {
        let frames = vec![
            bytes::Bytes::from_static(WORKER_HEADER),
            bytes::Bytes::copy_from_slice(&[Command::Request.as_byte()]),
        ];
        assert!(decode_worker_frame(&frames).is_err());
    }

    #[test]
    fn build_client_reply_frame_shape() {
        let msg = build_client_reply(b"id1", "echo", &[b"HI".to_vec()]);
        let frames: Vec<_> = msg.iter().collect();
        assert_eq!(frames[0].as_ref(), b"id1");
        assert!(frames[1].is_empty());
        assert_eq!(frames[2].as_ref(), CLIENT_HEADER);
        assert_eq!(frames[3].as_ref(), b"echo");
        assert_eq!(frames[4].as_ref(), b"HI");
    }
}
