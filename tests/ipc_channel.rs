mod common;

use common::{init_logging, run_until};
use msgloop::ipc::{
    ChannelMode, ChannelOptions, HELLO_MESSAGE_TYPE, IpcChannel, IpcListener, IpcMessage,
    MAXIMUM_MESSAGE_SIZE, MSG_ROUTING_CONTROL, MSG_ROUTING_NONE, Priority,
};
use msgloop::net::{PipeClient, PipeClientDelegate};
use msgloop::{ChannelError, MessageLoop, ProtocolError, PumpKind};
use std::cell::RefCell;
use std::io;
use std::rc::{Rc, Weak};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Connected(i32),
    Message { message_type: u32, payload: Vec<u8> },
    Error(String),
}

#[derive(Default)]
struct Recorder {
    events: RefCell<Vec<Event>>,
}

impl Recorder {
    fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.events.borrow().iter().filter(|event| matches(event)).count()
    }

    fn connections(&self) -> usize {
        self.count(|event| matches!(event, Event::Connected(_)))
    }

    fn messages(&self) -> usize {
        self.count(|event| matches!(event, Event::Message { .. }))
    }

    fn errors(&self) -> usize {
        self.count(|event| matches!(event, Event::Error(_)))
    }
}

impl IpcListener for Recorder {
    fn on_message_received(&self, _channel: &IpcChannel, message: &IpcMessage) -> bool {
        let payload = message
            .reader()
            .read_data()
            .map(<[u8]>::to_vec)
            .unwrap_or_default();

        self.events.borrow_mut().push(Event::Message {
            message_type: message.message_type(),
            payload,
        });
        true
    }

    fn on_channel_connected(&self, _channel: &IpcChannel, peer_pid: i32) {
        self.events.borrow_mut().push(Event::Connected(peer_pid));
    }

    fn on_channel_error(&self, _channel: &IpcChannel, error: &ChannelError) {
        self.events.borrow_mut().push(Event::Error(error.to_string()));
    }
}

fn listener(recorder: &Rc<Recorder>) -> Weak<dyn IpcListener> {
    Rc::downgrade(recorder) as Weak<dyn IpcListener>
}

fn data_message(message_type: u32, payload: &[u8]) -> IpcMessage {
    let mut message = IpcMessage::new(MSG_ROUTING_CONTROL, message_type, Priority::Normal);
    message.pickle_mut().write_data(payload);
    message
}

fn own_pid() -> i32 {
    std::process::id() as i32
}

#[test]
fn test_hello_precedes_every_message() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.ipc");

    let server_events = Rc::new(Recorder::default());
    let server = IpcChannel::new(&path, ChannelOptions::server(), listener(&server_events)).unwrap();
    server.connect().unwrap();
    assert_eq!(server.mode(), ChannelMode::Server);
    assert!(!server.is_connected());

    let client_events = Rc::new(Recorder::default());
    let client = IpcChannel::new(&path, ChannelOptions::client(), listener(&client_events)).unwrap();

    // Queued before the connection exists; must still follow the hello.
    for message_type in 1..=3 {
        client.send(data_message(message_type, b"early")).unwrap();
    }
    assert_eq!(client.pending_message_count(), 3);
    client.connect().unwrap();

    let (server_seen, client_seen) = (server_events.clone(), client_events.clone());
    assert!(run_until(TIMEOUT, move || {
        server_seen.messages() == 3 && client_seen.connections() == 1
    }));

    let events = server_events.events.borrow();
    assert_eq!(events[0], Event::Connected(own_pid()));
    for (index, event) in events[1..].iter().enumerate() {
        assert_eq!(
            *event,
            Event::Message {
                message_type: index as u32 + 1,
                payload: b"early".to_vec()
            }
        );
    }

    assert_eq!(server.peer_pid(), Some(own_pid()));
    assert_eq!(client.peer_pid(), Some(own_pid()));
    assert_eq!(*client_events.events.borrow(), vec![Event::Connected(own_pid())]);
}

#[test]
fn test_large_message_then_replacement_peer() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("large.ipc");

    let server_events = Rc::new(Recorder::default());
    let server = IpcChannel::new(&path, ChannelOptions::server(), listener(&server_events)).unwrap();
    server.connect().unwrap();

    let first_events = Rc::new(Recorder::default());
    let first = IpcChannel::new(&path, ChannelOptions::client(), listener(&first_events)).unwrap();
    first.connect().unwrap();

    let payload: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();
    first.send(data_message(42, &payload)).unwrap();

    let (seen, sender) = (server_events.clone(), first.clone());
    assert!(run_until(TIMEOUT, move || {
        seen.messages() == 1 && sender.pending_message_count() == 0
    }));
    assert_eq!(
        server_events.events.borrow()[1],
        Event::Message {
            message_type: 42,
            payload: payload.clone()
        }
    );

    // Break the connection under the server.
    first.close();
    assert_eq!(first.send(data_message(1, b"")).unwrap_err().to_string(), "channel is closed");

    let broken = server_events.clone();
    assert!(run_until(TIMEOUT, move || broken.errors() == 1));
    assert!(!server.is_connected());
    assert!(first_events.errors() == 0);

    let second_events = Rc::new(Recorder::default());
    let second = IpcChannel::new(&path, ChannelOptions::client(), listener(&second_events)).unwrap();
    second.connect().unwrap();
    second.send(data_message(7, b"second")).unwrap();

    let (seen, second_seen) = (server_events.clone(), second_events.clone());
    assert!(run_until(TIMEOUT, move || {
        seen.messages() == 2 && second_seen.connections() == 1
    }));

    assert_eq!(server_events.connections(), 2);
    assert_eq!(
        server_events.events.borrow().last(),
        Some(&Event::Message {
            message_type: 7,
            payload: b"second".to_vec()
        })
    );
    assert!(server.is_connected());
}

#[test]
fn test_large_message_is_delivered_before_the_next_one() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ordered.ipc");

    let server_events = Rc::new(Recorder::default());
    let server = IpcChannel::new(&path, ChannelOptions::server(), listener(&server_events)).unwrap();
    server.connect().unwrap();

    let client_events = Rc::new(Recorder::default());
    let client = IpcChannel::new(&path, ChannelOptions::client(), listener(&client_events)).unwrap();
    client.connect().unwrap();

    let payload: Vec<u8> = (0..300 * 1024).map(|i| (i % 253) as u8).collect();
    client.send(data_message(42, &payload)).unwrap();
    client.send(data_message(43, b"small")).unwrap();
    // The hello is already on the wire; both messages wait behind it.
    assert_eq!(client.pending_message_count(), 2);

    let seen = server_events.clone();
    assert!(run_until(TIMEOUT, move || seen.messages() == 2));

    assert_eq!(
        *server_events.events.borrow(),
        vec![
            Event::Connected(own_pid()),
            Event::Message {
                message_type: 42,
                payload
            },
            Event::Message {
                message_type: 43,
                payload: b"small".to_vec()
            },
        ]
    );
    assert_eq!(client.pending_message_count(), 0);
    assert_eq!(server_events.errors(), 0);
}

#[test]
fn test_server_replies_after_hello() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reply.ipc");

    let server_events = Rc::new(Recorder::default());
    let server = IpcChannel::new(&path, ChannelOptions::server(), listener(&server_events)).unwrap();
    server.connect().unwrap();

    let client_events = Rc::new(Recorder::default());
    let client = IpcChannel::new(&path, ChannelOptions::client(), listener(&client_events)).unwrap();
    client.connect().unwrap();

    let connected = server_events.clone();
    assert!(run_until(TIMEOUT, move || connected.connections() == 1));

    let mut reply = IpcMessage::new(5, 99, Priority::High);
    reply.pickle_mut().write_data(b"pong");
    server.send(reply).unwrap();

    let received = client_events.clone();
    assert!(run_until(TIMEOUT, move || received.messages() == 1));
    assert_eq!(
        client_events.events.borrow()[1],
        Event::Message {
            message_type: 99,
            payload: b"pong".to_vec()
        }
    );
}

struct RawPeer {
    errors: RefCell<Vec<io::ErrorKind>>,
}

impl PipeClientDelegate for RawPeer {
    fn on_pipe_client_connect(&self, _result: io::Result<()>) {}

    fn on_pipe_client_read_data(&self, _data: &[u8]) {}

    fn on_pipe_client_write_data(&self, _bytes: usize) {}

    fn on_pipe_client_error(&self, error: io::Error) {
        self.errors.borrow_mut().push(error.kind());
    }
}

#[test]
fn test_first_frame_must_be_hello() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("violation.ipc");

    let server_events = Rc::new(Recorder::default());
    let server = IpcChannel::new(&path, ChannelOptions::server(), listener(&server_events)).unwrap();
    server.connect().unwrap();

    let peer = Rc::new(RawPeer {
        errors: RefCell::new(Vec::new()),
    });
    let raw = PipeClient::new(&path, Rc::downgrade(&peer) as Weak<dyn PipeClientDelegate>).unwrap();
    raw.connect().unwrap();
    raw.send(data_message(5, b"no hello").as_bytes()).unwrap();

    let (seen, dropped) = (server_events.clone(), peer.clone());
    assert!(run_until(TIMEOUT, move || {
        seen.errors() == 1 && !dropped.errors.borrow().is_empty()
    }));

    let expected = ChannelError::Protocol(ProtocolError::MissingHello { message_type: 5 });
    assert_eq!(
        *server_events.events.borrow(),
        vec![Event::Error(expected.to_string())]
    );
    assert!(!raw.is_connected());

    // The slot was replaced; a well-behaved client still gets through.
    let client_events = Rc::new(Recorder::default());
    let client = IpcChannel::new(&path, ChannelOptions::client(), listener(&client_events)).unwrap();
    client.connect().unwrap();

    let connected = server_events.clone();
    assert!(run_until(TIMEOUT, move || connected.connections() == 1));
}

#[test]
fn test_closed_channel_rejects_use() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let events = Rc::new(Recorder::default());
    let client = IpcChannel::new(
        dir.path().join("absent.ipc"),
        ChannelOptions::client(),
        listener(&events),
    )
    .unwrap();

    assert!(matches!(client.connect(), Err(ChannelError::Transport(_))));
    assert!(!client.is_connected());
    assert_eq!(events.errors(), 1);

    client.close();
    assert!(matches!(client.connect(), Err(ChannelError::Closed)));
    assert!(matches!(
        client.send(data_message(1, b"late")),
        Err(ChannelError::Closed)
    ));
    assert_eq!(events.events.borrow().len(), 1);
}

fn header(payload_size: u32, routing_id: i32, message_type: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(16);
    header.extend_from_slice(&payload_size.to_le_bytes());
    header.extend_from_slice(&routing_id.to_le_bytes());
    header.extend_from_slice(&message_type.to_le_bytes());
    header.extend_from_slice(&(Priority::Normal as u32).to_le_bytes());
    header
}

fn raw_peer(path: &std::path::Path) -> (Rc<RawPeer>, PipeClient) {
    let peer = Rc::new(RawPeer {
        errors: RefCell::new(Vec::new()),
    });
    let raw = PipeClient::new(path, Rc::downgrade(&peer) as Weak<dyn PipeClientDelegate>).unwrap();
    raw.connect().unwrap();
    (peer, raw)
}

#[test]
fn test_oversized_declared_payload_closes_channel() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("oversized.ipc");

    let server_events = Rc::new(Recorder::default());
    let server = IpcChannel::new(&path, ChannelOptions::server(), listener(&server_events)).unwrap();
    server.connect().unwrap();

    let (peer, raw) = raw_peer(&path);

    // A proper hello, then a header announcing more than any frame may hold.
    let mut bytes = IpcMessage::hello(4321).as_bytes().to_vec();
    bytes.extend(header(MAXIMUM_MESSAGE_SIZE as u32, MSG_ROUTING_CONTROL, 9));
    raw.send(&bytes).unwrap();

    let (seen, dropped) = (server_events.clone(), peer.clone());
    assert!(run_until(TIMEOUT, move || {
        seen.errors() == 1 && !dropped.errors.borrow().is_empty()
    }));

    let expected = ChannelError::Protocol(ProtocolError::PayloadTooLarge {
        declared: MAXIMUM_MESSAGE_SIZE + 16,
        limit: MAXIMUM_MESSAGE_SIZE,
    });
    assert_eq!(
        *server_events.events.borrow(),
        vec![Event::Connected(4321), Event::Error(expected.to_string())]
    );
    assert_eq!(server_events.messages(), 0);
    assert!(!server.is_connected());
    assert!(!raw.is_connected());
}

#[test]
fn test_hello_without_pid_is_rejected() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bare-hello.ipc");

    let server_events = Rc::new(Recorder::default());
    let server = IpcChannel::new(&path, ChannelOptions::server(), listener(&server_events)).unwrap();
    server.connect().unwrap();

    let (peer, raw) = raw_peer(&path);

    let mut bytes = header(0, MSG_ROUTING_NONE, HELLO_MESSAGE_TYPE);
    bytes.extend(data_message(3, b"after").as_bytes());
    raw.send(&bytes).unwrap();

    let (seen, dropped) = (server_events.clone(), peer.clone());
    assert!(run_until(TIMEOUT, move || {
        seen.errors() == 1 && !dropped.errors.borrow().is_empty()
    }));

    let expected = ChannelError::Protocol(ProtocolError::MalformedHello);
    assert_eq!(
        *server_events.events.borrow(),
        vec![Event::Error(expected.to_string())]
    );
    assert!(server.peer_pid().is_none());
    assert!(!raw.is_connected());
}
