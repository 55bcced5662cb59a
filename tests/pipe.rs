mod common;

use common::{init_logging, run_until, run_until_idle};
use msgloop::net::{
    ClientKey, PipeClient, PipeClientDelegate, PipeServer, PipeServerDelegate, PipeServerOptions,
};
use msgloop::{LoopError, MessageLoop, PumpKind};
use std::cell::{Cell, RefCell};
use std::io;
use std::rc::{Rc, Weak};
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ServerEvents {
    accepted: RefCell<Vec<ClientKey>>,
    received: RefCell<Vec<u8>>,
    written: Cell<usize>,
    errors: RefCell<Vec<(ClientKey, io::ErrorKind)>>,
}

impl PipeServerDelegate for ServerEvents {
    fn on_pipe_server_accept(&self, key: ClientKey, result: io::Result<()>) {
        if result.is_ok() {
            self.accepted.borrow_mut().push(key);
        }
    }

    fn on_pipe_server_read_data(&self, _key: ClientKey, data: &[u8]) {
        self.received.borrow_mut().extend_from_slice(data);
    }

    fn on_pipe_server_write_data(&self, _key: ClientKey, bytes: usize) {
        self.written.set(self.written.get() + bytes);
    }

    fn on_pipe_server_error(&self, key: ClientKey, error: io::Error) {
        self.errors.borrow_mut().push((key, error.kind()));
    }
}

#[derive(Default)]
struct ClientEvents {
    connects: RefCell<Vec<bool>>,
    received: RefCell<Vec<u8>>,
    written: Cell<usize>,
    errors: RefCell<Vec<io::ErrorKind>>,
}

impl PipeClientDelegate for ClientEvents {
    fn on_pipe_client_connect(&self, result: io::Result<()>) {
        self.connects.borrow_mut().push(result.is_ok());
    }

    fn on_pipe_client_read_data(&self, data: &[u8]) {
        self.received.borrow_mut().extend_from_slice(data);
    }

    fn on_pipe_client_write_data(&self, bytes: usize) {
        self.written.set(self.written.get() + bytes);
    }

    fn on_pipe_client_error(&self, error: io::Error) {
        self.errors.borrow_mut().push(error.kind());
    }
}

fn server_delegate(events: &Rc<ServerEvents>) -> Weak<dyn PipeServerDelegate> {
    Rc::downgrade(events) as Weak<dyn PipeServerDelegate>
}

fn client_delegate(events: &Rc<ClientEvents>) -> Weak<dyn PipeClientDelegate> {
    Rc::downgrade(events) as Weak<dyn PipeClientDelegate>
}

#[test]
fn test_pipe_round_trip() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("round-trip.sock");

    let server_events = Rc::new(ServerEvents::default());
    let server = PipeServer::new(&path, server_delegate(&server_events), PipeServerOptions::default())
        .unwrap();
    server.start().unwrap();
    assert_eq!(server.instance_count(), 1);

    let client_events = Rc::new(ClientEvents::default());
    let client = PipeClient::new(&path, client_delegate(&client_events)).unwrap();
    client.connect().unwrap();
    assert!(client.is_connected());
    assert_eq!(*client_events.connects.borrow(), vec![true]);

    let accepted = server_events.clone();
    assert!(run_until(TIMEOUT, move || !accepted.accepted.borrow().is_empty()));
    let key = server_events.accepted.borrow()[0];
    assert!(server.is_connected(key));
    assert_eq!(server.client_count(), 1);

    client.send(b"ping").unwrap();
    let (received, written) = (server_events.clone(), client_events.clone());
    assert!(run_until(TIMEOUT, move || {
        received.received.borrow().len() == 4 && written.written.get() == 4
    }));
    assert_eq!(&*server_events.received.borrow(), b"ping");
    assert_eq!(client_events.written.get(), 4);

    server.send(key, b"pong").unwrap();
    let (replied, written) = (client_events.clone(), server_events.clone());
    assert!(run_until(TIMEOUT, move || {
        replied.received.borrow().len() == 4 && written.written.get() == 4
    }));
    assert_eq!(&*client_events.received.borrow(), b"pong");
    assert_eq!(server_events.written.get(), 4);
}

#[test]
fn test_writes_larger_than_the_buffer_are_rejected() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("oversized.sock");

    let server_events = Rc::new(ServerEvents::default());
    let server = PipeServer::new(&path, server_delegate(&server_events), PipeServerOptions::default())
        .unwrap();
    server.start().unwrap();

    let client_events = Rc::new(ClientEvents::default());
    let client = PipeClient::new(&path, client_delegate(&client_events)).unwrap();
    assert_eq!(
        client.send(b"early").unwrap_err().kind(),
        io::ErrorKind::NotConnected
    );

    client.connect().unwrap();
    let oversized = vec![0u8; msgloop::net::IO_BUFFER_SIZE + 1];
    assert_eq!(
        client.send(&oversized).unwrap_err().kind(),
        io::ErrorKind::InvalidInput
    );
}

#[test]
fn test_server_replaces_a_broken_slot() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replenish.sock");

    let server_events = Rc::new(ServerEvents::default());
    let server = PipeServer::new(&path, server_delegate(&server_events), PipeServerOptions::default())
        .unwrap();
    server.start().unwrap();

    let first_events = Rc::new(ClientEvents::default());
    let first = PipeClient::new(&path, client_delegate(&first_events)).unwrap();
    first.connect().unwrap();

    let accepted = server_events.clone();
    assert!(run_until(TIMEOUT, move || accepted.accepted.borrow().len() == 1));
    let first_key = server_events.accepted.borrow()[0];

    first.close();
    assert!(!first.is_connected());

    let errored = server_events.clone();
    assert!(run_until(TIMEOUT, move || !errored.errors.borrow().is_empty()));
    assert_eq!(server_events.errors.borrow()[0].0, first_key);
    assert_eq!(server.instance_count(), 1);
    assert_eq!(server.client_count(), 0);

    let second_events = Rc::new(ClientEvents::default());
    let second = PipeClient::new(&path, client_delegate(&second_events)).unwrap();
    second.connect().unwrap();

    let accepted = server_events.clone();
    assert!(run_until(TIMEOUT, move || accepted.accepted.borrow().len() == 2));
    let second_key = server_events.accepted.borrow()[1];
    assert_ne!(first_key, second_key);
    assert!(server.is_connected(second_key));
}

#[test]
fn test_server_without_supplement_leaves_the_slot_empty() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no-supplement.sock");

    let server_events = Rc::new(ServerEvents::default());
    let options = PipeServerOptions {
        max_instances: 2,
        auto_supplement: false,
    };
    let server = PipeServer::new(&path, server_delegate(&server_events), options).unwrap();
    server.start().unwrap();
    assert_eq!(server.instance_count(), 2);

    let client_events = Rc::new(ClientEvents::default());
    let client = PipeClient::new(&path, client_delegate(&client_events)).unwrap();
    client.connect().unwrap();

    let accepted = server_events.clone();
    assert!(run_until(TIMEOUT, move || accepted.accepted.borrow().len() == 1));

    let key = server_events.accepted.borrow()[0];
    server.close_client(key);
    assert!(!server.is_connected(key));
    assert_eq!(server.instance_count(), 1);

    let errored = client_events.clone();
    assert!(run_until(TIMEOUT, move || !errored.errors.borrow().is_empty()));
    assert!(!client.is_connected());
    assert!(server_events.errors.borrow().is_empty());
}

#[test]
fn test_close_with_a_write_in_flight() {
    init_logging();
    let message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("close.sock");

    let server_events = Rc::new(ServerEvents::default());
    let server = PipeServer::new(&path, server_delegate(&server_events), PipeServerOptions::default())
        .unwrap();
    server.start().unwrap();

    let client_events = Rc::new(ClientEvents::default());
    let client = PipeClient::new(&path, client_delegate(&client_events)).unwrap();
    client.connect().unwrap();

    client.send(&[7u8; 4096]).unwrap();
    assert!(client.has_pending_io());

    client.close();
    assert!(!client.has_pending_io());
    assert!(!client.is_connected());

    run_until_idle();
    assert_eq!(client_events.written.get(), 0);
    assert!(client_events.errors.borrow().is_empty());
    assert!(client_events.received.borrow().is_empty());

    drop(client);
    drop(server);
    assert_eq!(message_loop.io_pump().unwrap().pending_operation_count(), 0);
}

thread_local! {
    static ACTIVE_CLIENT: RefCell<Option<PipeClient>> = const { RefCell::new(None) };
    static CLOSE_RETURNED: Cell<bool> = const { Cell::new(false) };
}

// Counts callbacks, and separately those that arrive after `close` returned.
#[derive(Default)]
struct LateEvents {
    callbacks: Cell<usize>,
    late: Cell<usize>,
}

impl LateEvents {
    fn record(&self) {
        self.callbacks.set(self.callbacks.get() + 1);
        if CLOSE_RETURNED.with(Cell::get) {
            self.late.set(self.late.get() + 1);
        }
    }
}

impl PipeClientDelegate for LateEvents {
    fn on_pipe_client_connect(&self, _result: io::Result<()>) {
        self.record();
    }

    fn on_pipe_client_read_data(&self, _data: &[u8]) {
        self.record();
    }

    fn on_pipe_client_write_data(&self, _bytes: usize) {
        self.record();
    }

    fn on_pipe_client_error(&self, _error: io::Error) {
        self.record();
    }
}

fn write_to_active_client() {
    ACTIVE_CLIENT.with(|active| {
        if let Some(client) = active.borrow().as_ref() {
            // A write still in flight rejects this one; that is fine here.
            let _ = client.send(&[3u8; 1024]);
        }
    });
}

fn close_active_client() {
    let Some(client) = ACTIVE_CLIENT.with(|active| active.borrow_mut().take()) else {
        return;
    };

    client.close();
    CLOSE_RETURNED.with(|returned| returned.set(true));
    assert!(!client.has_pending_io());
    assert!(!client.is_connected());
}

#[test]
fn test_close_under_concurrent_posted_writes() {
    const ITERATIONS: usize = 100;
    const WRITES: usize = 8;

    init_logging();
    let message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stress.sock");

    let server_events = Rc::new(ServerEvents::default());
    let server = PipeServer::new(&path, server_delegate(&server_events), PipeServerOptions::default())
        .unwrap();
    server.start().unwrap();

    let mut callbacks = 0;
    for _ in 0..ITERATIONS {
        CLOSE_RETURNED.with(|returned| returned.set(false));

        let events = Rc::new(LateEvents::default());
        let client = PipeClient::new(&path, Rc::downgrade(&events) as Weak<dyn PipeClientDelegate>)
            .unwrap();
        client.connect().unwrap();
        ACTIVE_CLIENT.with(|active| *active.borrow_mut() = Some(client));

        let handle = message_loop.handle();
        let writer = thread::spawn(move || {
            for _ in 0..WRITES {
                handle.post_task(write_to_active_client);
            }
        });

        for _ in 0..WRITES {
            message_loop.post_task(write_to_active_client);
        }
        message_loop.post_task(close_active_client);

        writer.join().unwrap();
        run_until_idle();

        assert!(CLOSE_RETURNED.with(Cell::get));
        assert_eq!(events.late.get(), 0);
        callbacks += events.callbacks.get();
    }

    // At least the connect notifications arrived.
    assert!(callbacks >= ITERATIONS);

    drop(server);
    run_until_idle();
    assert_eq!(message_loop.io_pump().unwrap().pending_operation_count(), 0);
}

#[test]
fn test_connect_to_a_missing_endpoint_fails() {
    init_logging();
    let _message_loop = MessageLoop::new(PumpKind::Io).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let events = Rc::new(ClientEvents::default());
    let client = PipeClient::new(dir.path().join("nobody.sock"), client_delegate(&events)).unwrap();

    assert!(client.connect().is_err());
    assert!(!client.is_connected());
    assert_eq!(*events.connects.borrow(), vec![false]);
}

#[test]
fn test_transport_requires_an_io_loop() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wrong.sock");
    let events = Rc::new(ServerEvents::default());

    assert!(matches!(
        PipeServer::new(&path, server_delegate(&events), PipeServerOptions::default()),
        Err(LoopError::NoCurrentLoop)
    ));

    let _message_loop = MessageLoop::new(PumpKind::Default).unwrap();
    assert!(matches!(
        PipeServer::new(&path, server_delegate(&events), PipeServerOptions::default()),
        Err(LoopError::WrongPumpKind {
            expected: PumpKind::Io,
            actual: PumpKind::Default
        })
    ));
}
