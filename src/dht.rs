//! High level blocking API over a background actor thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use tracing::info;

use crate::common::{Contact, Id, ValueTuple};
use crate::config::Config;
use crate::rpc::{LookupResult, Rpc, StoreError, StoreResult};
use crate::transport::{Transport, TransportError, UdpTransport};
use crate::{Error, Result};

#[derive(Debug, Clone)]
/// A DHT node running on its own thread.
///
/// Cheap to clone; every clone talks to the same node. The node shuts down
/// when the last clone is dropped or [Dht::shutdown] is called.
pub struct Dht {
    sender: flume::Sender<ActorMessage>,
    handle: Option<Arc<JoinHandle<()>>>,
}

#[derive(Debug)]
enum ActorMessage {
    Shutdown(flume::Sender<()>),
    Info(flume::Sender<(Id, SocketAddr)>),
    Ping(SocketAddr, flume::Sender<Contact>),
    FindNode(Id, flume::Sender<LookupResult>),
    Get(Id, flume::Sender<LookupResult>),
    Put(
        Id,
        Bytes,
        flume::Sender<std::result::Result<StoreResult, StoreError>>,
    ),
    Values(flume::Sender<Vec<ValueTuple>>),
}

impl Dht {
    /// Start a node over UDP with the given configuration.
    pub fn new(config: Config) -> Result<Dht> {
        let transport = UdpTransport::bind(config.port)?;

        Dht::with_transport(config, Box::new(transport))
    }

    /// Start a node over a custom [Transport].
    pub fn with_transport(config: Config, transport: Box<dyn Transport>) -> Result<Dht> {
        let rpc = Rpc::new(config, transport)?;
        let (sender, receiver) = flume::unbounded();

        let handle = std::thread::Builder::new()
            .name("kadex".into())
            .spawn(move || run(rpc, receiver))?;

        Ok(Dht {
            sender,
            handle: Some(Arc::new(handle)),
        })
    }

    // === Getters ===

    /// This node's identifier.
    pub fn id(&self) -> Result<Id> {
        self.info().map(|(id, _)| id)
    }

    /// The address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.info().map(|(_, address)| address)
    }

    // === Public Methods ===

    /// Ping a node and return its contact once the pong arrives.
    pub fn ping(&self, address: SocketAddr) -> Result<Contact> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Ping(address, sender))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::NoResponse)
    }

    /// Iterative lookup for the closest nodes to `target`.
    pub fn find_node(&self, target: Id) -> Result<Vec<Contact>> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::FindNode(target, sender))
            .map_err(|_| Error::Shutdown)?;

        let result = receiver.recv().map_err(|_| Error::Shutdown)?;

        Ok(result.closest)
    }

    /// Iterative lookup for the value stored under `key`.
    pub fn get(&self, key: Id) -> Result<Option<ValueTuple>> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Get(key, sender))
            .map_err(|_| Error::Shutdown)?;

        let result = receiver.recv().map_err(|_| Error::Shutdown)?;

        Ok(result.value)
    }

    /// Store `value` under `key` at the closest nodes to `key`.
    ///
    /// Succeeds once at least one node acknowledges the value.
    pub fn put(&self, key: Id, value: Bytes) -> Result<StoreResult> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Put(key, value, sender))
            .map_err(|_| Error::Shutdown)?;

        Ok(receiver.recv().map_err(|_| Error::Shutdown)??)
    }

    /// Delete the value under `key` by storing a tombstone.
    pub fn delete(&self, key: Id) -> Result<StoreResult> {
        self.put(key, Bytes::new())
    }

    /// All values in this node's local database.
    pub fn values(&self) -> Result<Vec<ValueTuple>> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Values(sender))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)
    }

    /// Stop the actor thread and wait for it to exit.
    pub fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded(1);

        if self.sender.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv();
        }

        if let Some(handle) = self.handle.take() {
            if let Ok(handle) = Arc::try_unwrap(handle) {
                let _ = handle.join();
            }
        }
    }

    // === Private Methods ===

    fn info(&self) -> Result<(Id, SocketAddr)> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Info(sender))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)
    }
}

fn run(mut rpc: Rpc, receiver: flume::Receiver<ActorMessage>) {
    loop {
        match receiver.try_recv() {
            Ok(ActorMessage::Shutdown(sender)) => {
                info!(id = ?rpc.local().id(), "Shutting down");
                let _ = sender.send(());
                break;
            }
            Ok(ActorMessage::Info(sender)) => {
                let _ = sender.send((*rpc.local().id(), rpc.local_addr()));
            }
            Ok(ActorMessage::Ping(address, sender)) => rpc.ping(address, sender),
            Ok(ActorMessage::FindNode(target, sender)) => rpc.find_node(target, sender),
            Ok(ActorMessage::Get(key, sender)) => rpc.get(key, sender),
            Ok(ActorMessage::Put(key, value, sender)) => rpc.put(key, value, sender),
            Ok(ActorMessage::Values(sender)) => {
                let _ = sender.send(rpc.values());
            }
            Err(flume::TryRecvError::Empty) => {}
            Err(flume::TryRecvError::Disconnected) => break,
        }

        rpc.tick();
    }
}

// === Testnet ===

type Registry = Arc<Mutex<HashMap<SocketAddr, flume::Sender<(Vec<u8>, SocketAddr)>>>>;

/// How long [ChannelTransport::recv] waits for a datagram.
const CHANNEL_READ_TIMEOUT: Duration = Duration::from_millis(5);

#[derive(Debug)]
/// In-memory [Transport] connecting the nodes of a [Testnet]; lossless and
/// ordered, unlike UDP.
pub struct ChannelTransport {
    address: SocketAddr,
    incoming: flume::Receiver<(Vec<u8>, SocketAddr)>,
    registry: Registry,
}

impl ChannelTransport {
    fn new(registry: Registry, address: SocketAddr) -> ChannelTransport {
        let (sender, incoming) = flume::unbounded();

        if let Ok(mut map) = registry.lock() {
            map.insert(address, sender);
        }

        ChannelTransport {
            address,
            incoming,
            registry,
        }
    }
}

impl Transport for ChannelTransport {
    fn local_addr(&self) -> SocketAddr {
        self.address
    }

    fn send(&mut self, to: SocketAddr, bytes: &[u8]) -> std::result::Result<(), TransportError> {
        let map = self.registry.lock().map_err(|_| TransportError::Closed)?;

        // Unknown destinations drop the packet, like the real network.
        if let Some(sender) = map.get(&to) {
            let _ = sender.send((bytes.to_vec(), self.address));
        }

        Ok(())
    }

    fn recv(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
        self.incoming.recv_timeout(CHANNEL_READ_TIMEOUT).ok()
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        if let Ok(mut map) = self.registry.lock() {
            map.remove(&self.address);
        }
    }
}

#[derive(Debug)]
/// A simulated network of nodes over in-memory channels; every node after
/// the first bootstraps from the first.
pub struct Testnet {
    registry: Registry,
    next_port: u16,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet> {
        let mut testnet = Testnet {
            registry: Registry::default(),
            next_port: 1,
            nodes: Vec::with_capacity(count),
        };

        for _ in 0..count {
            testnet.add_node()?;
        }

        Ok(testnet)
    }

    /// Start one more node, bootstrapped from the first.
    pub fn add_node(&mut self) -> Result<Dht> {
        let address = SocketAddr::from(([127, 0, 0, 1], self.next_port));
        self.next_port += 1;

        let bootstrap = match self.nodes.first() {
            Some(first) => vec![first.local_addr()?.to_string()],
            None => Vec::new(),
        };

        let config = Config {
            // Short deadlines; the simulated network has no real latency.
            request_timeout: Duration::from_millis(200),
            lookup_timeout: Duration::from_secs(2),
            store_timeout: Duration::from_secs(2),
            bootstrap,
            ..Default::default()
        };

        let transport = ChannelTransport::new(self.registry.clone(), address);
        let node = Dht::with_transport(config, Box::new(transport))?;

        self.nodes.push(node.clone());

        Ok(node)
    }
}
