use std::{net::SocketAddr, time::Duration};

use arkdrop_entities::{DropId, PeerId};
use arkdropx_common::{DropMessage, read_frame, write_frame};
use tokio::{
    net::{
        TcpListener, TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::AbortHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use super::{DataReceiver, DataSender, Demux, InboundMessage, LinkTable, Transport};
use crate::error::TransportError;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes announce themselves with an empty peer id; they get a `Hello`
/// back and are never registered as a link.
const PROBE_PEER_ID: &str = "";

/// Transport over plain TCP connections.
///
/// Every connection starts with both ends sending a `Hello` frame; after
/// that it is one ordered link to the peer that dialed or was dialed. The
/// connection is shared by control messages and data frames in both
/// directions.
pub struct TcpTransport {
    peer_id: PeerId,
    display_name: String,
    local_addr: SocketAddr,
    demux: Demux,
    links: LinkTable,
    capacity: usize,
    accept_task: AbortHandle,
}

impl TcpTransport {
    pub async fn bind(
        peer_id: PeerId,
        display_name: impl Into<String>,
        addr: impl ToSocketAddrs,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), TransportError> {
        let display_name = display_name.into();
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (demux, inbound) = Demux::new(capacity);
        let links = LinkTable::default();

        let acceptor = Acceptor {
            hello: DropMessage::Hello {
                peer_id: peer_id.clone(),
                display_name: display_name.clone(),
            },
            demux: demux.clone(),
            links: links.clone(),
            capacity,
        };
        let accept_task = tokio::spawn(acceptor.run(listener)).abort_handle();
        info!(peer = %peer_id, %local_addr, "listening");

        let transport = Self {
            peer_id,
            display_name,
            local_addr,
            demux,
            links,
            capacity,
            accept_task,
        };
        return Ok((transport, inbound));
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn link(
        &self,
        peer: &PeerId,
        addresses: &[String],
    ) -> Result<mpsc::Sender<DropMessage>, TransportError> {
        if let Some(link) = self.links.get(peer) {
            return Ok(link);
        }

        let mut last_error =
            TransportError::Unreachable(format!("{peer} has no known address"));
        for address in addresses {
            match self.dial(peer, address).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    debug!(peer = %peer, %address, "dial failed: {e}");
                    last_error = e;
                }
            }
        }
        return Err(last_error);
    }

    async fn dial(
        &self,
        peer: &PeerId,
        address: &str,
    ) -> Result<mpsc::Sender<DropMessage>, TransportError> {
        let stream = timeout(HELLO_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Unreachable(address.to_string()))?
            .map_err(|e| TransportError::Unreachable(format!("{address}: {e}")))?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let hello = DropMessage::Hello {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
        };
        write_frame(&mut writer, &hello).await?;
        let (remote, _) = read_hello(&mut reader).await?;
        if &remote != peer {
            return Err(TransportError::Unreachable(format!(
                "{address} belongs to {remote}, not {peer}"
            )));
        }

        let link = spawn_connection(
            remote,
            reader,
            writer,
            self.demux.clone(),
            self.links.clone(),
            self.capacity,
        );
        self.links.insert(peer.clone(), link.clone());
        debug!(peer = %peer, %address, "connected");
        return Ok(link);
    }
}

impl Transport for TcpTransport {
    fn local_peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    async fn send(
        &self,
        peer: &PeerId,
        addresses: &[String],
        message: DropMessage,
    ) -> Result<(), TransportError> {
        let link = self.link(peer, addresses).await?;
        if link.send(message).await.is_err() {
            self.links.remove(peer, &link);
            return Err(TransportError::Closed);
        }
        return Ok(());
    }

    async fn open_data_channel(
        &self,
        peer: &PeerId,
        addresses: &[String],
        id: DropId,
    ) -> Result<DataSender, TransportError> {
        let link = self.link(peer, addresses).await?;
        return Ok(DataSender::new(id, link));
    }

    fn accept_data_channel(
        &self,
        peer: &PeerId,
        id: DropId,
    ) -> Result<DataReceiver, TransportError> {
        self.demux.register(peer, id)
    }

    fn close_data_channel(&self, peer: &PeerId, id: DropId) {
        self.demux.unregister(peer, id);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.links.clear();
    }
}

/// Connects to `addr` and returns the identity the node there announces.
pub async fn probe(addr: &str) -> Result<(PeerId, String), TransportError> {
    let stream = timeout(HELLO_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Unreachable(addr.to_string()))?
        .map_err(|e| TransportError::Unreachable(format!("{addr}: {e}")))?;
    let (mut reader, mut writer) = stream.into_split();
    let hello = DropMessage::Hello {
        peer_id: PeerId::from(PROBE_PEER_ID),
        display_name: String::new(),
    };
    write_frame(&mut writer, &hello).await?;
    return read_hello(&mut reader).await;
}

struct Acceptor {
    hello: DropMessage,
    demux: Demux,
    links: LinkTable,
    capacity: usize,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            let hello = self.hello.clone();
            let demux = self.demux.clone();
            let links = self.links.clone();
            let capacity = self.capacity;
            tokio::spawn(async move {
                if let Err(e) =
                    handle_incoming(stream, hello, demux, links, capacity).await
                {
                    debug!(%remote_addr, "incoming connection dropped: {e}");
                }
            });
        }
    }
}

async fn handle_incoming(
    stream: TcpStream,
    hello: DropMessage,
    demux: Demux,
    links: LinkTable,
    capacity: usize,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (remote, remote_name) = read_hello(&mut reader).await?;
    write_frame(&mut writer, &hello).await?;
    if remote.as_str() == PROBE_PEER_ID {
        return Ok(());
    }

    debug!(peer = %remote, name = %remote_name, "peer connected");
    let link =
        spawn_connection(remote.clone(), reader, writer, demux, links.clone(), capacity);
    links.insert_if_absent(remote, link);
    return Ok(());
}

async fn read_hello(
    reader: &mut OwnedReadHalf,
) -> Result<(PeerId, String), TransportError> {
    let frame = timeout(HELLO_TIMEOUT, read_frame(reader))
        .await
        .map_err(|_| TransportError::Timeout)??;
    match frame {
        Some(DropMessage::Hello {
            peer_id,
            display_name,
        }) => Ok((peer_id, display_name)),
        Some(other) => Err(TransportError::Frame(format!(
            "expected Hello, got {}",
            other.kind()
        ))),
        None => Err(TransportError::Closed),
    }
}

/// Starts the reader and writer tasks of an established connection and
/// returns the link feeding the writer.
fn spawn_connection(
    peer: PeerId,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    demux: Demux,
    links: LinkTable,
    capacity: usize,
) -> mpsc::Sender<DropMessage> {
    let (tx, mut rx) = mpsc::channel::<DropMessage>(capacity);

    let weak = tx.downgrade();
    let writer_links = links.clone();
    let writer_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                warn!(peer = %writer_peer, "write failed: {e}");
                break;
            }
        }
        if let Some(link) = weak.upgrade() {
            writer_links.remove(&writer_peer, &link);
        }
    });

    let weak = tx.downgrade();
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(message)) => {
                    if !demux.dispatch(peer.clone(), message).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(peer = %peer, "connection closed");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer, "read failed: {e}");
                    break;
                }
            }
        }
        if let Some(link) = weak.upgrade() {
            links.remove(&peer, &link);
        }
    });

    tx
}
