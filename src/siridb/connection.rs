/// One TCP connection to one SiriDB server
///
/// Requests are multiplexed over the connection and matched to their
/// responses by packet id. A reader task owns the read half; when it ends,
/// every pending request fails with `ConnectionLost`.
use bytes::BytesMut;
use fnv::FnvHashMap;
use serde_json::{json, Value};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::core::address::ServerAddress;
use crate::core::backend::{BackendError, Credentials};
use crate::siridb::protocol::{request, response, Packet};

/// Timeout for the TCP connect and for the authentication round trip
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(60);
const READ_BUFFER_SIZE: usize = 8192;

type Pending = Arc<Mutex<FnvHashMap<u16, oneshot::Sender<Packet>>>>;

pub struct ServerConnection {
    address: ServerAddress,
    connected: AtomicBool,
    next_pid: AtomicU16,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    pending: Pending,
}

impl ServerConnection {
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            connected: AtomicBool::new(false),
            next_pid: AtomicU16::new(0),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            pending: Arc::new(Mutex::new(FnvHashMap::default())),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Connected and authenticated
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Open the socket and authenticate with `credentials` on `database`
    pub async fn open(&self, credentials: &Credentials, database: &str) -> Result<(), BackendError> {
        self.close().await;

        let host = self.address.connect_host().to_string();
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), self.address.port()))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(BackendError::Io(e.to_string())),
            Err(_) => return Err(BackendError::Timeout(CONNECT_TIMEOUT)),
        };
        configure_stream(&stream).map_err(|e| BackendError::Io(e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        let reader = tokio::spawn(read_packets(
            read_half,
            Arc::clone(&self.pending),
            self.address.to_string(),
        ));
        *lock(&self.reader) = Some(reader);

        let auth = json!([credentials.user, credentials.password, database]);
        let packet = self.request(request::AUTH, &auth, CONNECT_TIMEOUT).await?;
        match packet.tp {
            response::AUTH_SUCCESS => {
                self.connected.store(true, Ordering::SeqCst);
                debug!("Authenticated on {} as '{}'", self.address, credentials.user);
                Ok(())
            }
            _ => {
                let err = packet.into_result().err().unwrap_or_else(|| {
                    BackendError::Protocol("unexpected response to authentication".to_string())
                });
                self.close().await;
                Err(err)
            }
        }
    }

    /// Whether the reader task has stopped since the last `open`
    pub fn reader_finished(&self) -> bool {
        lock(&self.reader).as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Mark the connection as lost if the reader has stopped
    pub fn refresh(&self) {
        if self.is_connected() && self.reader_finished() {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Send one packet and wait for the response with the same packet id
    pub async fn request(&self, tp: u8, body: &Value, wait: Duration) -> Result<Packet, BackendError> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(pid, tx);

        let mut buf = BytesMut::new();
        Packet::with_value(pid, tp, body).encode_into(&mut buf);

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(w) => w.write_all(&buf).await.map_err(|e| BackendError::Io(e.to_string())),
                None => Err(BackendError::NotConnected),
            }
        };
        if let Err(e) = written {
            lock(&self.pending).remove(&pid);
            self.connected.store(false, Ordering::SeqCst);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(BackendError::ConnectionLost)
            }
            Err(_) => {
                lock(&self.pending).remove(&pid);
                Err(BackendError::Timeout(wait))
            }
        }
    }

    /// Keep-alive probe on an established connection
    pub async fn ping(&self, wait: Duration) -> Result<(), BackendError> {
        self.request(request::PING, &Value::Null, wait)
            .await?
            .into_result()
            .map(|_| ())
    }

    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        lock(&self.pending).clear();
    }
}

async fn read_packets(mut read_half: OwnedReadHalf, pending: Pending, server: String) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let reason = loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => break "connection closed by server".to_string(),
            Ok(_) => {}
            Err(e) => break e.to_string(),
        }

        loop {
            match Packet::parse(&mut buf) {
                Ok(Some(packet)) => match lock(&pending).remove(&packet.pid) {
                    Some(tx) => {
                        let _ = tx.send(packet);
                    }
                    None => debug!("Dropping response for unknown pid {} from {}", packet.pid, server),
                },
                Ok(None) => break,
                Err(e) => {
                    lock(&pending).clear();
                    debug!("Closing connection to {}: {}", server, e);
                    return;
                }
            }
        }
    };

    debug!("Connection to {} ended: {}", server, reason);
    lock(&pending).clear();
}

/// TCP_NODELAY plus keep-alive probes on backend sockets
fn configure_stream(stream: &TcpStream) -> Result<(), io::Error> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_TIME);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
