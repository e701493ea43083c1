//! Scripted MQTT 3.1.1 broker on a loopback port.
//!
//! Understands just enough of the protocol to accept a session, acknowledge
//! publishes and keep-alives, and record what the client sent. It can be
//! taken down (open links are cut and new ones refused) and brought back.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How the broker treats connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Up,
    /// Links are cut and new connections closed at once.
    Down,
    /// Connections are accepted but CONNECT is never answered.
    Silent,
}

/// A CONNECT packet as received.
#[derive(Debug, Clone, PartialEq)]
pub struct Connected {
    pub client_id: String,
    pub clean_session: bool,
    pub will_topic: Option<String>,
    pub will_payload: Option<Vec<u8>>,
    pub will_retain: bool,
}

/// A PUBLISH packet as received.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl Published {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

#[derive(Debug, Default)]
struct Record {
    connects: Vec<Connected>,
    published: Vec<Published>,
    disconnects: usize,
}

pub struct FakeBroker {
    addr: SocketAddr,
    mode: watch::Sender<Mode>,
    record: Arc<Mutex<Record>>,
    acceptor: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (mode, _) = watch::channel(Mode::Up);
        let record = Arc::new(Mutex::new(Record::default()));

        let acceptor = tokio::spawn(accept(listener, mode.subscribe(), record.clone()));
        Self {
            addr,
            mode,
            record,
            acceptor,
        }
    }

    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn set_mode(&self, mode: Mode) {
        self.mode.send_replace(mode);
    }

    pub fn connects(&self) -> Vec<Connected> {
        self.record.lock().unwrap().connects.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.record.lock().unwrap().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }

    pub fn disconnects(&self) -> usize {
        self.record.lock().unwrap().disconnects
    }

    /// Poll `condition` until it holds or `within` elapses.
    pub async fn wait_until(&self, within: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition(self)
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.mode.send_replace(Mode::Down);
    }
}

async fn accept(listener: TcpListener, mode: watch::Receiver<Mode>, record: Arc<Mutex<Record>>) {
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            continue;
        };
        if *mode.borrow() == Mode::Down {
            drop(socket);
            continue;
        }
        tokio::spawn(serve(socket, mode.clone(), record.clone()));
    }
}

/// Resolve once the broker is taken down.
async fn taken_down(mode: &mut watch::Receiver<Mode>) {
    loop {
        if *mode.borrow_and_update() == Mode::Down {
            return;
        }
        if mode.changed().await.is_err() {
            return;
        }
    }
}

async fn serve(mut socket: TcpStream, mut mode: watch::Receiver<Mode>, record: Arc<Mutex<Record>>) {
    loop {
        let packet = tokio::select! {
            packet = read_packet(&mut socket) => packet,
            _ = taken_down(&mut mode) => return,
        };
        let Ok((header, body)) = packet else {
            return;
        };

        let reply = match header >> 4 {
            1 => {
                let Some(connected) = parse_connect(&body) else {
                    return;
                };
                record.lock().unwrap().connects.push(connected);
                if *mode.borrow() == Mode::Silent {
                    continue;
                }
                vec![0x20, 0x02, 0x00, 0x00]
            }
            3 => {
                let Some((published, pkid)) = parse_publish(header, &body) else {
                    return;
                };
                let qos = published.qos;
                record.lock().unwrap().published.push(published);
                match (qos, pkid) {
                    (1, Some(id)) => ack(0x40, id),
                    (2, Some(id)) => ack(0x50, id),
                    _ => continue,
                }
            }
            // PUBREL
            6 if body.len() >= 2 => ack(0x70, u16::from_be_bytes([body[0], body[1]])),
            // PINGREQ
            12 => vec![0xD0, 0x00],
            14 => {
                record.lock().unwrap().disconnects += 1;
                return;
            }
            _ => continue,
        };

        if socket.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn ack(kind: u8, pkid: u16) -> Vec<u8> {
    let [hi, lo] = pkid.to_be_bytes();
    vec![kind, 0x02, hi, lo]
}

async fn read_packet(socket: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let header = socket.read_u8().await?;
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let byte = socket.read_u8().await?;
        length |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad remaining length"));
        }
    }
    let mut body = vec![0; length];
    socket.read_exact(&mut body).await?;
    Ok((header, body))
}

/// Cursor over a packet body.
struct Fields<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn bytes(&mut self) -> Option<Vec<u8>> {
        let len = usize::from(self.u16()?);
        let bytes = self.bytes.get(self.pos..self.pos + len)?.to_vec();
        self.pos += len;
        Some(bytes)
    }

    fn string(&mut self) -> Option<String> {
        String::from_utf8(self.bytes()?).ok()
    }

    fn rest(self) -> Vec<u8> {
        self.bytes[self.pos..].to_vec()
    }
}

fn parse_connect(body: &[u8]) -> Option<Connected> {
    let mut fields = Fields::new(body);
    let _protocol = fields.string()?;
    let _level = fields.u8()?;
    let flags = fields.u8()?;
    let _keep_alive = fields.u16()?;
    let client_id = fields.string()?;

    let (will_topic, will_payload) = if flags & 0x04 != 0 {
        (Some(fields.string()?), Some(fields.bytes()?))
    } else {
        (None, None)
    };
    Some(Connected {
        client_id,
        clean_session: flags & 0x02 != 0,
        will_topic,
        will_payload,
        will_retain: flags & 0x20 != 0,
    })
}

fn parse_publish(header: u8, body: &[u8]) -> Option<(Published, Option<u16>)> {
    let qos = (header >> 1) & 0x03;
    let mut fields = Fields::new(body);
    let topic = fields.string()?;
    let pkid = if qos > 0 { Some(fields.u16()?) } else { None };
    Some((
        Published {
            topic,
            payload: fields.rest(),
            qos,
            retain: header & 0x01 != 0,
        },
        pkid,
    ))
}
