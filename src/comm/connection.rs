//! Connection tasks.
//!
//! The dialer opens with `Hello`, carrying the origin it claims. The
//! acceptor hands that claim to the node loop and waits for the verdict;
//! only an admitted connection is answered with `Welcome` and starts
//! relaying messages. A refused connection is simply dropped, the remote
//! end learns nothing about why.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use super::frame::{read_frame, write_frame};
use super::{Admission, ConnectionId, Connector, Direction, Event, Link};
use crate::address::Address;
use crate::error::{Error, Result};
use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Handshake {
    Hello { origin: String },
    Welcome { origin: Address },
}

/// Accepts connections of one kind until the listener fails.
pub async fn listen(
    listener: TcpListener,
    link: Link,
    local: Address,
    events: mpsc::Sender<Event>,
) -> Result<()> {
    info!("Accepting {:?} connections on {}", link, listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let events = events.clone();
        let local = local.clone();
        tokio::spawn(async move {
            if let Err(e) = accept(stream, peer.ip().to_string(), link, local, events).await {
                warn!("{:?} connection from {} ended: {}", link, peer, e);
            }
        });
    }
}

/// Runs the accepting side of a connection.
pub async fn accept<S>(
    stream: S,
    ip: String,
    link: Link,
    local: Address,
    events: mpsc::Sender<Event>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let claimed = match read_frame(&mut reader).await? {
        Some(Handshake::Hello { origin }) => origin,
        Some(other) => return Err(Error::invalid(format!("expected hello, got {:?}", other))),
        None => return Ok(()),
    };

    let Some(admitted) = admit(&events, link, Direction::Inbound, claimed, ip).await? else {
        return Ok(());
    };
    if let Err(e) = write_frame(&mut writer, &Handshake::Welcome { origin: local }).await {
        let _ = events
            .send(Event::Closed {
                peer: admitted.peer,
                link,
                conn: admitted.conn,
            })
            .await;
        return Err(e);
    }
    relay(reader, writer, admitted, link, events).await
}

/// Dials `ip:port` and runs the connecting side.
pub async fn dial(
    ip: String,
    port: u16,
    link: Link,
    local: Address,
    expected: Address,
    events: mpsc::Sender<Event>,
) -> Result<()> {
    let stream = TcpStream::connect((ip.as_str(), port)).await?;
    connect(stream, ip, link, local, expected, events).await
}

/// Runs the connecting side over an established stream.
pub async fn connect<S>(
    stream: S,
    ip: String,
    link: Link,
    local: Address,
    expected: Address,
    events: mpsc::Sender<Event>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    write_frame(
        &mut writer,
        &Handshake::Hello {
            origin: local.to_string(),
        },
    )
    .await?;
    let origin = match read_frame(&mut reader).await? {
        Some(Handshake::Welcome { origin }) => origin,
        Some(other) => return Err(Error::invalid(format!("expected welcome, got {:?}", other))),
        None => return Err(Error::invalid(format!("{} refused the connection", expected))),
    };
    if origin != expected {
        return Err(Error::invalid(format!(
            "expected {} but {} answered",
            expected, origin
        )));
    }

    let Some(admitted) = admit(&events, link, Direction::Outbound, origin.to_string(), ip).await?
    else {
        return Ok(());
    };
    relay(reader, writer, admitted, link, events).await
}

/// A connection the node loop has taken in.
struct Admitted {
    peer: Address,
    conn: ConnectionId,
    outbound: mpsc::UnboundedReceiver<Message>,
}

async fn admit(
    events: &mpsc::Sender<Event>,
    link: Link,
    direction: Direction,
    claimed: String,
    ip: String,
) -> Result<Option<Admitted>> {
    let conn = ConnectionId::next();
    let (outbound, rx) = mpsc::unbounded_channel();
    let (reply, decision) = oneshot::channel();
    events
        .send(Event::Admit(Admission {
            conn,
            link,
            direction,
            claimed,
            ip,
            outbound,
            reply,
        }))
        .await
        .map_err(|_| Error::ConnectionClosed)?;
    let admitted = decision.await.map_err(|_| Error::ConnectionClosed)?;
    Ok(admitted.map(|peer| Admitted {
        peer,
        conn,
        outbound: rx,
    }))
}

/// Pumps messages in both directions until either side gives up. When the
/// node drops the outbound channel the writer flushes what is queued, shuts
/// the socket down and the reader stops with it.
async fn relay<R, W>(
    mut reader: R,
    mut writer: W,
    admitted: Admitted,
    link: Link,
    events: mpsc::Sender<Event>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Admitted {
        peer,
        conn,
        mut outbound,
    } = admitted;

    let writing = async {
        while let Some(msg) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &msg).await {
                warn!("Failed to write to {}: {}", peer, e);
                break;
            }
        }
        let _ = writer.shutdown().await;
        debug!("Writer to {} finished", peer);
    };

    let reading = async {
        loop {
            match read_frame::<_, Message>(&mut reader).await {
                Ok(Some(msg)) => {
                    let event = Event::Inbound {
                        from: peer.clone(),
                        conn,
                        msg,
                    };
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    };

    let result = tokio::select! {
        result = reading => result,
        _ = writing => Ok(()),
    };

    let _ = events.send(Event::Closed { peer, link, conn }).await;
    result
}

/// Dials over TCP and feeds the result into the node loop.
#[derive(Clone)]
pub struct TcpConnector {
    local: Address,
    events: mpsc::Sender<Event>,
}

impl TcpConnector {
    pub fn new(local: Address, events: mpsc::Sender<Event>) -> Self {
        Self { local, events }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, ip: &str, port: u16, link: Link, expected: Address) {
        let ip = ip.to_string();
        let local = self.local.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let target = format!("{}:{}", ip, port);
            if let Err(e) = dial(ip, port, link, local, expected, events).await {
                warn!("{:?} connection to {} ended: {}", link, target, e);
            }
        });
    }
}
