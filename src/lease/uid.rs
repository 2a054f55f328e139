//! Uid bootstrap protocol.
//!
//! A node without an address connects to the master's uid port, asks for a
//! uid, and acknowledges it once received. The final `Confirmed` frame is
//! only written once the lease is confirmed in the table, so the requester
//! can dial the master right after [`fetch`] returns:
//!
//! ```text
//! requester                master
//!     | --- Request ------->  |   lease issued (pending)
//!     | <-- Assigned{uid} --- |
//!     | --- Confirm{uid} -->  |   lease confirmed
//!     | <-- Confirmed ------- |
//! ```

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::address::Uid;
use crate::comm::frame::{read_frame, write_frame};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UidFrame {
    Request,
    Assigned { uid: Uid },
    Confirm { uid: Uid },
    Confirmed,
}

/// Requests sent from the uid server to the node loop owning the lease
/// table.
#[derive(Debug)]
pub enum LeaseCommand {
    Issue { reply: oneshot::Sender<Uid> },
    Confirm {
        uid: Uid,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Accepts uid requests until the listener fails.
pub async fn listen(listener: TcpListener, leases: mpsc::Sender<LeaseCommand>) -> Result<()> {
    info!("Uid server listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let leases = leases.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, leases).await {
                error!("Uid request from {} failed: {}", peer, e);
            }
        });
    }
}

/// Serves a single uid request on `stream`.
pub async fn serve<S>(stream: S, leases: mpsc::Sender<LeaseCommand>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    match read_frame(&mut reader).await? {
        Some(UidFrame::Request) => {}
        Some(other) => return Err(Error::invalid(format!("expected uid request, got {:?}", other))),
        None => return Ok(()),
    }

    let (reply, assigned) = oneshot::channel();
    leases
        .send(LeaseCommand::Issue { reply })
        .await
        .map_err(|_| Error::ConnectionClosed)?;
    let uid = assigned.await.map_err(|_| Error::ConnectionClosed)?;
    write_frame(&mut writer, &UidFrame::Assigned { uid: uid.clone() }).await?;

    match read_frame(&mut reader).await? {
        Some(UidFrame::Confirm { uid: confirmed }) if confirmed == uid => {
            let (reply, confirmed) = oneshot::channel();
            leases
                .send(LeaseCommand::Confirm { uid, reply })
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            confirmed.await.map_err(|_| Error::ConnectionClosed)??;
            write_frame(&mut writer, &UidFrame::Confirmed).await
        }
        Some(other) => Err(Error::invalid(format!(
            "expected confirmation of {}, got {:?}",
            uid, other
        ))),
        None => {
            debug!("Requester left without confirming {}", uid);
            Ok(())
        }
    }
}

/// Runs the requester side of the protocol on `stream`.
pub async fn fetch<S>(stream: S) -> Result<Uid>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    write_frame(&mut writer, &UidFrame::Request).await?;
    let uid = match read_frame(&mut reader).await? {
        Some(UidFrame::Assigned { uid }) => uid,
        Some(other) => return Err(Error::invalid(format!("expected uid, got {:?}", other))),
        None => return Err(Error::ConnectionClosed),
    };
    write_frame(&mut writer, &UidFrame::Confirm { uid: uid.clone() }).await?;
    match read_frame(&mut reader).await? {
        Some(UidFrame::Confirmed) => Ok(uid),
        Some(other) => Err(Error::invalid(format!(
            "expected confirmation, got {:?}",
            other
        ))),
        None => Err(Error::ConnectionClosed),
    }
}

/// Leases a uid from the master at `host:port`.
pub async fn request_uid(host: &str, port: u16) -> Result<Uid> {
    let stream = TcpStream::connect((host, port)).await?;
    fetch(stream).await
}
