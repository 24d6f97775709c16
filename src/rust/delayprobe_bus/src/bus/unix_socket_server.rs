use super::client::{MAGIC_NUMBER, MAGIC_RESPONSE};
use super::protocol::{from_cbor, read_frame, to_cbor, write_frame};
use crate::{BusReply, BusRequest, BusResponse, BusSession, BUS_SOCKET_PATH};
use std::{
    fs::{remove_file, Permissions},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};
use tracing::{debug, error, info, warn};

/// Called once per session with every request in it; pushes one
/// response per request.
pub type RequestHandler = Arc<dyn Fn(&[BusRequest], &mut Vec<BusResponse>) + Send + Sync>;

/// Implements a Tokio-friendly server using Unix Sockets and the bus protocol.
/// Requests are decoded and then forwarded to the handler.
pub struct UnixSocketServer {
    socket_path: PathBuf,
}

impl UnixSocketServer {
    /// Creates a new `UnixSocketServer` on the default path. Will delete
    /// any pre-existing socket file.
    pub fn new() -> Result<Self, UnixSocketServerError> {
        Self::at(Path::new(BUS_SOCKET_PATH))
    }

    /// Creates a server bound (once `listen` is called) to `socket_path`.
    pub fn at(socket_path: &Path) -> Result<Self, UnixSocketServerError> {
        let server = Self {
            socket_path: socket_path.to_path_buf(),
        };
        server.delete_local_socket()?;
        server.check_directory()?;
        Ok(server)
    }

    /// We can't guaranty that Drop will be called on a process exit,
    /// so signal handlers call this explicitly.
    pub fn signal_cleanup() {
        let _ = remove_file(BUS_SOCKET_PATH);
    }

    fn check_directory(&self) -> Result<(), UnixSocketServerError> {
        let Some(dir_path) = self.socket_path.parent() else {
            return Ok(());
        };
        if dir_path.exists() && dir_path.is_dir() {
            return Ok(());
        }
        if let Err(e) = std::fs::create_dir_all(dir_path) {
            error!("Unable to create {}", dir_path.display());
            error!("{:?}", e);
            return Err(UnixSocketServerError::MkDirFail);
        }
        Ok(())
    }

    fn delete_local_socket(&self) -> Result<(), UnixSocketServerError> {
        if self.socket_path.exists() && remove_file(&self.socket_path).is_err() {
            error!("Unable to remove {}", self.socket_path.display());
            return Err(UnixSocketServerError::RmSocketFail);
        }
        Ok(())
    }

    fn make_socket_public(&self) -> Result<(), UnixSocketServerError> {
        std::fs::set_permissions(&self.socket_path, Permissions::from_mode(0o777)).map_err(|e| {
            error!("Unable to chmod {}: {e:?}", self.socket_path.display());
            UnixSocketServerError::ChmodFail
        })
    }

    /// Start listening for bus traffic, forwarding requests to `handler`
    /// for processing. Only returns on a listener error.
    pub async fn listen(&self, handler: RequestHandler) -> Result<(), UnixSocketServerError> {
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            error!("Unable to bind to {}", self.socket_path.display());
            error!("{:?}", e);
            UnixSocketServerError::BindFail
        })?;
        self.make_socket_public()?;
        info!("Listening on: {}", self.socket_path.display());
        loop {
            let (socket, _) = listener.accept().await.map_err(|e| {
                error!("Unable to listen for requests on {}", self.socket_path.display());
                error!("{:?}", e);
                UnixSocketServerError::ListenFail
            })?;
            let handler = handler.clone();
            tokio::spawn(async move {
                serve_client(socket, handler).await;
            });
        }
    }
}

/// Returns false if the peer did not open with the bus magic number.
async fn handshake(socket: &mut UnixStream) -> bool {
    let mut greeting = [0u8; 4];
    match socket.read_exact(&mut greeting).await {
        Ok(_) if greeting == MAGIC_NUMBER => {}
        Ok(_) => {
            warn!("Bus client sent {greeting:02x?} instead of the magic number");
            return false;
        }
        Err(e) => {
            debug!("Bus client left before the handshake: {e:?}");
            return false;
        }
    }
    match socket.write_all(&MAGIC_RESPONSE).await {
        Ok(()) => true,
        Err(e) => {
            debug!("Unable to answer the bus handshake: {e:?}");
            false
        }
    }
}

/// Decodes one session, runs it through `handler` and encodes the reply.
fn answer(handler: &RequestHandler, request_bytes: &[u8]) -> Option<Vec<u8>> {
    let session: BusSession = from_cbor(request_bytes).ok()?;
    let mut reply = BusReply {
        responses: Vec::with_capacity(session.requests.len()),
    };
    handler(&session.requests, &mut reply.responses);
    to_cbor(&reply).ok()
}

async fn serve_client(mut socket: UnixStream, handler: RequestHandler) {
    if !handshake(&mut socket).await {
        return;
    }

    // A client may send several sessions on one connection.
    while let Ok((request_id, request_bytes)) = read_frame(&mut socket).await {
        if request_bytes.is_empty() {
            warn!("Empty bus session {request_id}; dropping the client");
            return;
        }
        debug!("Bus session {request_id}: {} bytes", request_bytes.len());
        let Some(reply) = answer(&handler, &request_bytes) else {
            warn!("Unable to process bus session {request_id}");
            return;
        };
        if let Err(e) = write_frame(&mut socket, request_id, &reply).await {
            debug!("Bus client went away before its reply: {e:?}");
            return;
        }
    }
}

impl Drop for UnixSocketServer {
    fn drop(&mut self) {
        let _ = self.delete_local_socket();
    }
}

/// Errors raised while setting up or running the socket server.
#[derive(Error, Debug)]
pub enum UnixSocketServerError {
    /// The socket directory could not be created
    #[error("Unable to create directory")]
    MkDirFail,
    /// A stale socket could not be removed
    #[error("Unable to remove stale socket")]
    RmSocketFail,
    /// The socket permissions could not be opened up
    #[error("Unable to set socket permissions")]
    ChmodFail,
    /// Bind failed
    #[error("Cannot bind unix socket")]
    BindFail,
    /// Accept failed
    #[error("Cannot listen to socket")]
    ListenFail,
}
