use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use peerlink_transfer::{
    ConnectionStabilizer, DeviceResolver, Direction, FolderProvider, NullTaskSink,
    PassthroughResolver, ProgressRegistry, Reassembler, ReassemblyError, StaticFolders, TaskEvent,
    TaskSink, TransferKey,
};
use peerlink_types::events::ControlMessage;
use peerlink_types::models::{
    transfer_room_id, ProgressRecord, SessionState, SyncedFile, TransferFailure, TransferStatus,
};

use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::sessions::SessionTable;

/// Capacity of the per-connection outbound queue.
const OUTBOUND_CAPACITY: usize = 64;

/// Upper bound on entries returned in one `file_sync_response`.
const MAX_SYNC_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Idle,
    ReceivingChunks,
    Closed,
    Errored,
}

/// Requests from the application, applied on the live connection.
#[derive(Debug, Clone)]
pub enum ChannelCommand {
    Download { file_path: String, sending_device_id: String },
    DeviceInfo { target_device_id: String },
    FileSync { target_device_id: String },
    CancelTransfer { transfer_room: String, filename: String },
}

/// Cloneable front end for a running [`TransferChannel`]. Commands issued
/// while disconnected are applied once the next connection opens.
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    state: watch::Receiver<ChannelState>,
}

impl ChannelHandle {
    fn send(&self, command: ChannelCommand) -> Result<(), ChannelError> {
        self.commands.send(command).map_err(|_| ChannelError::Closed)
    }

    /// Ask `sending_device_id` to send us `file_path`.
    pub fn download(
        &self,
        file_path: impl Into<String>,
        sending_device_id: impl Into<String>,
    ) -> Result<(), ChannelError> {
        self.send(ChannelCommand::Download {
            file_path: file_path.into(),
            sending_device_id: sending_device_id.into(),
        })
    }

    pub fn request_device_info(
        &self,
        target_device_id: impl Into<String>,
    ) -> Result<(), ChannelError> {
        self.send(ChannelCommand::DeviceInfo {
            target_device_id: target_device_id.into(),
        })
    }

    pub fn request_file_sync(
        &self,
        target_device_id: impl Into<String>,
    ) -> Result<(), ChannelError> {
        self.send(ChannelCommand::FileSync {
            target_device_id: target_device_id.into(),
        })
    }

    pub fn cancel_transfer(
        &self,
        transfer_room: impl Into<String>,
        filename: impl Into<String>,
    ) -> Result<(), ChannelError> {
        self.send(ChannelCommand::CancelTransfer {
            transfer_room: transfer_room.into(),
            filename: filename.into(),
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }
}

/// Services shared with the tasks a connection spawns (uploads, watchdogs).
#[derive(Clone)]
struct Services {
    config: Arc<ChannelConfig>,
    reassembler: Arc<Reassembler>,
    progress: Arc<ProgressRegistry>,
    folders: Arc<dyn FolderProvider>,
    resolver: Arc<dyn DeviceResolver>,
    tasks: Arc<dyn TaskSink>,
}

impl Services {
    fn fail(
        &self,
        direction: Direction,
        filename: &str,
        failure: TransferFailure,
        detail: Option<String>,
    ) {
        self.progress.mark(direction, filename, TransferStatus::Failed);
        self.tasks.notify(TaskEvent::Failed {
            direction,
            filename: filename.to_string(),
            failure,
            detail,
        });
    }
}

/// Per-connection state owned by the receive loop.
struct Session {
    handle: u64,
    outbound: mpsc::Sender<Message>,
    /// Key chunks are appended to; set by the last `Start file transfer`.
    active: Option<TransferKey>,
    /// Cancelled when the connection ends; parents upload tokens.
    cancel: CancellationToken,
    uploads: Vec<(TransferKey, CancellationToken)>,
}

impl Session {
    /// Cancel our live uploads for `key`, forgetting finished ones. Returns
    /// whether any was running.
    fn cancel_uploads(&mut self, key: &TransferKey) -> bool {
        self.uploads.retain(|(_, token)| !token.is_cancelled());
        let mut found = false;
        for (upload, token) in &self.uploads {
            if upload == key {
                token.cancel();
                found = true;
            }
        }
        found
    }

    async fn send(&self, msg: &ControlMessage) -> Result<(), ChannelError> {
        let text = msg.to_json()?;
        trace!("-> {}", msg.kind());
        self.outbound
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

/// The device's connection to the relay's message channel.
///
/// `run` keeps one WebSocket open at a time: it waits on the stabilizer,
/// connects to `<base>/<device_id>/`, announces the device, then serves
/// control messages and chunk frames until the socket drops, and repeats.
pub struct TransferChannel {
    services: Services,
    stabilizer: Arc<ConnectionStabilizer>,
    sessions: SessionTable,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    state_tx: watch::Sender<ChannelState>,
}

impl TransferChannel {
    pub fn new(
        config: ChannelConfig,
        stabilizer: Arc<ConnectionStabilizer>,
        progress: Arc<ProgressRegistry>,
    ) -> (Self, ChannelHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Closed);

        let reassembler = Arc::new(Reassembler::new(config.download_dir.clone()));
        let folders = Arc::new(StaticFolders(config.scanned_folders.clone()));
        let channel = Self {
            services: Services {
                config: Arc::new(config),
                reassembler,
                progress,
                folders,
                resolver: Arc::new(PassthroughResolver),
                tasks: Arc::new(NullTaskSink),
            },
            stabilizer,
            sessions: SessionTable::new(),
            commands: command_rx,
            state_tx,
        };
        let handle = ChannelHandle {
            commands: command_tx,
            state: state_rx,
        };
        (channel, handle)
    }

    pub fn with_folders(mut self, folders: Arc<dyn FolderProvider>) -> Self {
        self.services.folders = folders;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DeviceResolver>) -> Self {
        self.services.resolver = resolver;
        self
    }

    pub fn with_task_sink(mut self, tasks: Arc<dyn TaskSink>) -> Self {
        self.services.tasks = tasks;
        self
    }

    pub fn sessions(&self) -> SessionTable {
        self.sessions.clone()
    }

    pub fn reassembler(&self) -> Arc<Reassembler> {
        self.services.reassembler.clone()
    }

    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Channel state {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    /// Connect, serve, and reconnect until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let url = self.services.config.endpoint();
        info!("Transfer channel starting for {}", url);

        while !shutdown.is_cancelled() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.stabilizer.should_attempt_connection() => {}
            }

            self.set_state(ChannelState::Connecting);
            let connect = tokio::time::timeout(
                self.services.config.connect_timeout,
                tokio_tungstenite::connect_async(url.as_str()),
            );
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = connect => result,
            };

            let ws = match result {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(e)) => {
                    warn!("Channel connect to {} failed: {}", url, e);
                    self.stabilizer.record_connection_attempt(false);
                    self.set_state(ChannelState::Errored);
                    continue;
                }
                Err(_) => {
                    warn!("Channel connect to {} timed out", url);
                    self.stabilizer.record_connection_attempt(false);
                    self.set_state(ChannelState::Errored);
                    continue;
                }
            };

            self.stabilizer.record_connection_attempt(true);
            self.set_state(ChannelState::Open);
            info!("Channel connected to {}", url);

            match self.run_session(ws, &shutdown).await {
                Ok(()) => {
                    info!("Channel to {} closed", url);
                    self.set_state(ChannelState::Closed);
                }
                Err(e) => {
                    warn!("Channel to {} dropped: {}", url, e);
                    self.set_state(ChannelState::Errored);
                }
            }
        }

        self.set_state(ChannelState::Closed);
        info!("Transfer channel stopped");
    }

    async fn run_session<S>(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        shutdown: &CancellationToken,
    ) -> Result<(), ChannelError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);

        // Writer task: everything outbound goes through one queue.
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!("Channel write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut session = Session {
            handle: self.sessions.next_handle(),
            outbound: out_tx,
            active: None,
            cancel: shutdown.child_token(),
            uploads: Vec::new(),
        };

        let result = self.session_loop(&mut session, &mut stream, shutdown).await;

        self.teardown(&session).await;
        drop(session);
        // The writer drains what is queued (including a Close) and exits.
        if tokio::time::timeout(std::time::Duration::from_secs(2), writer).await.is_err() {
            debug!("Channel writer did not finish in time");
        }
        result
    }

    async fn session_loop<St>(
        &mut self,
        session: &mut Session,
        stream: &mut St,
        shutdown: &CancellationToken,
    ) -> Result<(), ChannelError>
    where
        St: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let config = self.services.config.clone();
        session
            .send(&ControlMessage::InitiateLiveDataConnection {
                username: config.username.clone(),
                device_name: config.device_name.clone(),
                run_device_info_loop: config.run_device_info_loop,
                run_device_predictions_loop: config.run_device_predictions_loop,
            })
            .await?;
        self.set_state(ChannelState::Idle);

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.tick().await;
        let mut pong_received = true;
        let mut missed_heartbeats: u8 = 0;
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = session.outbound.send(Message::Close(None)).await;
                    return Ok(());
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_text(session, text.as_str()).await?
                    }
                    Some(Ok(Message::Binary(data))) => self.handle_chunk(session, data),
                    Some(Ok(Message::Pong(_))) => pong_received = true,
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Relay closed the channel: {:?}", frame);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(session, command).await?,
                    None => commands_open = false,
                },
                _ = heartbeat.tick() => {
                    if pong_received {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            return Err(ChannelError::HeartbeatTimeout(missed_heartbeats));
                        }
                    }
                    pong_received = false;
                    session
                        .outbound
                        .send(Message::Ping(Bytes::new()))
                        .await
                        .map_err(|_| ChannelError::Closed)?;
                }
            }
        }
    }

    /// Invalidate the connection's sessions and drop partial downloads.
    async fn teardown(&self, session: &Session) {
        session.cancel.cancel();
        let invalidated = self.sessions.invalidate(session.handle).await;
        self.sessions.prune().await;

        let discarded = self.services.reassembler.discard_all();
        for key in &discarded {
            self.services.fail(
                Direction::Download,
                &key.filename,
                TransferFailure::TransferFailed,
                Some("connection lost".into()),
            );
        }
        if invalidated > 0 || !discarded.is_empty() {
            info!(
                "Connection {} ended: {} sessions invalidated, {} partial downloads discarded",
                session.handle,
                invalidated,
                discarded.len()
            );
        }
    }

    async fn handle_text(&self, session: &mut Session, text: &str) -> Result<(), ChannelError> {
        let msg = match serde_json::from_str::<ControlMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                warn!("Dropping control message: {} -- raw: {}", e, preview);
                return Ok(());
            }
        };
        trace!("<- {}", msg.kind());

        if let Some((failure, room, filename)) = msg.failure() {
            self.handle_failure(session, failure, room, filename, &msg);
            return Ok(());
        }
        if let Some((room, filename)) = msg.completion() {
            return self.complete_download(session, room, filename).await;
        }

        let config = &self.services.config;
        match msg {
            ControlMessage::JoinTransferRoom { transfer_room, device_id } => {
                self.sessions
                    .join(
                        &transfer_room,
                        &device_id,
                        &config.username,
                        session.handle,
                        SessionState::Active,
                    )
                    .await;
            }

            ControlMessage::DeviceInfoRequest { target_device_id, requesting_device_id } => {
                if !target_device_id.is_empty() && target_device_id != config.device_id {
                    debug!("Ignoring device_info for {}", target_device_id);
                    return Ok(());
                }
                debug!("Device info requested by {:?}", requesting_device_id);
                session
                    .send(&ControlMessage::DeviceInfoResponse {
                        device_id: config.device_id.clone(),
                        device_name: config.device_name.clone(),
                        username: config.username.clone(),
                        os: std::env::consts::OS.to_string(),
                        scanned_folders: self.services.folders.scanned_folders().len(),
                    })
                    .await?;
            }

            ControlMessage::DeviceInfoResponse { device_id, username, os, .. } => {
                let name = self.services.resolver.resolve(&username, &device_id);
                info!("Device info: {} ({}, {})", name, username, os);
            }

            ControlMessage::FileSyncRequest { target_device_id, .. } => {
                if !target_device_id.is_empty() && target_device_id != config.device_id {
                    return Ok(());
                }
                let files = list_scanned_files(&self.services.folders.scanned_folders()).await;
                debug!("File sync: reporting {} files", files.len());
                session
                    .send(&ControlMessage::FileSyncResponse {
                        device_id: config.device_id.clone(),
                        files,
                    })
                    .await?;
            }

            ControlMessage::FileSyncResponse { device_id, files } => {
                info!("{} serves {} files", device_id, files.len());
            }

            ControlMessage::FileRequest { file_path, transfer_room, requesting_device_id } => {
                let requester = requesting_device_id
                    .as_deref()
                    .map(|id| self.services.resolver.resolve(&config.username, id))
                    .unwrap_or_else(|| "relay".into());
                info!("{} requested {} in {}", requester, file_path, transfer_room);
                self.start_upload(session, PathBuf::from(file_path), transfer_room);
            }

            ControlMessage::StartFileTransfer { transfer_room, filename, file_type, file_size } => {
                let room = if transfer_room.is_empty() {
                    session.active.as_ref().map(|k| k.transfer_room.clone()).unwrap_or_default()
                } else {
                    transfer_room
                };
                let key = TransferKey::new(room, filename);
                self.start_download(session, key, &file_type, file_size);
            }

            ControlMessage::TransferAcknowledged { filename, received_bytes, .. } => {
                info!("Peer acknowledged {} ({} bytes)", filename, received_bytes);
            }

            ControlMessage::FileSentSuccessfully { filename, .. } => {
                debug!("Relay reports {} sent", filename);
            }

            other => {
                debug!("Ignoring {} on the device side", other.kind());
            }
        }
        Ok(())
    }

    fn start_download(
        &self,
        session: &mut Session,
        key: TransferKey,
        file_type: &str,
        file_size: u64,
    ) {
        let services = &self.services;
        let token = match services.reassembler.start_transfer(key.clone(), file_type, file_size) {
            Ok(token) => token,
            Err(e) => {
                warn!("Refusing transfer {}: {}", key, e);
                session.active = None;
                services.tasks.notify(TaskEvent::Failed {
                    direction: Direction::Download,
                    filename: key.filename.clone(),
                    failure: TransferFailure::TransferFailed,
                    detail: Some(e.to_string()),
                });
                return;
            }
        };

        info!("Receiving {} ({} bytes, {})", key, file_size, file_type);
        services.progress.cleanup(Direction::Download, &key.filename);
        services.progress.upsert(
            Direction::Download,
            vec![ProgressRecord::new(
                &key.filename,
                file_type,
                file_size,
                0,
                TransferStatus::Transferring,
            )],
        );
        session.active = Some(key.clone());
        self.set_state(ChannelState::ReceivingChunks);

        tokio::spawn(idle_watchdog(services.clone(), key, token));
    }

    fn handle_chunk(&self, session: &mut Session, data: Bytes) {
        let Some(key) = session.active.clone() else {
            warn!("Dropping {} byte chunk: no active transfer", data.len());
            return;
        };

        let reassembler = &self.services.reassembler;
        match reassembler.append_chunk(&key, data) {
            Ok(received) => {
                if let Some(info) = reassembler.info(&key) {
                    self.services.progress.upsert(
                        Direction::Download,
                        vec![ProgressRecord::new(
                            &key.filename,
                            info.file_type,
                            info.total_size,
                            received,
                            TransferStatus::Transferring,
                        )],
                    );
                }
            }
            Err(e) => {
                warn!("Dropping chunk for {}: {}", key, e);
                session.active = None;
                self.set_state(ChannelState::Idle);
            }
        }
    }

    /// Resolve the transfer a notice refers to. Notices may leave out the
    /// room or the filename; the active transfer fills the gaps.
    fn notice_key(&self, session: &Session, room: &str, filename: &str) -> Option<TransferKey> {
        match (&session.active, room.is_empty(), filename.is_empty()) {
            (_, false, false) => Some(TransferKey::new(room, filename)),
            (Some(active), true, false) if active.filename == filename => Some(active.clone()),
            (Some(active), false, true) if active.transfer_room == room => Some(active.clone()),
            (Some(active), true, true) => Some(active.clone()),
            _ => None,
        }
    }

    fn clear_active(&self, session: &mut Session, key: &TransferKey) {
        if session.active.as_ref() == Some(key) {
            session.active = None;
            self.set_state(ChannelState::Idle);
        }
    }

    async fn complete_download(
        &self,
        session: &mut Session,
        room: &str,
        filename: &str,
    ) -> Result<(), ChannelError> {
        let Some(key) = self.notice_key(session, room, filename) else {
            warn!("Completion for unknown transfer {}/{}", room, filename);
            return Ok(());
        };
        self.clear_active(session, &key);

        let services = &self.services;
        let expected = services.reassembler.info(&key);
        match services.reassembler.flush(&key).await {
            Ok(path) => {
                let (file_type, total, received) = expected
                    .map(|i| (i.file_type, i.total_size, i.received_bytes))
                    .unwrap_or_default();
                services.progress.upsert(
                    Direction::Download,
                    vec![ProgressRecord::new(
                        &key.filename,
                        file_type,
                        total.max(received),
                        received,
                        TransferStatus::Completed,
                    )],
                );
                services.tasks.notify(TaskEvent::Completed {
                    direction: Direction::Download,
                    filename: key.filename.clone(),
                    path: Some(path),
                    bytes: received,
                });
                session
                    .send(&ControlMessage::TransferAcknowledged {
                        transfer_room: key.transfer_room.clone(),
                        filename: key.filename.clone(),
                        received_bytes: received,
                    })
                    .await?;
            }
            Err(ReassemblyError::NoActiveTransfer(_)) => {
                debug!("Completion for {} which is already finished or unknown", key);
            }
            Err(e) => {
                warn!("Could not save {}: {}", key, e);
                services.fail(
                    Direction::Download,
                    &key.filename,
                    TransferFailure::TransferFailed,
                    Some(e.to_string()),
                );
            }
        }
        Ok(())
    }

    fn handle_failure(
        &self,
        session: &mut Session,
        failure: TransferFailure,
        room: &str,
        filename: &str,
        msg: &ControlMessage,
    ) {
        let detail = match msg {
            ControlMessage::TransferFailed { reason, .. } => reason.clone(),
            _ => None,
        };
        let Some(key) = self.notice_key(session, room, filename) else {
            warn!("{} (no matching transfer)", failure);
            return;
        };
        warn!("{}: {}", key, failure);
        self.clear_active(session, &key);

        let services = &self.services;
        let direction = if services.reassembler.abort(&key).is_some()
            || services.progress.downloads().get(&key.filename).is_some()
        {
            Direction::Download
        } else {
            // Our upload was refused on the other end.
            session.cancel_uploads(&key);
            Direction::Upload
        };
        services.fail(direction, &key.filename, failure, detail);
    }

    async fn handle_command(
        &self,
        session: &mut Session,
        command: ChannelCommand,
    ) -> Result<(), ChannelError> {
        let config = &self.services.config;
        match command {
            ChannelCommand::Download { file_path, sending_device_id } => {
                let room = transfer_room_id(&sending_device_id, &config.device_id);
                self.sessions
                    .join(
                        &room,
                        &sending_device_id,
                        &config.username,
                        session.handle,
                        SessionState::Joining,
                    )
                    .await;
                session
                    .send(&ControlMessage::JoinTransferRoom {
                        transfer_room: room.clone(),
                        device_id: config.device_id.clone(),
                    })
                    .await?;

                let filename = file_name_of(Path::new(&file_path));
                self.services.progress.upsert(
                    Direction::Download,
                    vec![ProgressRecord::new(&filename, "", 0, 0, TransferStatus::Pending)],
                );
                tokio::spawn(pending_watchdog(
                    self.services.clone(),
                    filename,
                    session.cancel.child_token(),
                ));
                info!("Requesting {} from {} in {}", file_path, sending_device_id, room);
                session
                    .send(&ControlMessage::DownloadRequest {
                        file_path,
                        sending_device_id,
                        requesting_device_id: config.device_id.clone(),
                        transfer_room: room,
                    })
                    .await?;
            }

            ChannelCommand::DeviceInfo { target_device_id } => {
                session
                    .send(&ControlMessage::DeviceInfoRequest {
                        target_device_id,
                        requesting_device_id: Some(config.device_id.clone()),
                    })
                    .await?;
            }

            ChannelCommand::FileSync { target_device_id } => {
                session
                    .send(&ControlMessage::FileSyncRequest {
                        target_device_id,
                        requesting_device_id: Some(config.device_id.clone()),
                    })
                    .await?;
            }

            ChannelCommand::CancelTransfer { transfer_room, filename } => {
                let key = TransferKey::new(transfer_room, filename);
                let download = self.services.reassembler.cancel(&key);
                let upload = session.cancel_uploads(&key);
                if !download && !upload {
                    debug!("Cancel for unknown transfer {}", key);
                    return Ok(());
                }
                self.clear_active(session, &key);
                info!("Cancelling {}", key);
                session
                    .send(&ControlMessage::TransferFailed {
                        transfer_room: key.transfer_room.clone(),
                        filename: key.filename.clone(),
                        reason: Some("cancelled".into()),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    fn start_upload(&self, session: &mut Session, path: PathBuf, transfer_room: String) {
        let filename = file_name_of(&path);
        let key = TransferKey::new(transfer_room, filename);
        let token = session.cancel.child_token();

        session.uploads.retain(|(_, t)| !t.is_cancelled());
        session.uploads.push((key.clone(), token.clone()));

        let services = self.services.clone();
        let outbound = session.outbound.clone();
        tokio::spawn(async move {
            serve_file(services, outbound, key, path, token.clone()).await;
            // Finished uploads leave the session's list on the next prune.
            token.cancel();
        });
    }
}

/// Stream one local file into a room: `Start file transfer`, the bytes as
/// binary frames, then `File sent successfully`.
async fn serve_file(
    services: Services,
    outbound: mpsc::Sender<Message>,
    key: TransferKey,
    path: PathBuf,
    cancel: CancellationToken,
) {
    let TransferKey { transfer_room, filename } = key.clone();
    let send = |msg: ControlMessage| {
        let outbound = outbound.clone();
        async move {
            match msg.to_json() {
                Ok(text) => outbound.send(Message::Text(text.into())).await.is_ok(),
                Err(_) => false,
            }
        }
    };

    if !services.folders.owns(&path) {
        warn!("Refusing to serve {}: outside scanned folders", path.display());
        send(ControlMessage::PermissionDenied { transfer_room, filename: filename.clone() }).await;
        services.tasks.notify(TaskEvent::Failed {
            direction: Direction::Upload,
            filename,
            failure: TransferFailure::PermissionDenied,
            detail: Some(path.display().to_string()),
        });
        return;
    }

    let opened = async {
        let file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        Ok::<_, std::io::Error>((file, size))
    }
    .await;
    let (file, size) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            warn!("Cannot serve {}: {}", path.display(), e);
            send(ControlMessage::FileNotFound { transfer_room, filename: filename.clone() }).await;
            services.tasks.notify(TaskEvent::Failed {
                direction: Direction::Upload,
                filename,
                failure: TransferFailure::FileNotFound,
                detail: Some(e.to_string()),
            });
            return;
        }
    };

    let file_type = content_type_for(&path).to_string();
    if !send(ControlMessage::StartFileTransfer {
        transfer_room: transfer_room.clone(),
        filename: filename.clone(),
        file_type: file_type.clone(),
        file_size: size,
    })
    .await
    {
        return;
    }

    let uploads = services.progress.uploads();
    uploads.cleanup(&filename);
    uploads.upsert(vec![ProgressRecord::new(
        &filename,
        &file_type,
        size,
        0,
        TransferStatus::Transferring,
    )]);
    info!("Serving {} ({} bytes) into {}", path.display(), size, transfer_room);

    let mut chunks = ReaderStream::with_capacity(file, services.config.chunk_size);
    let mut sent: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                services.fail(Direction::Upload, &filename, TransferFailure::Cancelled, None);
                return;
            }
            next = chunks.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                let len = chunk.len() as u64;
                if outbound.send(Message::Binary(chunk)).await.is_err() {
                    services.fail(
                        Direction::Upload,
                        &filename,
                        TransferFailure::TransferFailed,
                        Some("connection lost".into()),
                    );
                    return;
                }
                sent += len;
                uploads.upsert(vec![ProgressRecord::new(
                    &filename,
                    &file_type,
                    size,
                    sent,
                    TransferStatus::Transferring,
                )]);
            }
            Some(Err(e)) => {
                warn!("Read error serving {}: {}", path.display(), e);
                send(ControlMessage::FileNotFound {
                    transfer_room,
                    filename: filename.clone(),
                })
                .await;
                services.fail(
                    Direction::Upload,
                    &filename,
                    TransferFailure::FileNotFound,
                    Some(e.to_string()),
                );
                return;
            }
            None => break,
        }
    }

    send(ControlMessage::FileSentSuccessfully {
        transfer_room,
        filename: filename.clone(),
    })
    .await;
    uploads.upsert(vec![ProgressRecord::new(
        &filename,
        &file_type,
        size,
        sent,
        TransferStatus::Completed,
    )]);
    services.tasks.notify(TaskEvent::Completed {
        direction: Direction::Upload,
        filename,
        path: Some(path),
        bytes: sent,
    });
}

/// Fail a requested download whose sender never starts it, or whose
/// connection goes away first.
async fn pending_watchdog(services: Services, filename: String, connection: CancellationToken) {
    let (failure, detail) = tokio::select! {
        _ = connection.cancelled() => {
            (TransferFailure::TransferFailed, Some("connection lost".to_string()))
        }
        _ = tokio::time::sleep(services.config.transfer_idle_timeout) => {
            (TransferFailure::TimedOut, None)
        }
    };

    let downloads = services.progress.downloads();
    if downloads
        .mark_if(&filename, TransferStatus::Pending, TransferStatus::Failed)
        .is_some()
    {
        warn!("Requested download {} never started: {}", filename, failure);
        services.tasks.notify(TaskEvent::Failed {
            direction: Direction::Download,
            filename,
            failure,
            detail,
        });
    }
}

/// Fail a download that stops receiving chunks, or that was cancelled.
async fn idle_watchdog(services: Services, key: TransferKey, token: CancellationToken) {
    let timeout = services.config.transfer_idle_timeout;
    loop {
        let Some(idle) = services.reassembler.idle_for(&key) else {
            return;
        };
        if idle >= timeout {
            if services.reassembler.abort(&key).is_some() {
                warn!("{} stalled for {:?}, giving up", key, idle);
                services.fail(Direction::Download, &key.filename, TransferFailure::TimedOut, None);
            }
            return;
        }

        tokio::select! {
            _ = token.cancelled() => {
                // Restarts and flushes cancel the old token too; only a
                // cancellation of the live buffer's token means "cancelled".
                let live = services.reassembler.cancellation_token(&key);
                if live.is_some_and(|t| t.is_cancelled())
                    && services.reassembler.abort(&key).is_some()
                {
                    services.fail(
                        Direction::Download,
                        &key.filename,
                        TransferFailure::Cancelled,
                        None,
                    );
                }
                return;
            }
            _ = tokio::time::sleep(timeout - idle) => {}
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Files under the scanned folders, walked breadth-first.
async fn list_scanned_files(folders: &[PathBuf]) -> Vec<SyncedFile> {
    let mut files = Vec::new();
    let mut pending: std::collections::VecDeque<PathBuf> = folders.iter().cloned().collect();

    while let Some(dir) = pending.pop_front() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Skipping {}: {}", dir.display(), e);
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                pending.push_back(entry.path());
            } else if meta.is_file() {
                files.push(SyncedFile {
                    path: entry.path().display().to_string(),
                    size: meta.len(),
                });
                if files.len() >= MAX_SYNC_ENTRIES {
                    return files;
                }
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn test_channel(config: ChannelConfig) -> TransferChannel {
        let (channel, _handle) = TransferChannel::new(
            config,
            Arc::new(ConnectionStabilizer::default()),
            Arc::new(ProgressRegistry::new()),
        );
        channel
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for(Path::new("/a/Report.PDF")), "application/pdf");
        assert_eq!(content_type_for(Path::new("/a/blob")), "application/octet-stream");
    }

    #[tokio::test]
    async fn scanned_files_are_listed_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        std::fs::write(dir.path().join("nested/b.bin"), b"12345").unwrap();

        let mut files = list_scanned_files(&[dir.path().to_path_buf()]).await;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(files.len(), 2);
        assert!(files[0].path.ends_with("a.txt"));
        assert_eq!(files[0].size, 3);
        assert_eq!(files[1].size, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_download_is_failed_by_watchdog() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ChannelConfig::new("ws://unused", "ana", "dev-1");
        config.download_dir = dir.path().to_path_buf();
        let (channel, _handle) = TransferChannel::new(
            config,
            Arc::new(ConnectionStabilizer::default()),
            Arc::new(ProgressRegistry::new()),
        );
        let services = channel.services.clone();

        let key = TransferKey::new("room-x", "slow.bin");
        let token = services.reassembler.start_transfer(key.clone(), "", 10).unwrap();
        services.progress.upsert(
            Direction::Download,
            vec![ProgressRecord::new("slow.bin", "", 10, 0, TransferStatus::Transferring)],
        );

        idle_watchdog(services.clone(), key.clone(), token).await;

        assert!(!services.reassembler.contains(&key));
        let record = services.progress.downloads().get("slow.bin").unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn cancelled_download_is_failed_by_watchdog() {
        let (channel, _handle) = TransferChannel::new(
            ChannelConfig::new("ws://unused", "ana", "dev-1"),
            Arc::new(ConnectionStabilizer::default()),
            Arc::new(ProgressRegistry::new()),
        );
        let services = channel.services.clone();
        let key = TransferKey::new("room-x", "a.bin");
        let token = services.reassembler.start_transfer(key.clone(), "", 10).unwrap();
        services.progress.upsert(
            Direction::Download,
            vec![ProgressRecord::new("a.bin", "", 10, 0, TransferStatus::Transferring)],
        );

        let watchdog = tokio::spawn(idle_watchdog(services.clone(), key.clone(), token));
        assert!(services.reassembler.cancel(&key));
        watchdog.await.unwrap();

        assert!(!services.reassembler.contains(&key));
        assert_eq!(
            services.progress.downloads().get("a.bin").unwrap().status,
            TransferStatus::Failed
        );
    }

    #[tokio::test]
    async fn restart_does_not_fail_new_buffer() {
        let (channel, _handle) = TransferChannel::new(
            ChannelConfig::new("ws://unused", "ana", "dev-1"),
            Arc::new(ConnectionStabilizer::default()),
            Arc::new(ProgressRegistry::new()),
        );
        let services = channel.services.clone();
        let key = TransferKey::new("room-x", "a.bin");
        let first = services.reassembler.start_transfer(key.clone(), "", 10).unwrap();
        let watchdog = tokio::spawn(idle_watchdog(services.clone(), key.clone(), first));

        services.reassembler.start_transfer(key.clone(), "", 20).unwrap();
        watchdog.await.unwrap();
        assert!(services.reassembler.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn requested_download_that_never_starts_times_out() {
        let channel = test_channel(ChannelConfig::new("ws://unused", "ana", "dev-1"));
        let services = channel.services.clone();
        let downloads = services.progress.downloads();
        downloads.upsert(vec![ProgressRecord::new("a.pdf", "", 0, 0, TransferStatus::Pending)]);
        downloads.upsert(vec![ProgressRecord::new(
            "b.bin",
            "",
            10,
            2,
            TransferStatus::Transferring,
        )]);

        pending_watchdog(services.clone(), "a.pdf".into(), CancellationToken::new()).await;
        pending_watchdog(services.clone(), "b.bin".into(), CancellationToken::new()).await;

        assert_eq!(downloads.get("a.pdf").unwrap().status, TransferStatus::Failed);
        assert_eq!(downloads.get("b.bin").unwrap().status, TransferStatus::Transferring);
    }

    #[tokio::test]
    async fn requested_download_fails_when_connection_ends() {
        let channel = test_channel(ChannelConfig::new("ws://unused", "ana", "dev-1"));
        let services = channel.services.clone();
        services.progress.upsert(
            Direction::Download,
            vec![ProgressRecord::new("a.pdf", "", 0, 0, TransferStatus::Pending)],
        );

        let connection = CancellationToken::new();
        let watchdog = tokio::spawn(pending_watchdog(
            services.clone(),
            "a.pdf".into(),
            connection.clone(),
        ));
        connection.cancel();
        watchdog.await.unwrap();

        assert_eq!(
            services.progress.downloads().get("a.pdf").unwrap().status,
            TransferStatus::Failed
        );
    }

    #[tokio::test]
    async fn finished_uploads_leave_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let mut config = ChannelConfig::new("ws://unused", "ana", "dev-1");
        config.scanned_folders = vec![dir.path().to_path_buf()];
        config.chunk_size = 4;
        let channel = test_channel(config);

        let (outbound, mut frames) = mpsc::channel(OUTBOUND_CAPACITY);
        let mut session = Session {
            handle: 1,
            outbound,
            active: None,
            cancel: CancellationToken::new(),
            uploads: Vec::new(),
        };

        channel.start_upload(&mut session, path.clone(), "room-u".into());
        loop {
            match frames.recv().await.unwrap() {
                Message::Text(text) if text.as_str().contains("File sent successfully") => break,
                _ => {}
            }
        }
        let finished = session.uploads[0].1.clone();
        tokio::time::timeout(Duration::from_secs(5), finished.cancelled())
            .await
            .unwrap();

        channel.start_upload(&mut session, path, "room-v".into());
        assert_eq!(session.uploads.len(), 1);
        assert_eq!(session.uploads[0].0.transfer_room, "room-v");
        assert!(!session.cancel_uploads(&TransferKey::new("room-u", "f.txt")));
    }
}
