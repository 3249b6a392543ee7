//! The core: one value owning the hub table, the user table, the queue
//! and the rate buckets, driven by a single event loop.
//!
//! Subsystems talk through channels: hub sessions emit
//! [`driftdc_hub::HubEvent`]s, the scheduler emits
//! [`driftdc_transfer::SchedAction`]s, transfer workers report through
//! the shared queue and a worker channel. The user-facing surface is a
//! command channel in and a notice channel out; no notice is ever
//! dropped (the channel is unbounded and the receiver outlives the
//! core).

use crate::config::Config;
use crate::share::ShareIndex;
use driftdc_hub::adc::cid_from_pid;
use driftdc_hub::hub::{Hub, HubConfig, HubDeps, HubState, SudpPolicy};
use driftdc_hub::search::{SearchRegistry, UdpHit};
use driftdc_hub::user::{uid_from_cid, uid_from_nick};
use driftdc_hub::{HubCommand, HubEvent, HubUser, SearchResult, Uid};
use driftdc_net::udp::{OutDatagram, UdpPair};
use driftdc_net::{Bucket, ConnectOpts, Connection, TlsSetup};
use driftdc_proto::adc::Cid;
use driftdc_proto::{HubAddr, HubDialect, SearchKind, SizeConstraint};
use driftdc_transfer::item::{DlError, DlItem, Priority, filelist_hash};
use driftdc_transfer::peer::{
    Direction, NmdcHandshake, PeerConn, ShareResolver, SlotTable, Wanted, handshake_adc,
    handshake_nmdc, serve_uploads,
};
use driftdc_transfer::store::{DlRow, DlSourceRow, DlStore};
use driftdc_transfer::{
    Queue, Scheduler, SchedAction, SegmentedFile, TransferError, WAIT_TIMEOUT,
};
use driftdc_tth::{Leaves, MIN_TTHL_SIZE, Root, verify_leaves};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::{Notify, mpsc};

/// Messages to the user-facing sink. Nothing here is lost when no view
/// is attached; the receiver buffers.
#[derive(Debug)]
pub enum Notice {
    /// Hub status text (connects, names, errors).
    Hub {
        /// Originating hub.
        hub_id: u64,
        /// Text.
        text: String,
    },
    /// Hub lifecycle change.
    HubState {
        /// Originating hub.
        hub_id: u64,
        /// New state.
        state: HubState,
    },
    /// Main chat line.
    Chat {
        /// Originating hub.
        hub_id: u64,
        /// Sender nick, `None` for hub text.
        from: Option<String>,
        /// Text.
        text: String,
    },
    /// Private message.
    Private {
        /// Originating hub.
        hub_id: u64,
        /// Sender nick.
        from: String,
        /// Text.
        text: String,
    },
    /// A search result for a live query.
    SearchHit {
        /// The query it answers.
        query: u64,
        /// The hit.
        result: SearchResult,
    },
    /// A hub wants a password and none is configured.
    PasswordNeeded {
        /// The hub.
        hub_id: u64,
    },
    /// A download completed and was moved into place.
    TransferDone {
        /// Final path.
        dest: PathBuf,
    },
    /// A download failed fatally.
    TransferFailed {
        /// Intended destination.
        dest: PathBuf,
        /// Cause.
        reason: String,
    },
    /// A peer's file list finished downloading.
    FilelistReady {
        /// The peer.
        uid: Uid,
        /// Where the list landed.
        path: PathBuf,
    },
}

/// Commands from the user surface.
#[derive(Debug)]
pub enum CoreCommand {
    /// Connect to a hub by address.
    AddHub {
        /// `dchub://`/`adcs://`-style address.
        url: String,
        /// Nick override for this hub.
        nick: Option<String>,
        /// Auto-login password.
        password: Option<String>,
        /// NMDC encoding label (e.g. `windows-1252`).
        encoding: Option<String>,
    },
    /// Send main chat on a hub.
    Chat {
        /// Target hub.
        hub_id: u64,
        /// Text.
        text: String,
    },
    /// Broadcast a search on every connected hub.
    Search {
        /// Search kind.
        kind: SearchKind,
        /// Size restriction.
        size: SizeConstraint,
        /// Include terms.
        terms: Vec<String>,
        /// Exact root for TTH lookups.
        tth: Option<Root>,
    },
    /// Queue a file download from a search result.
    Download {
        /// Source peer.
        uid: Uid,
        /// Content hash.
        tth: Root,
        /// File size.
        size: u64,
        /// Destination file name.
        name: String,
    },
    /// Queue a peer's file list.
    DownloadFilelist {
        /// The peer.
        uid: Uid,
    },
    /// Replace the configuration, fanning out side effects.
    SetConfig(Box<Config>),
    /// Rebuild the local share from disk.
    RefreshShare,
}

enum WorkerMsg {
    PeerReady {
        uid: Uid,
        assign: mpsc::UnboundedSender<Root>,
    },
    PeerGone {
        uid: Uid,
    },
}

/// Shared state the transfer workers need.
struct DlCtx {
    queue: Arc<Mutex<Queue>>,
    store: Arc<dyn DlStore>,
    kick: Arc<Notify>,
    segs: Mutex<HashMap<Root, Arc<Mutex<SegmentedFile>>>>,
    notices: mpsc::UnboundedSender<Notice>,
    incoming_dir: PathBuf,
    min_chunk: AtomicU64,
    flush_download: std::sync::atomic::AtomicBool,
    flush_upload: std::sync::atomic::AtomicBool,
}

struct HubHandle {
    hub_id: u64,
    dialect: HubDialect,
    cmd: mpsc::UnboundedSender<HubCommand>,
    cfg: Arc<RwLock<HubConfig>>,
    addr_text: String,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// The client core. Create with [`Core::new`], connect hubs and queue
/// work through the command channel, consume [`Notice`]s, and drive
/// everything with [`Core::run`].
pub struct Core {
    cfg: Config,
    pid: [u8; 24],
    cid: Cid,
    share: Arc<ShareIndex>,
    store: Arc<dyn DlStore>,
    queue: Arc<Mutex<Queue>>,
    kick: Arc<Notify>,
    ctx: Arc<DlCtx>,
    slots: Arc<SlotTable>,
    down_bucket: Bucket,
    up_bucket: Bucket,
    hash_bucket: Bucket,
    tls: Arc<TlsSetup>,
    hubs: HashMap<u64, HubHandle>,
    users: Arc<RwLock<HashMap<Uid, HubUser>>>,
    peers: HashMap<Uid, mpsc::UnboundedSender<Root>>,
    tokens: Arc<Mutex<HashMap<String, Uid>>>,
    registry: SearchRegistry,
    next_hub_id: u64,
    next_token: u64,
    download_slots: Arc<AtomicU32>,
    notices: mpsc::UnboundedSender<Notice>,
    commands: mpsc::UnboundedReceiver<CoreCommand>,
    hub_ev_tx: mpsc::UnboundedSender<(u64, HubEvent)>,
    hub_ev_rx: mpsc::UnboundedReceiver<(u64, HubEvent)>,
    worker_tx: mpsc::UnboundedSender<WorkerMsg>,
    worker_rx: mpsc::UnboundedReceiver<WorkerMsg>,
    udp_proxy_tx: mpsc::UnboundedSender<OutDatagram>,
    udp_proxy_rx: mpsc::UnboundedReceiver<OutDatagram>,
}

impl Core {
    /// Build a core. Returns the core, the notice stream and the
    /// command sender.
    #[must_use]
    pub fn new(
        cfg: Config,
        store: Arc<dyn DlStore>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Notice>,
        mpsc::UnboundedSender<CoreCommand>,
    ) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (hub_ev_tx, hub_ev_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (udp_proxy_tx, udp_proxy_rx) = mpsc::unbounded_channel();

        let pid: [u8; 24] = rand::random();
        let cid = cid_from_pid(&pid);
        let queue = Arc::new(Mutex::new(Queue::new()));
        let kick = Arc::new(Notify::new());
        let down_bucket = Bucket::new(cfg.download_rate);
        let up_bucket = Bucket::new(cfg.upload_rate);
        let hash_bucket = Bucket::new(cfg.hash_rate);
        let identity = driftdc_net::ClientIdentity::generate("driftdc")
            .map(Arc::new)
            .ok();
        let tls = Arc::new(TlsSetup::new(identity));
        let slots = Arc::new(SlotTable::new(
            cfg.upload_slots,
            cfg.minislots,
            cfg.minislot_size,
            cfg.max_ul_per_user,
        ));
        let ctx = Arc::new(DlCtx {
            queue: Arc::clone(&queue),
            store: Arc::clone(&store),
            kick: Arc::clone(&kick),
            segs: Mutex::new(HashMap::new()),
            notices: notice_tx.clone(),
            incoming_dir: cfg.incoming_dir.clone(),
            min_chunk: AtomicU64::new(cfg.download_segment),
            flush_download: std::sync::atomic::AtomicBool::new(cfg.flush_file_cache.download),
            flush_upload: std::sync::atomic::AtomicBool::new(cfg.flush_file_cache.upload),
        });
        let download_slots = Arc::new(AtomicU32::new(cfg.download_slots));

        let core = Self {
            cfg,
            pid,
            cid,
            share: Arc::new(ShareIndex::new()),
            store,
            queue,
            kick,
            ctx,
            slots,
            down_bucket,
            up_bucket,
            hash_bucket,
            tls,
            hubs: HashMap::new(),
            users: Arc::new(RwLock::new(HashMap::new())),
            peers: HashMap::new(),
            tokens: Arc::new(Mutex::new(HashMap::new())),
            registry: SearchRegistry::new(),
            next_hub_id: 1,
            next_token: 1,
            download_slots,
            notices: notice_tx,
            commands: cmd_rx,
            hub_ev_tx,
            hub_ev_rx,
            worker_tx,
            worker_rx,
            udp_proxy_tx,
            udp_proxy_rx,
        };
        (core, notice_rx, cmd_tx)
    }

    /// The local share index.
    #[must_use]
    pub fn share(&self) -> Arc<ShareIndex> {
        Arc::clone(&self.share)
    }

    fn notice(&self, n: Notice) {
        let _ = self.notices.send(n);
    }

    fn restore_queue(&self) {
        let mut queue = lock(&self.queue);
        for row in self.store.list_dls() {
            let Ok(hash) = Root::from_base32(&row.tth) else {
                continue;
            };
            let mut item = DlItem::new(hash, row.size, row.dest, false);
            item.priority = Priority::from_code(row.prio);
            item.error = DlError::from_code(row.err);
            item.error_msg = row.err_msg;
            if let Some(blob) = self.store.get_tthl(hash) {
                if let Ok(leaves) = verify_leaves(&blob, row.size, hash) {
                    item.tthl = Some(leaves);
                }
            }
            queue.insert(item);
        }
        for row in self.store.list_dl_sources() {
            let Ok(hash) = Root::from_base32(&row.tth) else {
                continue;
            };
            let uid = Uid(row.uid);
            queue.add_source(hash, uid);
            if row.err != 0 {
                queue.source_error(uid, hash, DlError::from_code(row.err), row.err_msg);
            }
            // File lists are recognized by their pseudo-hash.
            if filelist_hash(uid) == hash {
                if let Some(item) = queue.item_mut(hash) {
                    item.islist = true;
                }
            }
        }
    }

    /// Drive the core until the command channel closes.
    pub async fn run(mut self) {
        std::fs::create_dir_all(&self.cfg.incoming_dir).ok();
        std::fs::create_dir_all(&self.cfg.download_dir).ok();
        self.restore_queue();
        if let Err(e) = self
            .share
            .rebuild(&self.cfg, self.hash_bucket.clone())
            .await
        {
            tracing::warn!(error = %e, "initial share build failed");
        }

        // Scheduler task, kicked through the shared notify.
        let scheduler = Scheduler::with_notify(Arc::clone(&self.queue), Arc::clone(&self.kick));
        let (sched_tx, mut sched_rx) = mpsc::unbounded_channel();
        let slots_src = Arc::clone(&self.download_slots);
        tokio::spawn(scheduler.run(move || slots_src.load(Ordering::Relaxed), sched_tx));

        // UDP pair.
        let udp_port = if self.cfg.active_udp_port != 0 {
            self.cfg.active_udp_port
        } else {
            self.cfg.active_port
        };
        let mut udp = match UdpPair::bind(udp_port, None, None).await {
            Ok(udp) => Some(udp),
            Err(e) => {
                tracing::warn!(error = %e, "UDP bind failed, passive search replies only");
                None
            }
        };

        // Peer listener in active mode.
        let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();
        if self.cfg.active {
            match tokio::net::TcpListener::bind(("0.0.0.0", self.cfg.active_port)).await {
                Ok(listener) => {
                    tokio::spawn(async move {
                        loop {
                            match listener.accept().await {
                                Ok((stream, _)) => {
                                    if incoming_tx.send(stream).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!(error = %e, "accept failed");
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "peer listener bind failed");
                }
            }
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => return,
                },
                Some((hub_id, ev)) = self.hub_ev_rx.recv() => {
                    self.handle_hub_event(hub_id, ev);
                }
                Some(action) = sched_rx.recv() => {
                    self.handle_sched_action(action);
                }
                Some(msg) = self.worker_rx.recv() => {
                    self.handle_worker_msg(msg);
                }
                Some(dgram) = self.udp_proxy_rx.recv() => {
                    if let Some(udp) = &udp {
                        udp.send(dgram.to, dgram.payload);
                    }
                }
                Some(dgram) = async {
                    match &mut udp {
                        Some(u) => u.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.handle_udp(&dgram.payload);
                }
                Some(stream) = incoming_rx.recv() => {
                    self.spawn_incoming(stream);
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: CoreCommand) {
        match cmd {
            CoreCommand::AddHub {
                url,
                nick,
                password,
                encoding,
            } => match HubAddr::parse(&url) {
                Ok(addr) => self.add_hub(addr, nick, password, encoding),
                Err(e) => self.notice(Notice::Hub {
                    hub_id: 0,
                    text: format!("cannot connect {url}: {e}"),
                }),
            },
            CoreCommand::Chat { hub_id, text } => {
                if let Some(hub) = self.hubs.get(&hub_id) {
                    let _ = hub.cmd.send(HubCommand::Chat(text));
                }
            }
            CoreCommand::Search {
                kind,
                size,
                terms,
                tth,
            } => {
                let sudp = self.cfg.sudp_policy == SudpPolicy::Prefer;
                let id = self.registry.register(kind, size, terms, tth, sudp);
                for hub in self.hubs.values() {
                    if let Some(spec) = self.registry.spec_for_hub(id, hub.hub_id) {
                        let _ = hub.cmd.send(HubCommand::Search(spec));
                    }
                }
            }
            CoreCommand::Download {
                uid,
                tth,
                size,
                name,
            } => self.queue_download(uid, tth, size, &name),
            CoreCommand::DownloadFilelist { uid } => self.queue_filelist(uid),
            CoreCommand::SetConfig(cfg) => self.apply_config(*cfg),
            CoreCommand::RefreshShare => {
                if let Err(e) = self
                    .share
                    .rebuild(&self.cfg, self.hash_bucket.clone())
                    .await
                {
                    tracing::warn!(error = %e, "share rebuild failed");
                }
                for hub in self.hubs.values() {
                    let _ = hub.cmd.send(HubCommand::UpdateInfo);
                }
            }
        }
    }

    fn add_hub(
        &mut self,
        addr: HubAddr,
        nick: Option<String>,
        password: Option<String>,
        encoding: Option<String>,
    ) {
        let hub_id = self.next_hub_id;
        self.next_hub_id += 1;
        let mut hub_cfg = HubConfig {
            nick: nick.unwrap_or_else(|| self.cfg.nick.clone()),
            password,
            active: self.cfg.active,
            active_ip: self.cfg.active_ip,
            active_port: self.cfg.active_port,
            active_udp_port: self.cfg.active_udp_port,
            upload_slots: self.cfg.upload_slots,
            slots_free: self.slots.free(),
            reconnect_timeout: self.cfg.reconnect_timeout,
            sudp_policy: self.cfg.sudp_policy,
            hub_addr: format!("{}:{}", addr.host, addr.port),
            ..HubConfig::default()
        };
        if addr.dialect == HubDialect::Nmdc {
            hub_cfg.encoding = encoding
                .as_deref()
                .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()))
                .unwrap_or(encoding_rs::WINDOWS_1252);
        }
        let hub = Hub::new(hub_id, addr.clone(), hub_cfg, self.pid);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = HubHandle {
            hub_id,
            dialect: addr.dialect,
            cmd: cmd_tx,
            cfg: Arc::clone(&hub.cfg),
            addr_text: format!("{}:{}", addr.host, addr.port),
        };
        let deps = HubDeps {
            share: Arc::clone(&self.share.list),
            tls: Arc::clone(&self.tls),
            udp_out: self.udp_proxy_tx.clone(),
            events: self.hub_ev_tx.clone(),
            local_address: self.cfg.local_address,
        };
        tokio::spawn(hub.run(deps, cmd_rx));
        self.hubs.insert(hub_id, handle);
        self.notice(Notice::Hub {
            hub_id,
            text: format!("connecting to {}", addr.to_url()),
        });
    }

    fn handle_hub_event(&mut self, hub_id: u64, ev: HubEvent) {
        match ev {
            HubEvent::StateChanged(state) => {
                self.notice(Notice::HubState { hub_id, state });
            }
            HubEvent::LoggedIn => {
                self.notice(Notice::Hub {
                    hub_id,
                    text: "logged in".into(),
                });
            }
            HubEvent::UserJoined(user) | HubEvent::UserInfo(user) => {
                let uid = user.uid;
                if let Ok(mut users) = self.users.write() {
                    users.insert(uid, user);
                }
                let mut queue = lock(&self.queue);
                queue.set_online(uid, true);
                drop(queue);
                self.kick.notify_one();
            }
            HubEvent::UserQuit(uid) => {
                if let Ok(mut users) = self.users.write() {
                    users.remove(&uid);
                }
                let mut queue = lock(&self.queue);
                queue.set_online(uid, false);
                drop(queue);
                if self.cfg.disconnect_offline {
                    self.peers.remove(&uid);
                }
                self.kick.notify_one();
            }
            HubEvent::Chat { from, text } => {
                let from = from.and_then(|uid| self.nick_of(uid));
                self.notice(Notice::Chat {
                    hub_id,
                    from,
                    text,
                });
            }
            HubEvent::Private { from, text } => {
                let from = self.nick_of(from).unwrap_or_else(|| from.to_string());
                self.notice(Notice::Private {
                    hub_id,
                    from,
                    text,
                });
            }
            HubEvent::Result(result) => self.dispatch_result(result),
            HubEvent::ConnectToMe {
                uid,
                addr,
                tls,
                token,
            } => self.spawn_dial(hub_id, addr, tls, token, uid),
            HubEvent::RevConnectToMe { uid, token } => {
                // A passive peer asks us (active) to invite it in.
                if self.cfg.active {
                    let token = match token {
                        Some(t) => t,
                        None => self.make_token(uid),
                    };
                    if let Some(hub) = self.hubs.get(&hub_id) {
                        let _ = hub.cmd.send(HubCommand::RequestConnection { uid, token });
                    }
                } else {
                    tracing::debug!(%uid, "both sides passive, cannot connect");
                }
            }
            HubEvent::PasswordNeeded => self.notice(Notice::PasswordNeeded { hub_id }),
            HubEvent::HubMessage(text) => self.notice(Notice::Hub { hub_id, text }),
            HubEvent::Closed { reason, reconnect } => {
                self.notice(Notice::Hub {
                    hub_id,
                    text: format!(
                        "disconnected: {reason}{}",
                        if reconnect { " (reconnecting)" } else { "" }
                    ),
                });
                // Everyone seen through this hub is gone.
                let gone: Vec<Uid> = self
                    .users
                    .read()
                    .map(|u| {
                        u.values()
                            .filter(|hu| hu.hub_id == hub_id)
                            .map(|hu| hu.uid)
                            .collect()
                    })
                    .unwrap_or_default();
                if let Ok(mut users) = self.users.write() {
                    users.retain(|_, hu| hu.hub_id != hub_id);
                }
                let mut queue = lock(&self.queue);
                for uid in gone {
                    queue.set_online(uid, false);
                }
            }
        }
    }

    fn nick_of(&self, uid: Uid) -> Option<String> {
        self.users
            .read()
            .ok()
            .and_then(|u| u.get(&uid).map(|hu| hu.nick.clone()))
    }

    fn dispatch_result(&mut self, result: SearchResult) {
        for query in self.registry.matching(&result) {
            self.notice(Notice::SearchHit {
                query,
                result: result.clone(),
            });
        }
    }

    fn handle_udp(&mut self, payload: &[u8]) {
        match self.registry.parse_udp(payload) {
            Some(UdpHit::Adc { result, query }) => {
                self.notice(Notice::SearchHit { query, result });
            }
            Some(UdpHit::Nmdc(sr)) => {
                // Map the hub address in the result back to a session to
                // derive the uid from the nick.
                let hub_id = self
                    .hubs
                    .values()
                    .find(|h| h.addr_text == sr.hub_addr)
                    .map(|h| h.hub_id)
                    .or_else(|| self.hubs.values().find(|h| h.dialect == HubDialect::Nmdc).map(|h| h.hub_id));
                let Some(hub_id) = hub_id else {
                    tracing::debug!(hub = sr.hub_addr, "UDP result from unknown hub");
                    return;
                };
                let uid = uid_from_nick(hub_id, &sr.nick);
                let tth = sr
                    .tth
                    .as_deref()
                    .and_then(|t| Root::from_base32(t).ok());
                self.dispatch_result(SearchResult {
                    uid,
                    path: sr.path,
                    size: sr.size,
                    slots_free: sr.slots_free,
                    tth,
                });
            }
            None => {
                tracing::debug!(len = payload.len(), "undecodable search datagram");
            }
        }
    }

    fn make_token(&mut self, uid: Uid) -> String {
        self.next_token += 1;
        let token = format!("D{:x}N{:x}", uid.0, self.next_token);
        lock(&self.tokens).insert(token.clone(), uid);
        token
    }

    fn handle_sched_action(&mut self, action: SchedAction) {
        match action {
            SchedAction::Dial(uid) => {
                let Some(hub_id) = self
                    .users
                    .read()
                    .ok()
                    .and_then(|u| u.get(&uid).map(|hu| hu.hub_id))
                else {
                    let mut queue = lock(&self.queue);
                    queue.set_online(uid, false);
                    return;
                };
                let token = self.make_token(uid);
                if let Some(hub) = self.hubs.get(&hub_id) {
                    let _ = hub.cmd.send(HubCommand::RequestConnection { uid, token });
                }
                // EXP is bounded: no handshake within the wait window
                // puts the user into WAI.
                let queue = Arc::clone(&self.queue);
                let kick = Arc::clone(&self.kick);
                tokio::spawn(async move {
                    tokio::time::sleep(WAIT_TIMEOUT).await;
                    let mut q = lock(&queue);
                    if q.user(uid).map(|u| u.state)
                        == Some(driftdc_transfer::UserState::Exp)
                    {
                        q.mark_wait(uid, Instant::now());
                        drop(q);
                        kick.notify_one();
                    }
                });
            }
            SchedAction::Assign { uid, hash } => {
                match self.peers.get(&uid) {
                    Some(tx) if tx.send(hash).is_ok() => {}
                    _ => {
                        self.peers.remove(&uid);
                        let mut queue = lock(&self.queue);
                        queue.mark_wait(uid, Instant::now());
                        drop(queue);
                        self.kick.notify_one();
                    }
                }
            }
        }
    }

    fn handle_worker_msg(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::PeerReady { uid, assign } => {
                self.peers.insert(uid, assign);
                let mut queue = lock(&self.queue);
                queue.mark_connected(uid);
                drop(queue);
                self.kick.notify_one();
            }
            WorkerMsg::PeerGone { uid } => {
                self.peers.remove(&uid);
                self.kick.notify_one();
            }
        }
    }

    fn queue_download(&mut self, uid: Uid, tth: Root, size: u64, name: &str) {
        if !self.cfg.download_shared && self.share.resolve_tth(tth).is_some() {
            self.notice(Notice::Hub {
                hub_id: 0,
                text: format!("{name}: already shared, not queued"),
            });
            return;
        }
        if let Some(re) = self
            .cfg
            .download_exclude
            .as_deref()
            .and_then(|e| regex::Regex::new(e).ok())
        {
            if re.is_match(name) {
                return;
            }
        }
        if size == 0 {
            tracing::warn!(name, "zero-length download queued; nothing defines its completion");
        }
        let dest = self.cfg.download_dir.join(name);
        {
            let mut queue = lock(&self.queue);
            if queue.item(tth).is_none() {
                queue.insert(DlItem::new(tth, size, dest.clone(), false));
                self.store.insert_dl(DlRow {
                    tth: tth.to_base32(),
                    size,
                    dest,
                    prio: Priority::default().code(),
                    err: 0,
                    err_msg: None,
                    tthl_len: 0,
                });
            }
            queue.add_source(tth, uid);
            let online = self
                .users
                .read()
                .is_ok_and(|u| u.contains_key(&uid));
            queue.set_online(uid, online);
        }
        self.store.insert_source(DlSourceRow {
            tth: tth.to_base32(),
            uid: uid.0,
            err: 0,
            err_msg: None,
        });
        self.kick.notify_one();
    }

    fn queue_filelist(&mut self, uid: Uid) {
        let hash = filelist_hash(uid);
        let dest = self
            .cfg
            .incoming_dir
            .join(format!("{uid}.files.xml.bz2"));
        // A fresh enough cached list is served as-is.
        if let Ok(meta) = std::fs::metadata(&dest) {
            let fresh = meta
                .modified()
                .ok()
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age.as_secs() < self.cfg.filelist_maxage);
            if fresh {
                self.notice(Notice::FilelistReady { uid, path: dest });
                return;
            }
        }
        {
            let mut queue = lock(&self.queue);
            if queue.item(hash).is_none() {
                let mut item = DlItem::new(hash, 0, dest, true);
                item.islist = true;
                queue.insert(item);
            }
            queue.add_source(hash, uid);
            let online = self
                .users
                .read()
                .is_ok_and(|u| u.contains_key(&uid));
            queue.set_online(uid, online);
        }
        self.kick.notify_one();
    }

    fn apply_config(&mut self, cfg: Config) {
        self.down_bucket.set_rate(cfg.download_rate);
        self.up_bucket.set_rate(cfg.upload_rate);
        self.hash_bucket.set_rate(cfg.hash_rate);
        self.slots.reconfigure(
            cfg.upload_slots,
            cfg.minislots,
            cfg.minislot_size,
            cfg.max_ul_per_user,
        );
        self.download_slots
            .store(cfg.download_slots, Ordering::Relaxed);
        self.ctx
            .min_chunk
            .store(cfg.download_segment, Ordering::Relaxed);
        self.ctx
            .flush_download
            .store(cfg.flush_file_cache.download, Ordering::Relaxed);
        self.ctx
            .flush_upload
            .store(cfg.flush_file_cache.upload, Ordering::Relaxed);
        for hub in self.hubs.values() {
            if let Ok(mut hc) = hub.cfg.write() {
                hc.nick = cfg.nick.clone();
                hc.upload_slots = cfg.upload_slots;
                hc.reconnect_timeout = cfg.reconnect_timeout;
                hc.sudp_policy = cfg.sudp_policy;
            }
            let _ = hub.cmd.send(HubCommand::UpdateInfo);
        }
        self.cfg = cfg;
        // A slot change may enable progress right away.
        self.kick.notify_one();
    }

    /// Dial a peer that asked us to connect (CTM).
    fn spawn_dial(
        &mut self,
        hub_id: u64,
        addr: String,
        tls: bool,
        token: Option<String>,
        expected_uid: Option<Uid>,
    ) {
        let Some(hub) = self.hubs.get(&hub_id) else {
            return;
        };
        let dialect = hub.dialect;
        let own_nick = hub
            .cfg
            .read()
            .map(|c| c.nick.clone())
            .unwrap_or_default();
        let cid = self.cid;
        let queue = Arc::clone(&self.queue);
        let ctx = Arc::clone(&self.ctx);
        let users = Arc::clone(&self.users);
        let worker_tx = self.worker_tx.clone();
        let share = Arc::clone(&self.share);
        let slots = Arc::clone(&self.slots);
        let tls_setup = Arc::clone(&self.tls);
        let buckets = (self.down_bucket.clone(), self.up_bucket.clone());
        let kick = Arc::clone(&self.kick);
        let local = self.cfg.local_address;

        tokio::spawn(async move {
            let Some((host, port)) = addr.rsplit_once(':') else {
                return;
            };
            let Ok(port) = port.parse::<u16>() else {
                return;
            };
            let opts = ConnectOpts {
                in_bucket: Some(buckets.0),
                out_bucket: Some(buckets.1),
                local_v4: match local {
                    Some(std::net::IpAddr::V4(ip)) => Some(ip),
                    _ => None,
                },
                local_v6: match local {
                    Some(std::net::IpAddr::V6(ip)) => Some(ip),
                    _ => None,
                },
                ..ConnectOpts::default()
            };
            let mut conn = match Connection::connect(host, port, opts).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!(addr, error = %e, "peer dial failed");
                    if let Some(uid) = expected_uid {
                        lock(&queue).mark_wait(uid, Instant::now());
                        kick.notify_one();
                    }
                    return;
                }
            };
            if tls {
                if let Err(e) = conn.start_tls(&tls_setup, host, None).await {
                    tracing::debug!(addr, error = %e, "peer TLS failed");
                    return;
                }
            }
            let peer = match dialect {
                HubDialect::Nmdc => {
                    let queue_ref = Arc::clone(&queue);
                    let users_ref = Arc::clone(&users);
                    let want = move |nick: Option<&str>| -> bool {
                        let Some(nick) = nick else { return false };
                        let Some(uid) = find_uid_by_nick(&users_ref, nick) else {
                            return false;
                        };
                        lock(&queue_ref).top_enabled(uid).is_some()
                    };
                    handshake_nmdc(
                        conn,
                        NmdcHandshake {
                            own_nick: &own_nick,
                            initiator: true,
                            want_download: &want,
                        },
                    )
                    .await
                }
                HubDialect::Adc => {
                    let download = expected_uid
                        .is_some_and(|uid| lock(&queue).top_enabled(uid).is_some());
                    handshake_adc(conn, &cid, token.as_deref().unwrap_or(""), download).await
                }
            };
            let mut peer = match peer {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::debug!(addr, error = %e, "peer handshake failed");
                    return;
                }
            };
            let uid = expected_uid.or_else(|| match dialect {
                HubDialect::Nmdc => peer
                    .peer_nick
                    .as_deref()
                    .map(|n| uid_from_nick(hub_id, n)),
                HubDialect::Adc => peer.peer_cid.map(|c| uid_from_cid(hub_id, &c)),
            });
            let Some(uid) = uid else {
                peer.disconnect();
                return;
            };
            peer.uid = Some(uid);
            finish_handshake(peer, uid, ctx, worker_tx, share, slots).await;
        });
    }

    /// Handle an accepted incoming peer connection.
    fn spawn_incoming(&mut self, stream: tokio::net::TcpStream) {
        let own_nick = self.cfg.nick.clone();
        let cid = self.cid;
        let queue = Arc::clone(&self.queue);
        let ctx = Arc::clone(&self.ctx);
        let users = Arc::clone(&self.users);
        let tokens = Arc::clone(&self.tokens);
        let worker_tx = self.worker_tx.clone();
        let share = Arc::clone(&self.share);
        let slots = Arc::clone(&self.slots);
        let buckets = (self.down_bucket.clone(), self.up_bucket.clone());

        tokio::spawn(async move {
            let opts = ConnectOpts {
                in_bucket: Some(buckets.0),
                out_bucket: Some(buckets.1),
                ..ConnectOpts::default()
            };
            let Ok(mut conn) = Connection::from_accepted(stream, opts) else {
                return;
            };
            let Ok(first) = conn.peek_bytes(1).await else {
                return;
            };
            if first[0] == b'$' {
                let queue_ref = Arc::clone(&queue);
                let users_ref = Arc::clone(&users);
                let want = move |nick: Option<&str>| -> bool {
                    let Some(nick) = nick else { return false };
                    let Some(uid) = find_uid_by_nick(&users_ref, nick) else {
                        return false;
                    };
                    lock(&queue_ref).top_enabled(uid).is_some()
                };
                let peer = handshake_nmdc(
                    conn,
                    NmdcHandshake {
                        own_nick: &own_nick,
                        initiator: false,
                        want_download: &want,
                    },
                )
                .await;
                let mut peer = match peer {
                    Ok(peer) => peer,
                    Err(e) => {
                        tracing::debug!(error = %e, "incoming NMDC handshake failed");
                        return;
                    }
                };
                let Some(uid) = peer
                    .peer_nick
                    .as_deref()
                    .and_then(|n| find_uid_by_nick(&users, n))
                else {
                    tracing::debug!("incoming connection from unknown nick");
                    peer.disconnect();
                    return;
                };
                peer.uid = Some(uid);
                finish_handshake(peer, uid, ctx, worker_tx, share, slots).await;
            } else {
                let peer = handshake_adc(conn, &cid, "", false).await;
                let mut peer = match peer {
                    Ok(peer) => peer,
                    Err(e) => {
                        tracing::debug!(error = %e, "incoming ADC handshake failed");
                        return;
                    }
                };
                // Our own token in the peer's CINF means we asked for
                // this connection to download.
                let token_uid = peer
                    .peer_token
                    .as_deref()
                    .and_then(|t| lock(&tokens).remove(t));
                let uid = token_uid.or_else(|| {
                    peer.peer_cid.and_then(|c| find_uid_by_cid(&users, &c))
                });
                let Some(uid) = uid else {
                    tracing::debug!("incoming connection from unknown CID");
                    peer.disconnect();
                    return;
                };
                peer.uid = Some(uid);
                if token_uid.is_some() && lock(&queue).top_enabled(uid).is_some() {
                    peer.direction = Direction::Download;
                }
                finish_handshake(peer, uid, ctx, worker_tx, share, slots).await;
            }
        });
    }
}

fn find_uid_by_nick(users: &Arc<RwLock<HashMap<Uid, HubUser>>>, nick: &str) -> Option<Uid> {
    users
        .read()
        .ok()?
        .values()
        .find(|u| u.nick == nick)
        .map(|u| u.uid)
}

fn find_uid_by_cid(users: &Arc<RwLock<HashMap<Uid, HubUser>>>, cid: &Cid) -> Option<Uid> {
    users
        .read()
        .ok()?
        .values()
        .find(|u| u.cid.as_ref() == Some(cid))
        .map(|u| u.uid)
}

/// Route a freshly negotiated peer connection to the right side.
async fn finish_handshake(
    peer: PeerConn,
    uid: Uid,
    ctx: Arc<DlCtx>,
    worker_tx: mpsc::UnboundedSender<WorkerMsg>,
    share: Arc<ShareIndex>,
    slots: Arc<SlotTable>,
) {
    match peer.direction {
        Direction::Download => {
            let (assign_tx, assign_rx) = mpsc::unbounded_channel();
            let _ = worker_tx.send(WorkerMsg::PeerReady {
                uid,
                assign: assign_tx,
            });
            download_worker(peer, uid, assign_rx, ctx, worker_tx).await;
        }
        Direction::Upload => {
            let flush = ctx.flush_upload.load(Ordering::Relaxed);
            serve_uploads(peer, uid, &*share, &slots, flush).await;
        }
    }
}

/// One download worker: owns the connection, executes assignments until
/// the channel closes or the connection dies.
async fn download_worker(
    mut peer: PeerConn,
    uid: Uid,
    mut assignments: mpsc::UnboundedReceiver<Root>,
    ctx: Arc<DlCtx>,
    worker_tx: mpsc::UnboundedSender<WorkerMsg>,
) {
    while let Some(hash) = assignments.recv().await {
        match run_transfer(&mut peer, uid, hash, &ctx).await {
            Ok(()) => {
                lock(&ctx.queue).mark_idle(uid);
                ctx.kick.notify_one();
            }
            Err(fatal_conn) => {
                let mut queue = lock(&ctx.queue);
                if fatal_conn {
                    queue.mark_wait(uid, Instant::now());
                } else {
                    queue.mark_idle(uid);
                }
                drop(queue);
                ctx.kick.notify_one();
                if fatal_conn {
                    break;
                }
            }
        }
    }
    peer.disconnect();
    let _ = worker_tx.send(WorkerMsg::PeerGone { uid });
}

/// Execute one item on a connected peer. `Err(true)` means the
/// connection is unusable; `Err(false)` demoted the source but the
/// connection survives.
async fn run_transfer(
    peer: &mut PeerConn,
    uid: Uid,
    hash: Root,
    ctx: &Arc<DlCtx>,
) -> Result<(), bool> {
    let Some(item) = lock(&ctx.queue).item(hash).cloned() else {
        return Ok(());
    };

    if item.islist {
        return fetch_filelist(peer, uid, &item, ctx).await;
    }

    // Leaf array first.
    let leaves = match &item.tthl {
        Some(leaves) => leaves.clone(),
        None if item.size < MIN_TTHL_SIZE => Leaves::single(hash, item.size),
        None => match peer.fetch_tthl(hash).await {
            Ok(blob) => match verify_leaves(&blob, item.size, hash) {
                Ok(mut leaves) => {
                    leaves.compact();
                    ctx.store.set_tthl(hash, &leaves.to_bytes());
                    if let Some(it) = lock(&ctx.queue).item_mut(hash) {
                        it.tthl = Some(leaves.clone());
                    }
                    leaves
                }
                Err(_) => {
                    record_source_error(ctx, uid, hash, DlError::InvTthl, "bad TTHL");
                    return Err(false);
                }
            },
            Err(e) => return Err(map_peer_error(ctx, uid, hash, &e)),
        },
    };

    let seg = {
        let mut segs = lock(&ctx.segs);
        match segs.get(&hash) {
            Some(seg) => Arc::clone(seg),
            None => {
                let path = item.incoming_path(&ctx.incoming_dir);
                let saved = ctx.store.get_bitmap(hash);
                match SegmentedFile::open(&path, hash, item.size, leaves, saved.as_deref()) {
                    Ok(seg) => {
                        let seg = Arc::new(Mutex::new(seg));
                        segs.insert(hash, Arc::clone(&seg));
                        seg
                    }
                    Err(e) => {
                        drop(segs);
                        record_item_error(ctx, hash, DlError::IoInc, &e.to_string(), &item);
                        return Err(false);
                    }
                }
            }
        }
    };

    let min_chunk = ctx.min_chunk.load(Ordering::Relaxed);
    let max_chunk = min_chunk.max(8 * 1024 * 1024);
    loop {
        let (chunk, allbusy, have) = {
            let mut seg = lock(&seg);
            (seg.assign(min_chunk, max_chunk), seg.allbusy(), seg.have())
        };
        if let Some(item) = lock(&ctx.queue).item_mut(hash) {
            item.allbusy = allbusy;
            item.have = have;
        }
        let Some(chunk) = chunk else {
            break;
        };

        let seg_ref = Arc::clone(&seg);
        let mut push_err: Option<TransferError> = None;
        let fetched = peer
            .fetch_range(
                &Wanted::File(hash),
                chunk.offset,
                chunk.len,
                |data| match lock(&seg_ref).push(chunk.id, data) {
                    Ok(()) => true,
                    Err(e) => {
                        push_err = Some(e);
                        false
                    }
                },
            )
            .await;

        // Persist verification progress after every chunk.
        let (bits, have) = {
            let mut seg = lock(&seg);
            (seg.take_dirty_bitmap(), seg.have())
        };
        if let Some(bits) = bits {
            ctx.store.set_bitmap(hash, &bits);
        }
        if let Some(item) = lock(&ctx.queue).item_mut(hash) {
            item.have = have;
        }

        if let Some(e) = push_err {
            lock(&seg).release(chunk.id);
            if matches!(e, TransferError::HashMismatch) {
                record_source_error(ctx, uid, hash, DlError::Hash, "block hash mismatch");
                // The item fails outright only when no other source can
                // still be tried.
                let exhausted = {
                    let queue = lock(&ctx.queue);
                    queue
                        .item(hash)
                        .is_some_and(|i| {
                            i.sources
                                .iter()
                                .all(|(_, s)| s.error != DlError::None)
                        })
                };
                if exhausted {
                    record_item_error(ctx, hash, DlError::Hash, "hash mismatch on all sources", &item);
                }
                return Err(false);
            }
            record_item_error(ctx, hash, DlError::IoInc, &e.to_string(), &item);
            return Err(false);
        }
        if let Err(e) = fetched {
            lock(&seg).release(chunk.id);
            return Err(map_peer_error(ctx, uid, hash, &e));
        }
        ctx.kick.notify_one();
    }

    let complete = lock(&seg).complete();
    if complete {
        lock(&ctx.segs).remove(&hash);
        let seg = match Arc::into_inner(seg) {
            Some(m) => m.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner),
            None => return Ok(()), // another worker still holds it
        };
        match seg.finish(&item.dest) {
            Ok(()) => {
                if ctx.flush_download.load(Ordering::Relaxed) {
                    if let Ok(f) = std::fs::File::open(&item.dest) {
                        driftdc_net::conn::advise_dontneed(&f);
                    }
                }
                ctx.store.remove_dl(hash);
                lock(&ctx.queue).remove_item(hash);
                let _ = ctx.notices.send(Notice::TransferDone {
                    dest: item.dest.clone(),
                });
            }
            Err(TransferError::DestIo(e)) => {
                record_item_error(ctx, hash, DlError::IoDest, &e.to_string(), &item);
            }
            Err(e) => {
                record_item_error(ctx, hash, DlError::IoInc, &e.to_string(), &item);
            }
        }
    }
    Ok(())
}

async fn fetch_filelist(
    peer: &mut PeerConn,
    uid: Uid,
    item: &DlItem,
    ctx: &Arc<DlCtx>,
) -> Result<(), bool> {
    match peer.fetch_all(&Wanted::FileList).await {
        Ok(blob) => {
            if let Err(e) = std::fs::write(&item.dest, &blob) {
                record_item_error(ctx, item.hash, DlError::IoDest, &e.to_string(), item);
                return Err(false);
            }
            ctx.store.remove_dl(item.hash);
            lock(&ctx.queue).remove_item(item.hash);
            let _ = ctx.notices.send(Notice::FilelistReady {
                uid,
                path: item.dest.clone(),
            });
            Ok(())
        }
        Err(e) => Err(map_peer_error(ctx, uid, item.hash, &e)),
    }
}

fn record_source_error(ctx: &Arc<DlCtx>, uid: Uid, hash: Root, err: DlError, msg: &str) {
    lock(&ctx.queue).source_error(uid, hash, err, Some(msg.to_owned()));
    ctx.store.set_uerr(uid, hash, err, Some(msg));
    ctx.kick.notify_one();
}

fn record_item_error(ctx: &Arc<DlCtx>, hash: Root, err: DlError, msg: &str, item: &DlItem) {
    lock(&ctx.queue).item_error(hash, err, Some(msg.to_owned()));
    ctx.store.set_status(hash, Priority::Err, err, Some(msg));
    let _ = ctx.notices.send(Notice::TransferFailed {
        dest: item.dest.clone(),
        reason: msg.to_owned(),
    });
    ctx.kick.notify_one();
}

/// Classify a peer-level error: source demotion for protocol and
/// availability failures, connection teardown for transport failures.
fn map_peer_error(ctx: &Arc<DlCtx>, uid: Uid, hash: Root, err: &TransferError) -> bool {
    match err {
        TransferError::NoFile => {
            record_source_error(ctx, uid, hash, DlError::NoFile, "file not available");
            false
        }
        TransferError::NoSlots => {
            // Not an error on the pairing; back off and retry later.
            true
        }
        TransferError::Protocol(msg) => {
            tracing::debug!(%uid, msg, "peer protocol error, dropping connection");
            true
        }
        TransferError::Net(e) => {
            tracing::debug!(%uid, error = %e, "peer transport error");
            true
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftdc_transfer::MemStore;

    fn new_core() -> (
        Core,
        mpsc::UnboundedReceiver<Notice>,
        tempfile::TempDir,
    ) {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config {
            incoming_dir: tmp.path().join("inc"),
            download_dir: tmp.path().join("dl"),
            ..Config::default()
        };
        let (core, notices, _cmd) = Core::new(cfg, Arc::new(MemStore::new()));
        (core, notices, tmp)
    }

    #[tokio::test]
    async fn queue_download_persists_and_kicks() {
        let (mut core, _notices, _cmd) = new_core();
        let uid = Uid(9);
        core.queue_download(uid, Root([1; 24]), 1000, "file.bin");
        let queue = lock(&core.queue);
        let item = queue.item(Root([1; 24])).unwrap();
        assert_eq!(item.size, 1000);
        assert!(item.sources.contains_key(&uid));
        drop(queue);
        assert_eq!(core.store.list_dls().len(), 1);
        assert_eq!(core.store.list_dl_sources().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_download_adds_source_only() {
        let (mut core, _n, _c) = new_core();
        core.queue_download(Uid(1), Root([1; 24]), 1000, "a");
        core.queue_download(Uid(2), Root([1; 24]), 1000, "a");
        assert_eq!(core.store.list_dls().len(), 1);
        assert_eq!(core.store.list_dl_sources().len(), 2);
        let queue = lock(&core.queue);
        assert_eq!(queue.item(Root([1; 24])).unwrap().sources.len(), 2);
    }

    #[tokio::test]
    async fn restore_queue_from_store() {
        let (core, _n, _c) = new_core();
        let hash = Root([5; 24]);
        core.store.insert_dl(DlRow {
            tth: hash.to_base32(),
            size: 4096,
            dest: "/dl/x".into(),
            prio: 1,
            err: 0,
            err_msg: None,
            tthl_len: 0,
        });
        core.store.insert_source(DlSourceRow {
            tth: hash.to_base32(),
            uid: 7,
            err: 2,
            err_msg: Some("gone".into()),
        });
        core.restore_queue();
        let queue = lock(&core.queue);
        let item = queue.item(hash).unwrap();
        assert_eq!(item.priority, Priority::High);
        assert_eq!(
            item.sources.get(&Uid(7)).unwrap().error,
            DlError::NoFile
        );
    }

    #[tokio::test]
    async fn filelist_queue_uses_pseudo_hash() {
        let (mut core, _n, _c) = new_core();
        std::fs::create_dir_all(&core.cfg.incoming_dir).unwrap();
        let uid = Uid(3);
        core.queue_filelist(uid);
        let queue = lock(&core.queue);
        let item = queue.item(filelist_hash(uid)).unwrap();
        assert!(item.islist);
    }

    #[tokio::test]
    async fn user_events_update_presence() {
        let (mut core, _n, _c) = new_core();
        let user = HubUser::from_nick(1, "alice");
        let uid = user.uid;
        core.queue_download(uid, Root([1; 24]), 10, "f");
        core.handle_hub_event(1, HubEvent::UserJoined(user));
        assert!(lock(&core.queue).user(uid).unwrap().online);
        core.handle_hub_event(1, HubEvent::UserQuit(uid));
        assert!(!lock(&core.queue).user(uid).unwrap().online);
    }

    #[tokio::test]
    async fn hub_close_marks_all_users_offline() {
        let (mut core, _n, _c) = new_core();
        let a = HubUser::from_nick(1, "a");
        let b = HubUser::from_nick(2, "b");
        let (ua, ub) = (a.uid, b.uid);
        core.queue_download(ua, Root([1; 24]), 10, "fa");
        core.queue_download(ub, Root([2; 24]), 10, "fb");
        core.handle_hub_event(1, HubEvent::UserJoined(a));
        core.handle_hub_event(2, HubEvent::UserJoined(b));
        core.handle_hub_event(
            1,
            HubEvent::Closed {
                reason: "x".into(),
                reconnect: true,
            },
        );
        let queue = lock(&core.queue);
        assert!(!queue.user(ua).unwrap().online);
        assert!(queue.user(ub).unwrap().online);
    }

    #[tokio::test]
    async fn tokens_round_trip() {
        let (mut core, _n, _c) = new_core();
        let t = core.make_token(Uid(4));
        assert_eq!(lock(&core.tokens).remove(&t), Some(Uid(4)));
    }
}
