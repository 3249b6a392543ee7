//! Client-client connections.
//!
//! One connection transfers one file at a time and is recycled between
//! transfers while idle. Both dialects are spoken: the legacy NMDC
//! handshake (`$MyNick`/`$Lock`/`$Direction`/`$Key`, then
//! `$ADCGET`/`$ADCSND`) and the ADC one (`CSUP`/`CINF`, then
//! `CGET`/`CSND`). The download side requests leaf arrays and byte
//! ranges; the upload side serves the share under slot and minislot
//! accounting.

use crate::TransferError;
use driftdc_hub::Uid;
use driftdc_net::Connection;
use driftdc_proto::adc::{self, AdcMessage, AdcType, Cid};
use driftdc_proto::nmdc;
use driftdc_tth::Root;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// NMDC direction negotiation number, 0..=32767.
fn direction_rand() -> u32 {
    rand::random::<u32>() % 32768
}

/// Negotiated peer wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerProto {
    /// NMDC client-client.
    Nmdc,
    /// ADC client-client.
    Adc,
}

/// What a download requests from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wanted {
    /// A byte range of a file addressed by its root.
    File(Root),
    /// The peer's file list.
    FileList,
    /// The leaf array of a file.
    Tthl(Root),
}

impl Wanted {
    fn kind(&self) -> &'static str {
        match self {
            Wanted::File(_) | Wanted::FileList => "file",
            Wanted::Tthl(_) => "tthl",
        }
    }

    fn ident(&self) -> String {
        match self {
            Wanted::File(root) | Wanted::Tthl(root) => format!("TTH/{root}"),
            Wanted::FileList => "files.xml.bz2".to_owned(),
        }
    }
}

/// Result of an NMDC direction negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We download on this connection.
    Download,
    /// We upload on this connection.
    Upload,
}

/// A negotiated client-client connection.
pub struct PeerConn {
    conn: Connection,
    proto: PeerProto,
    /// The peer, once identified (nick or CID matched to a hub user).
    pub uid: Option<Uid>,
    /// Peer nick from the NMDC handshake.
    pub peer_nick: Option<String>,
    /// Peer CID from the ADC handshake.
    pub peer_cid: Option<Cid>,
    /// Token the peer presented in its `CINF` (incoming ADC).
    pub peer_token: Option<String>,
    /// Which way this connection transfers.
    pub direction: Direction,
}

/// NMDC handshake inputs.
pub struct NmdcHandshake<'a> {
    /// Our nick on the hub this connection belongs to.
    pub own_nick: &'a str,
    /// Whether we dialed (the dialer speaks first).
    pub initiator: bool,
    /// Whether we have anything queued from the peer, decided once its
    /// nick is known (incoming connections reveal the nick first).
    pub want_download: &'a (dyn Fn(Option<&str>) -> bool + Send + Sync),
}

const NMDC_LOCK: &str = "EXTENDEDPROTOCOLABCABCABCABCABCABC";

async fn write_line(conn: &mut Connection, line: &str) -> Result<(), TransferError> {
    let mut bytes = line.as_bytes().to_vec();
    bytes.push(b'|');
    conn.write(&bytes).await.map_err(TransferError::Net)
}

/// Perform the NMDC client-client handshake.
///
/// # Errors
///
/// [`TransferError::Net`] on transport failure,
/// [`TransferError::Protocol`] when the peer deviates from the
/// handshake.
pub async fn handshake_nmdc(
    mut conn: Connection,
    hs: NmdcHandshake<'_>,
) -> Result<PeerConn, TransferError> {
    if hs.initiator {
        write_line(&mut conn, &format!("$MyNick {}", hs.own_nick)).await?;
        write_line(&mut conn, &format!("$Lock {NMDC_LOCK} Pk=driftdc")).await?;
    }

    let our_roll = direction_rand();
    let mut want_download = false;
    let mut peer_nick: Option<String> = None;
    let mut peer_dir: Option<(bool, u32)> = None;
    let mut got_key = false;

    while peer_nick.is_none() || peer_dir.is_none() || !got_key {
        let raw = conn.read_msg(b'|').await.map_err(TransferError::Net)?;
        let line = String::from_utf8_lossy(&raw).into_owned();
        let (cmd, args) = nmdc::split_command(&line);
        match cmd {
            "$MyNick" => {
                peer_nick = Some(args.to_owned());
                if !hs.initiator {
                    write_line(&mut conn, &format!("$MyNick {}", hs.own_nick)).await?;
                    write_line(&mut conn, &format!("$Lock {NMDC_LOCK} Pk=driftdc")).await?;
                }
            }
            "$Lock" => {
                let lock = args.split(' ').next().unwrap_or(args);
                want_download = (hs.want_download)(peer_nick.as_deref());
                let our_dir = if want_download { "Download" } else { "Upload" };
                write_line(&mut conn, "$Supports MiniSlots XmlBZList ADCGet TTHL TTHF")
                    .await?;
                write_line(&mut conn, &format!("$Direction {our_dir} {our_roll}")).await?;
                let mut key = b"$Key ".to_vec();
                key.extend_from_slice(&nmdc::lock_to_key(lock.as_bytes()));
                key.push(b'|');
                conn.write(&key).await.map_err(TransferError::Net)?;
            }
            // Keep-alives are empty messages.
            "" if args.is_empty() => {}
            "$Supports" => {}
            "$Direction" => {
                let mut parts = args.split(' ');
                let dir = parts.next().unwrap_or("");
                let roll: u32 = parts.next().and_then(|r| r.parse().ok()).unwrap_or(0);
                peer_dir = Some((dir == "Download", roll));
            }
            "$Key" => got_key = true,
            other => {
                return Err(TransferError::Protocol(format!(
                    "unexpected {other} during handshake"
                )));
            }
        }
    }

    let (peer_wants_download, peer_roll) = peer_dir.unwrap_or((false, 0));
    let direction = match (want_download, peer_wants_download) {
        (true, false) => Direction::Download,
        (false, _) => Direction::Upload,
        // Both want to download: the higher roll wins. Equal rolls go
        // to the peer; retrying is cheaper than deadlocking.
        (true, true) if our_roll > peer_roll => Direction::Download,
        (true, true) => Direction::Upload,
    };

    Ok(PeerConn {
        conn,
        proto: PeerProto::Nmdc,
        uid: None,
        peer_nick,
        peer_cid: None,
        peer_token: None,
        direction,
    })
}

/// Perform the ADC client-client handshake.
///
/// # Errors
///
/// As [`handshake_nmdc`]. ADC needs no direction roll: the token from
/// `CTM`/`RCM` already fixed who downloads.
pub async fn handshake_adc(
    mut conn: Connection,
    own_cid: &Cid,
    token: &str,
    download: bool,
) -> Result<PeerConn, TransferError> {
    let sup = AdcMessage::new(AdcType::C, adc::CMD_SUP)
        .arg("ADBASE")
        .arg("ADTIGR");
    let mut line = sup.to_line().into_bytes();
    line.push(b'\n');
    conn.write(&line).await.map_err(TransferError::Net)?;

    let mut peer_cid = None;
    let mut peer_token = None;
    let mut sent_inf = false;
    while peer_cid.is_none() {
        let raw = conn.read_msg(b'\n').await.map_err(TransferError::Net)?;
        if raw.is_empty() {
            continue;
        }
        let text = std::str::from_utf8(&raw)
            .map_err(|_| TransferError::Protocol("invalid UTF-8 from peer".into()))?;
        let msg = AdcMessage::parse(text)
            .map_err(|e| TransferError::Protocol(format!("bad handshake message: {e}")))?;
        match msg.command {
            adc::CMD_SUP => {
                if !sent_inf {
                    let inf = AdcMessage::new(AdcType::C, adc::CMD_INF)
                        .named("ID", own_cid.to_base32())
                        .named("TO", token);
                    let mut line = inf.to_line().into_bytes();
                    line.push(b'\n');
                    conn.write(&line).await.map_err(TransferError::Net)?;
                    sent_inf = true;
                }
            }
            adc::CMD_INF => {
                peer_cid = msg.param("ID").and_then(|c| Cid::parse(c).ok());
                peer_token = msg.param("TO").map(str::to_owned);
                if peer_cid.is_none() {
                    return Err(TransferError::Protocol("CINF without a CID".into()));
                }
            }
            adc::CMD_STA => {
                return Err(TransferError::Protocol(format!(
                    "peer status during handshake: {:?}",
                    msg.args
                )));
            }
            _ => {
                return Err(TransferError::Protocol(
                    "unexpected command during handshake".into(),
                ));
            }
        }
    }
    Ok(PeerConn {
        conn,
        proto: PeerProto::Adc,
        uid: None,
        peer_nick: None,
        peer_cid,
        peer_token,
        direction: if download {
            Direction::Download
        } else {
            Direction::Upload
        },
    })
}

/// A granted `SND` header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SndHeader {
    start: u64,
    len: u64,
}

impl PeerConn {
    /// The negotiated protocol.
    #[must_use]
    pub fn proto(&self) -> PeerProto {
        self.proto
    }

    /// Access the underlying connection (rate counters, address).
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    async fn send_get(&mut self, want: &Wanted, start: u64, len: i64) -> Result<(), TransferError> {
        match self.proto {
            PeerProto::Nmdc => {
                let line = format!("$ADCGET {} {} {start} {len}", want.kind(), want.ident());
                write_line(&mut self.conn, &line).await
            }
            PeerProto::Adc => {
                let msg = AdcMessage::new(AdcType::C, adc::CMD_GET)
                    .arg(want.kind())
                    .arg(want.ident())
                    .arg(start.to_string())
                    .arg(len.to_string());
                let mut bytes = msg.to_line().into_bytes();
                bytes.push(b'\n');
                self.conn.write(&bytes).await.map_err(TransferError::Net)
            }
        }
    }

    async fn read_snd(&mut self, want: &Wanted) -> Result<SndHeader, TransferError> {
        let eom = match self.proto {
            PeerProto::Nmdc => b'|',
            PeerProto::Adc => b'\n',
        };
        let raw = loop {
            let raw = self.conn.read_msg(eom).await.map_err(TransferError::Net)?;
            if !raw.is_empty() {
                break raw;
            }
        };
        let line = String::from_utf8_lossy(&raw).into_owned();
        match self.proto {
            PeerProto::Nmdc => {
                let (cmd, args) = nmdc::split_command(&line);
                match cmd {
                    "$ADCSND" => parse_snd_args(args.split(' '), want),
                    "$MaxedOut" => Err(TransferError::NoSlots),
                    "$Error" => Err(classify_nmdc_error(args)),
                    other => Err(TransferError::Protocol(format!(
                        "expected $ADCSND, got {other}"
                    ))),
                }
            }
            PeerProto::Adc => {
                let msg = AdcMessage::parse(&line)
                    .map_err(|e| TransferError::Protocol(format!("bad reply: {e}")))?;
                match msg.command {
                    adc::CMD_SND => parse_snd_args(msg.args.iter().map(String::as_str), want),
                    adc::CMD_STA => Err(classify_adc_sta(&msg)),
                    _ => Err(TransferError::Protocol("expected CSND".into())),
                }
            }
        }
    }

    /// Fetch a whole leaf array.
    ///
    /// # Errors
    ///
    /// Transport, protocol, [`TransferError::NoSlots`] or
    /// [`TransferError::NoFile`] from the peer.
    pub async fn fetch_tthl(&mut self, root: Root) -> Result<Vec<u8>, TransferError> {
        let want = Wanted::Tthl(root);
        self.send_get(&want, 0, -1).await?;
        let header = self.read_snd(&want).await?;
        if header.len == 0 || header.len > 48 * 1024 * 1024 {
            return Err(TransferError::Protocol("unreasonable TTHL length".into()));
        }
        let mut blob = Vec::with_capacity(header.len as usize);
        let res = self
            .conn
            .recv_stream(header.len, |chunk| {
                blob.extend_from_slice(chunk);
                true
            })
            .await
            .map_err(TransferError::Net)?;
        debug_assert!(!res.cancelled);
        Ok(blob)
    }

    /// Fetch a byte range, feeding it to `sink`; the sink returns
    /// `false` to cancel. Returns the bytes delivered.
    ///
    /// # Errors
    ///
    /// As [`PeerConn::fetch_tthl`].
    pub async fn fetch_range(
        &mut self,
        want: &Wanted,
        start: u64,
        len: u64,
        sink: impl FnMut(&[u8]) -> bool,
    ) -> Result<u64, TransferError> {
        self.send_get(want, start, len as i64).await?;
        let header = self.read_snd(want).await?;
        if header.start != start || header.len != len {
            return Err(TransferError::Protocol("SND range mismatch".into()));
        }
        let res = self
            .conn
            .recv_stream(len, sink)
            .await
            .map_err(TransferError::Net)?;
        Ok(res.bytes)
    }

    /// Fetch an entire item of unknown length (file lists): request
    /// everything from 0 with length -1 and read the announced count.
    ///
    /// # Errors
    ///
    /// As [`PeerConn::fetch_tthl`].
    pub async fn fetch_all(&mut self, want: &Wanted) -> Result<Vec<u8>, TransferError> {
        self.send_get(want, 0, -1).await?;
        let header = self.read_snd(want).await?;
        let mut blob = Vec::new();
        self.conn
            .recv_stream(header.len, |chunk| {
                blob.extend_from_slice(chunk);
                true
            })
            .await
            .map_err(TransferError::Net)?;
        Ok(blob)
    }

    /// Tear down the connection.
    pub fn disconnect(&mut self) {
        self.conn.disconnect();
    }
}

fn parse_snd_args<'a>(
    mut args: impl Iterator<Item = &'a str>,
    want: &Wanted,
) -> Result<SndHeader, TransferError> {
    let kind = args.next().unwrap_or("");
    let ident = args.next().unwrap_or("");
    let start: u64 = args
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransferError::Protocol("SND without start".into()))?;
    let len: i64 = args
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransferError::Protocol("SND without length".into()))?;
    if kind != want.kind() || ident != want.ident() {
        return Err(TransferError::Protocol("SND identifies the wrong file".into()));
    }
    if len < 0 {
        return Err(TransferError::Protocol("SND with negative length".into()));
    }
    Ok(SndHeader {
        start,
        len: len as u64,
    })
}

fn classify_nmdc_error(args: &str) -> TransferError {
    if args.to_ascii_lowercase().contains("file not available") {
        TransferError::NoFile
    } else {
        TransferError::Protocol(format!("peer error: {args}"))
    }
}

fn classify_adc_sta(msg: &AdcMessage) -> TransferError {
    // The last two digits carry the error class; the first is severity.
    match msg.args.first().map(String::as_str) {
        Some(code) if code.ends_with("51") => TransferError::NoFile,
        Some(code) if code.ends_with("53") => TransferError::NoSlots,
        _ => TransferError::Protocol(format!("peer status: {:?}", msg.args)),
    }
}

/// Upload slot accounting: regular slots, plus minislots reserved for
/// small files and file lists, plus a per-user concurrency cap.
pub struct SlotTable {
    inner: Mutex<SlotInner>,
}

struct SlotInner {
    slots: u32,
    in_use: u32,
    minislots: u32,
    mini_in_use: u32,
    minislot_size: u64,
    max_per_user: u32,
    per_user: HashMap<Uid, u32>,
}

/// What kind of slot a grant consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// A regular upload slot.
    Regular,
    /// A minislot.
    Mini,
}

impl SlotTable {
    /// New table.
    #[must_use]
    pub fn new(slots: u32, minislots: u32, minislot_size: u64, max_per_user: u32) -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                slots,
                in_use: 0,
                minislots,
                mini_in_use: 0,
                minislot_size,
                max_per_user,
                per_user: HashMap::new(),
            }),
        }
    }

    /// Update the limits at runtime.
    pub fn reconfigure(&self, slots: u32, minislots: u32, minislot_size: u64, max_per_user: u32) {
        if let Ok(mut t) = self.inner.lock() {
            t.slots = slots;
            t.minislots = minislots;
            t.minislot_size = minislot_size;
            t.max_per_user = max_per_user;
        }
    }

    /// Try to grant a slot for an upload of `len` bytes (`None` = file
    /// list). Small requests fall back to a minislot when the regular
    /// slots are taken.
    #[must_use]
    pub fn acquire(&self, uid: Uid, len: Option<u64>) -> Option<SlotKind> {
        let Ok(mut t) = self.inner.lock() else {
            return None;
        };
        let user_count = *t.per_user.get(&uid).unwrap_or(&0);
        if t.max_per_user > 0 && user_count >= t.max_per_user {
            return None;
        }
        if t.in_use < t.slots {
            t.in_use += 1;
            *t.per_user.entry(uid).or_insert(0) += 1;
            return Some(SlotKind::Regular);
        }
        let small = len.is_none_or(|l| l <= t.minislot_size);
        if small && t.mini_in_use < t.minislots {
            t.mini_in_use += 1;
            *t.per_user.entry(uid).or_insert(0) += 1;
            return Some(SlotKind::Mini);
        }
        None
    }

    /// Release a previously granted slot.
    pub fn release(&self, uid: Uid, kind: SlotKind) {
        let Ok(mut t) = self.inner.lock() else {
            return;
        };
        match kind {
            SlotKind::Regular => t.in_use = t.in_use.saturating_sub(1),
            SlotKind::Mini => t.mini_in_use = t.mini_in_use.saturating_sub(1),
        }
        if let Some(c) = t.per_user.get_mut(&uid) {
            *c = c.saturating_sub(1);
            if *c == 0 {
                t.per_user.remove(&uid);
            }
        }
    }

    /// Free regular slots right now.
    #[must_use]
    pub fn free(&self) -> u32 {
        self.inner
            .lock()
            .map(|t| t.slots.saturating_sub(t.in_use))
            .unwrap_or(0)
    }
}

/// Resolves upload requests against the local share.
pub trait ShareResolver: Send + Sync {
    /// Disk path and size for a shared file by root.
    fn resolve_tth(&self, root: Root) -> Option<(PathBuf, u64)>;
    /// The own file list, bzip2-compressed.
    fn filelist_bz2(&self) -> Option<Vec<u8>>;
    /// The leaf array for a shared file.
    fn tthl_for(&self, root: Root) -> Option<Vec<u8>>;
}

/// Serve upload requests on a connection whose handshake ended in
/// [`Direction::Upload`]. Returns when the peer disconnects.
/// `flush_cache` drops served files from the page cache afterwards.
pub async fn serve_uploads(
    mut peer: PeerConn,
    uid: Uid,
    resolver: &dyn ShareResolver,
    slots: &SlotTable,
    flush_cache: bool,
) {
    let eom = match peer.proto {
        PeerProto::Nmdc => b'|',
        PeerProto::Adc => b'\n',
    };
    loop {
        let raw = match peer.conn.read_msg(eom).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(error = %e, "upload connection closed");
                return;
            }
        };
        let line = String::from_utf8_lossy(&raw).into_owned();
        let request = match peer.proto {
            PeerProto::Nmdc => {
                let (cmd, args) = nmdc::split_command(&line);
                if cmd != "$ADCGET" {
                    tracing::debug!(cmd, "ignoring non-GET from downloader");
                    continue;
                }
                parse_get(args.split(' '))
            }
            PeerProto::Adc => match AdcMessage::parse(&line) {
                Ok(msg) if msg.command == adc::CMD_GET => {
                    parse_get(msg.args.iter().map(String::as_str))
                }
                Ok(msg) if msg.command == adc::CMD_GFI => {
                    if serve_file_info(&mut peer, &msg, resolver).await.is_err() {
                        return;
                    }
                    continue;
                }
                Ok(_) | Err(_) => {
                    tracing::debug!("ignoring non-GET from downloader");
                    continue;
                }
            },
        };
        let Some((want, start, len)) = request else {
            let _ = send_error(&mut peer, "invalid GET").await;
            continue;
        };
        if serve_one(&mut peer, uid, &want, start, len, resolver, slots, flush_cache)
            .await
            .is_err()
        {
            return;
        }
    }
}

fn parse_get<'a>(mut args: impl Iterator<Item = &'a str>) -> Option<(Wanted, u64, i64)> {
    let kind = args.next()?;
    let ident = args.next()?;
    let start: u64 = args.next()?.parse().ok()?;
    let len: i64 = args.next()?.parse().ok()?;
    let want = match (kind, ident) {
        ("file", "files.xml.bz2") => Wanted::FileList,
        ("file", tth) => Wanted::File(Root::from_base32(tth.strip_prefix("TTH/")?).ok()?),
        ("tthl", tth) => Wanted::Tthl(Root::from_base32(tth.strip_prefix("TTH/")?).ok()?),
        _ => return None,
    };
    Some((want, start, len))
}

/// Answer `GFI file <ident>`: a `RES` with the item's size, or a
/// not-available status.
async fn serve_file_info(
    peer: &mut PeerConn,
    msg: &AdcMessage,
    resolver: &dyn ShareResolver,
) -> Result<(), TransferError> {
    let ident = msg.args.get(1).map(String::as_str).unwrap_or("");
    let size = if ident == "files.xml.bz2" {
        resolver.filelist_bz2().map(|l| l.len() as u64)
    } else {
        ident
            .strip_prefix("TTH/")
            .and_then(|t| Root::from_base32(t).ok())
            .and_then(|root| resolver.resolve_tth(root))
            .map(|(_, size)| size)
    };
    let Some(size) = size else {
        return send_error(peer, "File Not Available").await;
    };
    let res = AdcMessage::new(AdcType::C, adc::CMD_RES)
        .named("FN", ident)
        .named("SI", size.to_string());
    let mut bytes = res.to_line().into_bytes();
    bytes.push(b'\n');
    peer.conn.write(&bytes).await.map_err(TransferError::Net)
}

async fn send_error(peer: &mut PeerConn, text: &str) -> Result<(), TransferError> {
    match peer.proto {
        PeerProto::Nmdc => write_line(&mut peer.conn, &format!("$Error {text}")).await,
        PeerProto::Adc => {
            let msg = AdcMessage::new(AdcType::C, adc::CMD_STA)
                .arg("151")
                .arg(text);
            let mut bytes = msg.to_line().into_bytes();
            bytes.push(b'\n');
            peer.conn.write(&bytes).await.map_err(TransferError::Net)
        }
    }
}

async fn send_maxed(peer: &mut PeerConn) -> Result<(), TransferError> {
    match peer.proto {
        PeerProto::Nmdc => write_line(&mut peer.conn, "$MaxedOut").await,
        PeerProto::Adc => {
            let msg = AdcMessage::new(AdcType::C, adc::CMD_STA)
                .arg("153")
                .arg("No slots available");
            let mut bytes = msg.to_line().into_bytes();
            bytes.push(b'\n');
            peer.conn.write(&bytes).await.map_err(TransferError::Net)
        }
    }
}

async fn send_snd(
    peer: &mut PeerConn,
    want: &Wanted,
    start: u64,
    len: u64,
) -> Result<(), TransferError> {
    match peer.proto {
        PeerProto::Nmdc => {
            write_line(
                &mut peer.conn,
                &format!("$ADCSND {} {} {start} {len}", want.kind(), want.ident()),
            )
            .await
        }
        PeerProto::Adc => {
            let msg = AdcMessage::new(AdcType::C, adc::CMD_SND)
                .arg(want.kind())
                .arg(want.ident())
                .arg(start.to_string())
                .arg(len.to_string());
            let mut bytes = msg.to_line().into_bytes();
            bytes.push(b'\n');
            peer.conn.write(&bytes).await.map_err(TransferError::Net)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_one(
    peer: &mut PeerConn,
    uid: Uid,
    want: &Wanted,
    start: u64,
    len: i64,
    resolver: &dyn ShareResolver,
    slots: &SlotTable,
    flush_cache: bool,
) -> Result<(), TransferError> {
    match want {
        Wanted::FileList => {
            let Some(list) = resolver.filelist_bz2() else {
                return send_error(peer, "File Not Available").await;
            };
            // File lists always fit a minislot.
            let Some(kind) = slots.acquire(uid, None) else {
                return send_maxed(peer).await;
            };
            let end = list.len() as u64;
            let start = start.min(end);
            let count = if len < 0 {
                end - start
            } else {
                (len as u64).min(end - start)
            };
            send_snd(peer, want, start, count).await?;
            let res = peer
                .conn
                .write(&list[start as usize..(start + count) as usize])
                .await
                .map_err(TransferError::Net);
            slots.release(uid, kind);
            res
        }
        Wanted::Tthl(root) => {
            let Some(blob) = resolver.tthl_for(*root) else {
                return send_error(peer, "File Not Available").await;
            };
            send_snd(peer, want, 0, blob.len() as u64).await?;
            peer.conn.write(&blob).await.map_err(TransferError::Net)
        }
        Wanted::File(root) => {
            let Some((path, size)) = resolver.resolve_tth(*root) else {
                return send_error(peer, "File Not Available").await;
            };
            if start > size {
                return send_error(peer, "Invalid range").await;
            }
            let count = if len < 0 {
                size - start
            } else {
                (len as u64).min(size - start)
            };
            let Some(kind) = slots.acquire(uid, Some(count)) else {
                return send_maxed(peer).await;
            };
            let result = async {
                let mut file = tokio::fs::File::open(&path)
                    .await
                    .map_err(TransferError::IncompleteIo)?;
                use tokio::io::AsyncSeekExt;
                file.seek(std::io::SeekFrom::Start(start))
                    .await
                    .map_err(TransferError::IncompleteIo)?;
                send_snd(peer, want, start, count).await?;
                peer.conn
                    .send_file(&mut file, count)
                    .await
                    .map_err(TransferError::Net)?;
                if flush_cache {
                    driftdc_net::conn::advise_dontneed(&file.into_std().await);
                }
                Ok(())
            }
            .await;
            slots.release(uid, kind);
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftdc_net::ConnectOpts;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn, accepted) = tokio::join!(
            Connection::connect("127.0.0.1", addr.port(), ConnectOpts::default()),
            async { listener.accept().await.unwrap().0 }
        );
        (conn.unwrap(), accepted)
    }

    async fn read_until(remote: &mut TcpStream, needle: &str) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let text = String::from_utf8_lossy(&buf).into_owned();
            if text.contains(needle) {
                return text;
            }
            let n = remote.read(&mut chunk).await.unwrap();
            assert_ne!(n, 0, "peer closed while waiting for {needle}");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn nmdc_handshake_as_initiator() {
        let (conn, mut remote) = pair().await;
        let peer_task = tokio::spawn(async move {
            let greeting = read_until(&mut remote, "$Lock ").await;
            assert!(greeting.contains("$MyNick me|"));
            remote
                .write_all(b"$MyNick bob|$Lock EXTENDEDPROTOCOLXYZ Pk=x|")
                .await
                .unwrap();
            let reply = read_until(&mut remote, "$Key ").await;
            assert!(reply.contains("$Supports "));
            assert!(reply.contains("$Direction Download "));
            remote
                .write_all(b"$Supports ADCGet|$Direction Upload 100|$Key x|")
                .await
                .unwrap();
            remote
        });
        let peer = handshake_nmdc(
            conn,
            NmdcHandshake {
                own_nick: "me",
                initiator: true,
                want_download: &|nick| {
                    assert_eq!(nick, Some("bob"));
                    true
                },
            },
        )
        .await
        .unwrap();
        assert_eq!(peer.peer_nick.as_deref(), Some("bob"));
        assert_eq!(peer.direction, Direction::Download);
        drop(peer_task.await.unwrap());
    }

    #[tokio::test]
    async fn nmdc_download_requests_range() {
        let (conn, mut remote) = pair().await;
        let root = Root([9; 24]);
        let b32 = root.to_base32();
        let payload = vec![0x7Au8; 2048];
        let expect = format!("$ADCGET file TTH/{b32} 0 2048|");
        let payload2 = payload.clone();
        let peer_task = tokio::spawn(async move {
            let got = read_until(&mut remote, "$ADCGET").await;
            assert_eq!(got, expect);
            let snd = format!("$ADCSND file TTH/{b32} 0 2048|");
            remote.write_all(snd.as_bytes()).await.unwrap();
            remote.write_all(&payload2).await.unwrap();
            remote
        });

        let mut peer = PeerConn {
            conn,
            proto: PeerProto::Nmdc,
            uid: None,
            peer_nick: Some("bob".into()),
            peer_cid: None,
            peer_token: None,
            direction: Direction::Download,
        };
        let mut got = Vec::new();
        let n = peer
            .fetch_range(&Wanted::File(root), 0, 2048, |c| {
                got.extend_from_slice(c);
                true
            })
            .await
            .unwrap();
        assert_eq!(n, 2048);
        assert_eq!(got, payload);
        drop(peer_task.await.unwrap());
    }

    #[tokio::test]
    async fn maxedout_maps_to_noslots() {
        let (conn, mut remote) = pair().await;
        let peer_task = tokio::spawn(async move {
            let _ = read_until(&mut remote, "$ADCGET").await;
            remote.write_all(b"$MaxedOut|").await.unwrap();
            remote
        });
        let mut peer = PeerConn {
            conn,
            proto: PeerProto::Nmdc,
            uid: None,
            peer_nick: None,
            peer_cid: None,
            peer_token: None,
            direction: Direction::Download,
        };
        let err = peer.fetch_tthl(Root([1; 24])).await.unwrap_err();
        assert!(matches!(err, TransferError::NoSlots));
        drop(peer_task.await.unwrap());
    }

    #[tokio::test]
    async fn adc_handshake_exchanges_cids() {
        let (conn, mut remote) = pair().await;
        let own = Cid([1; 24]);
        let their = Cid([2; 24]);
        let their_b32 = their.to_base32();
        let peer_task = tokio::spawn(async move {
            let sup = read_until(&mut remote, "CSUP").await;
            assert!(sup.starts_with("CSUP ADBASE ADTIGR\n"));
            remote.write_all(b"CSUP ADBASE ADTIGR\n").await.unwrap();
            let inf = read_until(&mut remote, "CINF").await;
            assert!(inf.contains("TOtok1"));
            remote
                .write_all(format!("CINF ID{their_b32}\n").as_bytes())
                .await
                .unwrap();
            remote
        });
        let peer = handshake_adc(conn, &own, "tok1", true).await.unwrap();
        assert_eq!(peer.peer_cid, Some(their));
        assert_eq!(peer.direction, Direction::Download);
        drop(peer_task.await.unwrap());
    }

    #[test]
    fn slot_table_grants_and_minislots() {
        let slots = SlotTable::new(1, 1, 64 * 1024, 0);
        let a = Uid(1);
        let b = Uid(2);
        assert_eq!(slots.acquire(a, Some(1 << 20)), Some(SlotKind::Regular));
        // Regular slots are gone; a large file is refused.
        assert_eq!(slots.acquire(b, Some(1 << 20)), None);
        // A small file gets the minislot.
        assert_eq!(slots.acquire(b, Some(1024)), Some(SlotKind::Mini));
        // File lists count as small.
        assert_eq!(slots.acquire(b, None), None); // minislot taken too
        slots.release(a, SlotKind::Regular);
        assert_eq!(slots.acquire(b, Some(1 << 20)), Some(SlotKind::Regular));
    }

    #[test]
    fn slot_table_per_user_cap() {
        let slots = SlotTable::new(4, 0, 0, 1);
        let a = Uid(1);
        assert!(slots.acquire(a, Some(10)).is_some());
        assert_eq!(slots.acquire(a, Some(10)), None);
        assert!(slots.acquire(Uid(2), Some(10)).is_some());
    }

    #[test]
    fn parse_get_variants() {
        let root = Root([3; 24]);
        let b32 = root.to_base32();
        let line = format!("file TTH/{b32} 0 -1");
        let (want, start, len) = parse_get(line.split(' ')).unwrap();
        assert_eq!(want, Wanted::File(root));
        assert_eq!((start, len), (0, -1));

        let (want, _, _) = parse_get("file files.xml.bz2 0 -1".split(' ')).unwrap();
        assert_eq!(want, Wanted::FileList);

        let line = format!("tthl TTH/{b32} 0 -1");
        let (want, _, _) = parse_get(line.split(' ')).unwrap();
        assert_eq!(want, Wanted::Tthl(root));

        assert!(parse_get("file TTH/short 0 -1".split(' ')).is_none());
        assert!(parse_get("bogus x 0 -1".split(' ')).is_none());
    }
}
