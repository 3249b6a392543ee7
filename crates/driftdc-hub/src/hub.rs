//! The hub driver: connection lifecycle around a session machine.
//!
//! One task per hub. It dials (TLS per the address scheme, keyprint
//! pinned when the address carries one), feeds wire messages through the
//! dialect machine, applies the resulting actions, and arms the
//! reconnect timer on loss. The machines themselves never touch a
//! socket.

use crate::adc::AdcSession;
use crate::event::{HubCommand, HubEvent};
use crate::nmdc::{Action, NmdcSession};
use crate::DEFAULT_RECONNECT_SECS;
use driftdc_filelist::FileList;
use driftdc_net::udp::OutDatagram;
use driftdc_net::{ConnectOpts, Connection, TlsSetup};
use driftdc_proto::{HubAddr, HubDialect};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// SUDP reply policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SudpPolicy {
    /// Never encrypt, ignore keys.
    Disabled,
    /// Answer encrypted requests, search in plaintext.
    #[default]
    Allow,
    /// Also announce keys with our own searches.
    Prefer,
}

/// Hub lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    /// Not connected, no activity pending.
    Idle,
    /// Resolving the hub name.
    Resolving,
    /// Dialing.
    Connecting,
    /// Connected, session handshake running.
    Handshaking,
    /// Presence established.
    LoggedIn,
    /// Waiting out the reconnect timer.
    ReconnectWait,
}

/// Per-hub configuration consumed by the session machines and driver.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Session identity.
    pub nick: String,
    /// Auto-login password.
    pub password: Option<String>,
    /// NMDC text encoding.
    pub encoding: &'static encoding_rs::Encoding,
    /// Presence description.
    pub description: String,
    /// Presence e-mail field (NMDC).
    pub email: String,
    /// Presence connection field (NMDC).
    pub connection: String,
    /// Whether we accept incoming peer connections.
    pub active: bool,
    /// Our routable address in active mode.
    pub active_ip: Option<IpAddr>,
    /// TCP listen port in active mode.
    pub active_port: u16,
    /// UDP search port in active mode.
    pub active_udp_port: u16,
    /// Total upload slots advertised.
    pub upload_slots: u32,
    /// Currently free upload slots (kept fresh by the transfer layer).
    pub slots_free: u32,
    /// Join for chat only: never answer searches, advertise nothing.
    pub chat_only: bool,
    /// Seconds before reconnecting after loss; 0 disables.
    pub reconnect_timeout: u64,
    /// SUDP policy.
    pub sudp_policy: SudpPolicy,
    /// Text form of the hub address, echoed in search results.
    pub hub_addr: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            nick: String::new(),
            password: None,
            encoding: encoding_rs::UTF_8,
            description: String::new(),
            email: String::new(),
            connection: "0.005".into(),
            active: false,
            active_ip: None,
            active_port: 0,
            active_udp_port: 0,
            upload_slots: 2,
            slots_free: 2,
            chat_only: false,
            reconnect_timeout: DEFAULT_RECONNECT_SECS,
            sudp_policy: SudpPolicy::default(),
            hub_addr: String::new(),
        }
    }
}

enum Machine {
    Nmdc(NmdcSession),
    Adc(AdcSession),
}

impl Machine {
    fn handle_msg(&mut self, raw: &[u8], cfg: &HubConfig, share: &FileList) -> Vec<Action> {
        match self {
            Machine::Nmdc(s) => s.handle_msg(raw, cfg, share),
            Machine::Adc(s) => s.handle_msg(raw, cfg, share),
        }
    }

    fn command(&mut self, cmd: &HubCommand, cfg: &HubConfig, share: &FileList) -> Vec<Action> {
        match self {
            Machine::Nmdc(s) => s.command(cmd, cfg, share),
            Machine::Adc(s) => s.command(cmd, cfg, share),
        }
    }
}

/// Shared handles a hub task needs from the core.
pub struct HubDeps {
    /// Local share, read-locked for search answers.
    pub share: Arc<RwLock<FileList>>,
    /// TLS factory.
    pub tls: Arc<TlsSetup>,
    /// Outgoing UDP queue.
    pub udp_out: mpsc::UnboundedSender<OutDatagram>,
    /// Event channel to the core, tagged with the hub id.
    pub events: mpsc::UnboundedSender<(u64, HubEvent)>,
    /// Configured local bind address for outgoing connections.
    pub local_address: Option<IpAddr>,
}

/// A long-lived hub association driven by [`Hub::run`].
pub struct Hub {
    /// Stable numeric id.
    pub id: u64,
    /// Dial target.
    pub addr: HubAddr,
    /// Live configuration; the driver re-reads it each pass.
    pub cfg: Arc<RwLock<HubConfig>>,
    /// Client-wide ADC private id (the CID follows from it).
    pub pid: [u8; 24],
}

impl Hub {
    /// New hub association. `pid` is the client-wide ADC identity.
    #[must_use]
    pub fn new(id: u64, addr: HubAddr, cfg: HubConfig, pid: [u8; 24]) -> Self {
        Self {
            id,
            addr,
            cfg: Arc::new(RwLock::new(cfg)),
            pid,
        }
    }

    fn config(&self) -> HubConfig {
        self.cfg.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Drive the session until [`HubCommand::Disconnect`] or a terminal
    /// close. Reconnects per configuration on loss.
    pub async fn run(self, deps: HubDeps, mut commands: mpsc::UnboundedReceiver<HubCommand>) {
        loop {
            let reconnect = self.run_once(&deps, &mut commands).await;
            let timeout = self.config().reconnect_timeout;
            if !reconnect || timeout == 0 {
                let _ = deps
                    .events
                    .send((self.id, HubEvent::StateChanged(HubState::Idle)));
                return;
            }
            let _ = deps
                .events
                .send((self.id, HubEvent::StateChanged(HubState::ReconnectWait)));
            tokio::time::sleep(Duration::from_secs(timeout)).await;
        }
    }

    /// One connect-serve cycle. Returns whether to reconnect.
    async fn run_once(
        &self,
        deps: &HubDeps,
        commands: &mut mpsc::UnboundedReceiver<HubCommand>,
    ) -> bool {
        let send_state = |s: HubState| {
            let _ = deps.events.send((self.id, HubEvent::StateChanged(s)));
        };
        let cfg = self.config();
        send_state(HubState::Resolving);

        let host = self.addr.host.to_string();
        let host_bare = host.trim_matches(['[', ']']).to_owned();
        let eom = match self.addr.dialect {
            HubDialect::Nmdc => b'|',
            HubDialect::Adc => b'\n',
        };
        let opts = ConnectOpts {
            keepalive: Some(vec![eom]),
            local_v4: match deps.local_address {
                Some(IpAddr::V4(ip)) => Some(ip),
                _ => None,
            },
            local_v6: match deps.local_address {
                Some(IpAddr::V6(ip)) => Some(ip),
                _ => None,
            },
            ..ConnectOpts::default()
        };
        send_state(HubState::Connecting);
        let mut conn = match Connection::connect(&host_bare, self.addr.port, opts).await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = deps.events.send((
                    self.id,
                    HubEvent::Closed {
                        reason: e.to_string(),
                        reconnect: true,
                    },
                ));
                return true;
            }
        };
        if self.addr.tls {
            match conn
                .start_tls(&deps.tls, &host_bare, self.addr.keyprint)
                .await
            {
                Ok(fp) => {
                    tracing::info!(hub = self.id, "hub TLS up, keyprint {}", keyprint_b32(&fp));
                }
                Err(e) => {
                    let _ = deps.events.send((
                        self.id,
                        HubEvent::Closed {
                            reason: e.to_string(),
                            reconnect: self.addr.keyprint.is_none(),
                        },
                    ));
                    // A pinned-keyprint mismatch will not fix itself.
                    return self.addr.keyprint.is_none();
                }
            }
        }
        send_state(HubState::Handshaking);

        let mut machine = match self.addr.dialect {
            HubDialect::Nmdc => Machine::Nmdc(NmdcSession::new(self.id)),
            HubDialect::Adc => {
                let session = AdcSession::new(self.id, self.pid, None);
                for action in session.greeting() {
                    if let Action::Send(bytes) = action {
                        if conn.write(&bytes).await.is_err() {
                            return true;
                        }
                    }
                }
                Machine::Adc(session)
            }
        };

        loop {
            let actions = tokio::select! {
                msg = conn.read_msg(eom) => match msg {
                    Ok(raw) => {
                        let cfg = self.config();
                        let share = read_share(&deps.share);
                        machine.handle_msg(&raw, &cfg, &share)
                    }
                    Err(e) => {
                        let _ = deps.events.send((
                            self.id,
                            HubEvent::Closed { reason: e.to_string(), reconnect: true },
                        ));
                        return true;
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        let cfg = self.config();
                        let share = read_share(&deps.share);
                        machine.command(&cmd, &cfg, &share)
                    }
                    None => return false,
                },
            };
            for action in actions {
                match action {
                    Action::Send(bytes) => {
                        if let Err(e) = conn.write(&bytes).await {
                            let _ = deps.events.send((
                                self.id,
                                HubEvent::Closed {
                                    reason: e.to_string(),
                                    reconnect: true,
                                },
                            ));
                            return true;
                        }
                    }
                    Action::SendUdp { to, payload } => match to.parse() {
                        Ok(addr) => {
                            let _ = deps.udp_out.send(OutDatagram { to: addr, payload });
                        }
                        Err(_) => {
                            tracing::debug!(to, "unparseable search reply address");
                        }
                    },
                    Action::Event(ev) => {
                        if matches!(ev, HubEvent::LoggedIn) {
                            send_state(HubState::LoggedIn);
                        }
                        let _ = deps.events.send((self.id, ev));
                    }
                    Action::Fatal { reason, reconnect } => {
                        conn.disconnect();
                        let _ = deps
                            .events
                            .send((self.id, HubEvent::Closed { reason, reconnect }));
                        return reconnect;
                    }
                }
            }
        }
    }
}

/// Snapshot the share under the read lock. Session machines walk the
/// snapshot synchronously; no lock is held across an await.
fn read_share(share: &Arc<RwLock<FileList>>) -> FileList {
    share
        .read()
        .map(|s| s.clone())
        .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
}

fn keyprint_b32(fp: &[u8; 32]) -> String {
    data_encoding::BASE32_NOPAD.encode(fp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.reconnect_timeout, DEFAULT_RECONNECT_SECS);
        assert_eq!(cfg.encoding, encoding_rs::UTF_8);
        assert_eq!(cfg.sudp_policy, SudpPolicy::Allow);
        assert!(cfg.upload_slots > 0);
    }

    #[test]
    fn hub_holds_shared_config() {
        let addr = HubAddr::parse("adc://h.example:411").unwrap();
        let hub = Hub::new(3, addr, HubConfig::default(), [1u8; 24]);
        hub.cfg.write().unwrap().nick = "n".into();
        assert_eq!(hub.config().nick, "n");
    }
}
