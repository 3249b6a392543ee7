//! NMDC hub session state machine.
//!
//! A pure machine: raw `|`-terminated message bytes go in, a list of
//! [`Action`]s (wire bytes, UDP datagrams, events) comes out. The driver
//! in [`crate::hub`] owns the socket, the reconnect timer and the share
//! lock. Text is decoded with the hub's configured encoding; command
//! syntax itself is ASCII.

use crate::event::{HubCommand, HubEvent, SearchResult};
use crate::hub::HubConfig;
use crate::search;
use crate::user::{HubUser, Uid, uid_from_nick};
use driftdc_filelist::FileList;
use driftdc_proto::nmdc;
use std::collections::HashMap;

/// Session phases, identical in wire form for both dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Awaiting the lock exchange.
    Protocol,
    /// Nick sent, awaiting acceptance.
    Identify,
    /// Hub asked for a password.
    Verify,
    /// Logged in.
    Normal,
}

/// One step's output from a session machine.
#[derive(Debug)]
pub enum Action {
    /// Bytes to write to the hub connection.
    Send(Vec<u8>),
    /// Datagram to queue (search replies to active peers).
    SendUdp {
        /// `ip:port` text form as it appeared in the request.
        to: String,
        /// Payload.
        payload: Vec<u8>,
    },
    /// Event for the owner.
    Event(HubEvent),
    /// The session is over; the driver closes the socket.
    Fatal {
        /// Human-readable cause.
        reason: String,
        /// Whether the reconnect timer applies.
        reconnect: bool,
    },
}

/// NMDC session state.
pub struct NmdcSession {
    hub_id: u64,
    phase: Phase,
    users: HashMap<String, HubUser>,
    hub_supports: Vec<String>,
    validated: bool,
}

impl NmdcSession {
    /// Fresh session in the PROTOCOL phase.
    #[must_use]
    pub fn new(hub_id: u64) -> Self {
        Self {
            hub_id,
            phase: Phase::Protocol,
            users: HashMap::new(),
            hub_supports: Vec::new(),
            validated: false,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Look up a user by nick (case-sensitive, NMDC rule).
    #[must_use]
    pub fn user(&self, nick: &str) -> Option<&HubUser> {
        self.users.get(nick)
    }

    /// Look up a user by uid.
    #[must_use]
    pub fn user_by_uid(&self, uid: Uid) -> Option<&HubUser> {
        self.users.values().find(|u| u.uid == uid)
    }

    /// All users.
    pub fn users(&self) -> impl Iterator<Item = &HubUser> {
        self.users.values()
    }

    fn enc(&self, cfg: &HubConfig, s: &str) -> Vec<u8> {
        nmdc::encode_text(cfg.encoding, s)
    }

    fn send(&self, cfg: &HubConfig, s: &str) -> Action {
        let mut bytes = self.enc(cfg, s);
        bytes.push(b'|');
        Action::Send(bytes)
    }

    fn myinfo(&self, cfg: &HubConfig, share_size: u64) -> String {
        let mode = if cfg.active { 'A' } else { 'P' };
        let tag = format!(
            "<driftdc V:{},M:{mode},H:1/0/0,S:{}>",
            env!("CARGO_PKG_VERSION"),
            cfg.upload_slots
        );
        let status = 1u8;
        format!(
            "$MyINFO {}",
            nmdc::build_myinfo(
                &cfg.nick,
                &cfg.description,
                &tag,
                &cfg.connection,
                status,
                &cfg.email,
                share_size,
            )
        )
    }

    /// Feed one raw message (without the `|` terminator).
    #[must_use]
    pub fn handle_msg(&mut self, raw: &[u8], cfg: &HubConfig, share: &FileList) -> Vec<Action> {
        if raw.is_empty() {
            return Vec::new();
        }
        // $Lock must be handled at the byte level: the lock data is not
        // text in any encoding.
        if let Some(rest) = raw.strip_prefix(b"$Lock ".as_slice()) {
            return self.on_lock(rest, cfg);
        }
        let line = nmdc::decode_text(cfg.encoding, raw);
        let (cmd, args) = nmdc::split_command(&line);
        match cmd {
            "" => self.on_chat(&line),
            "$Supports" => {
                self.hub_supports = args.split(' ').map(str::to_owned).collect();
                Vec::new()
            }
            "$HubName" => vec![Action::Event(HubEvent::HubMessage(format!(
                "Hub name: {}",
                nmdc::unescape(args)
            )))],
            "$Hello" => self.on_hello(args, cfg, share),
            "$GetPass" => self.on_getpass(cfg),
            "$BadPass" => vec![Action::Fatal {
                reason: "password refused".into(),
                reconnect: false,
            }],
            "$ValidateDenide" => vec![Action::Fatal {
                reason: "nick refused by hub".into(),
                reconnect: false,
            }],
            "$HubIsFull" => vec![Action::Fatal {
                reason: "hub is full".into(),
                reconnect: true,
            }],
            "$ForceMove" => vec![
                Action::Event(HubEvent::HubMessage(format!("hub redirects to {args}"))),
                Action::Fatal {
                    reason: format!("redirected to {args}"),
                    reconnect: false,
                },
            ],
            "$MyINFO" => self.on_myinfo(args),
            "$Quit" => self.on_quit(args),
            "$NickList" => self.on_nicklist(args),
            "$OpList" => self.on_nicklist(args),
            "$To:" => self.on_pm(args),
            "$Search" => self.on_search(args, cfg, share),
            "$SR" => self.on_sr(args),
            "$ConnectToMe" => self.on_ctm(args),
            "$RevConnectToMe" => self.on_rcm(args),
            "$UserIP" => Vec::new(),
            "$GetNetInfo" | "$HubTopic" | "$UserCommand" => Vec::new(),
            other => {
                tracing::debug!(command = other, "ignoring unknown NMDC command");
                Vec::new()
            }
        }
    }

    fn on_lock(&mut self, rest: &[u8], cfg: &HubConfig) -> Vec<Action> {
        if self.phase != Phase::Protocol {
            return vec![Action::Fatal {
                reason: "unexpected $Lock".into(),
                reconnect: true,
            }];
        }
        let lock = rest.split(|&b| b == b' ').next().unwrap_or(rest);
        let mut out = Vec::new();
        if lock.starts_with(b"EXTENDEDPROTOCOL") {
            out.push(self.send(cfg, "$Supports NoGetINFO NoHello UserIP2 TTHSearch"));
        }
        let mut key_msg = b"$Key ".to_vec();
        key_msg.extend_from_slice(&nmdc::lock_to_key(lock));
        key_msg.push(b'|');
        out.push(Action::Send(key_msg));
        out.push(self.send(cfg, &format!("$ValidateNick {}", cfg.nick)));
        self.phase = Phase::Identify;
        out
    }

    fn on_hello(&mut self, nick: &str, cfg: &HubConfig, share: &FileList) -> Vec<Action> {
        if nick == cfg.nick {
            self.validated = true;
            let was_verify = self.phase == Phase::Verify;
            self.phase = Phase::Normal;
            let mut out = vec![
                self.send(cfg, "$Version 1,0091"),
                self.send(cfg, "$GetNickList"),
                self.send(cfg, &self.myinfo(cfg, share.size(share.root()))),
                Action::Event(HubEvent::LoggedIn),
            ];
            if was_verify {
                out.insert(0, Action::Event(HubEvent::HubMessage("password accepted".into())));
            }
            out
        } else {
            let hub_id = self.hub_id;
            let user = self
                .users
                .entry(nick.to_owned())
                .or_insert_with(|| HubUser::from_nick(hub_id, nick));
            vec![Action::Event(HubEvent::UserJoined(user.clone()))]
        }
    }

    fn on_getpass(&mut self, cfg: &HubConfig) -> Vec<Action> {
        self.phase = Phase::Verify;
        match &cfg.password {
            Some(pass) => vec![self.send(cfg, &format!("$MyPass {pass}"))],
            None => vec![Action::Event(HubEvent::PasswordNeeded)],
        }
    }

    fn on_myinfo(&mut self, args: &str) -> Vec<Action> {
        let Ok(info) = nmdc::parse_myinfo(args) else {
            tracing::debug!("dropping malformed $MyINFO");
            return Vec::new();
        };
        let hub_id = self.hub_id;
        let known = self.users.contains_key(&info.nick);
        let user = self
            .users
            .entry(info.nick.clone())
            .or_insert_with(|| HubUser::from_nick(hub_id, &info.nick));
        user.share = info.share;
        user.active = info.tag.contains("M:A");
        user.tls = info.tag.contains("TLS") || self.hub_supports.iter().any(|s| s == "TLS");
        if let Some(slots) = info
            .tag
            .rsplit_once("S:")
            .and_then(|(_, s)| s.trim_end_matches('>').parse().ok())
        {
            user.slots_free = slots;
        }
        let ev = if known {
            HubEvent::UserInfo(user.clone())
        } else {
            HubEvent::UserJoined(user.clone())
        };
        vec![Action::Event(ev)]
    }

    fn on_quit(&mut self, nick: &str) -> Vec<Action> {
        match self.users.remove(nick) {
            Some(user) => vec![Action::Event(HubEvent::UserQuit(user.uid))],
            None => Vec::new(),
        }
    }

    fn on_nicklist(&mut self, args: &str) -> Vec<Action> {
        let mut out = Vec::new();
        for nick in args.split("$$").filter(|n| !n.is_empty()) {
            if !self.users.contains_key(nick) {
                let user = HubUser::from_nick(self.hub_id, nick);
                out.push(Action::Event(HubEvent::UserJoined(user.clone())));
                self.users.insert(nick.to_owned(), user);
            }
        }
        out
    }

    fn on_chat(&mut self, line: &str) -> Vec<Action> {
        // "<nick> text" main chat; anything else is hub text.
        if let Some(rest) = line.strip_prefix('<') {
            if let Some((nick, text)) = rest.split_once("> ") {
                let from = self.users.get(nick).map(|u| u.uid);
                return vec![Action::Event(HubEvent::Chat {
                    from,
                    text: nmdc::unescape(text),
                })];
            }
        }
        vec![Action::Event(HubEvent::Chat {
            from: None,
            text: nmdc::unescape(line),
        })]
    }

    fn on_pm(&mut self, args: &str) -> Vec<Action> {
        // "me From: nick $<nick> text"
        let Some((_, rest)) = args.split_once("From: ") else {
            return Vec::new();
        };
        let Some((nick, text)) = rest.split_once(" $") else {
            return Vec::new();
        };
        let text = text
            .strip_prefix(&format!("<{nick}> "))
            .unwrap_or(text)
            .to_owned();
        let hub_id = self.hub_id;
        let user = self
            .users
            .entry(nick.to_owned())
            .or_insert_with(|| HubUser::from_nick(hub_id, nick));
        vec![Action::Event(HubEvent::Private {
            from: user.uid,
            text: nmdc::unescape(&text),
        })]
    }

    fn on_search(&mut self, args: &str, cfg: &HubConfig, share: &FileList) -> Vec<Action> {
        let Ok(req) = nmdc::parse_search(args) else {
            tracing::debug!("dropping malformed $Search");
            return Vec::new();
        };
        // Our own broadcast comes back from the hub; skip it.
        if let nmdc::SearchOrigin::Passive(nick) = &req.origin {
            if *nick == cfg.nick {
                return Vec::new();
            }
        }
        search::answer_nmdc(&req, cfg, share)
    }

    fn on_sr(&mut self, args: &str) -> Vec<Action> {
        let Ok(sr) = nmdc::parse_sr(args) else {
            tracing::debug!("dropping malformed $SR");
            return Vec::new();
        };
        let uid = uid_from_nick(self.hub_id, &sr.nick);
        let tth = sr
            .tth
            .as_deref()
            .and_then(|t| driftdc_tth::Root::from_base32(t).ok());
        vec![Action::Event(HubEvent::Result(SearchResult {
            uid,
            path: sr.path,
            size: sr.size,
            slots_free: sr.slots_free,
            tth,
        }))]
    }

    fn on_ctm(&mut self, args: &str) -> Vec<Action> {
        // "$ConnectToMe <mynick> <ip:port>" - a trailing S marks TLS.
        let Some((_, addr)) = args.split_once(' ') else {
            return Vec::new();
        };
        let (addr, tls) = match addr.strip_suffix('S') {
            Some(a) => (a, true),
            None => (addr, false),
        };
        vec![Action::Event(HubEvent::ConnectToMe {
            uid: None,
            addr: addr.to_owned(),
            tls,
            token: None,
        })]
    }

    fn on_rcm(&mut self, args: &str) -> Vec<Action> {
        let Some((from, _)) = args.split_once(' ') else {
            return Vec::new();
        };
        let hub_id = self.hub_id;
        let user = self
            .users
            .entry(from.to_owned())
            .or_insert_with(|| HubUser::from_nick(hub_id, from));
        vec![Action::Event(HubEvent::RevConnectToMe {
            uid: user.uid,
            token: None,
        })]
    }

    /// Serialize an outbound command.
    #[must_use]
    pub fn command(&mut self, cmd: &HubCommand, cfg: &HubConfig, share: &FileList) -> Vec<Action> {
        if self.phase != Phase::Normal && !matches!(cmd, HubCommand::Password(_) | HubCommand::Disconnect) {
            return vec![Action::Event(HubEvent::HubMessage(
                "not logged in yet".into(),
            ))];
        }
        match cmd {
            HubCommand::Chat(text) => {
                let line = format!("<{}> {}", cfg.nick, nmdc::escape(text));
                vec![self.send(cfg, &line)]
            }
            HubCommand::Private { to, text } => {
                let Some(user) = self.user_by_uid(*to) else {
                    return vec![Action::Event(HubEvent::HubMessage(
                        "user is no longer online".into(),
                    ))];
                };
                let line = format!(
                    "$To: {} From: {} $<{}> {}",
                    user.nick,
                    cfg.nick,
                    cfg.nick,
                    nmdc::escape(text)
                );
                vec![self.send(cfg, &line)]
            }
            HubCommand::Search(spec) => {
                let wire = search::nmdc_search_wire(spec, cfg);
                vec![self.send(cfg, &wire)]
            }
            HubCommand::RequestConnection { uid, .. } => {
                let Some(user) = self.user_by_uid(*uid) else {
                    return Vec::new();
                };
                let nick = user.nick.clone();
                if cfg.active {
                    let ip = cfg.active_ip.map(|i| i.to_string()).unwrap_or_default();
                    vec![self.send(
                        cfg,
                        &format!("$ConnectToMe {nick} {ip}:{}", cfg.active_port),
                    )]
                } else {
                    vec![self.send(cfg, &format!("$RevConnectToMe {} {nick}", cfg.nick))]
                }
            }
            HubCommand::Password(pass) => {
                vec![self.send(cfg, &format!("$MyPass {pass}"))]
            }
            HubCommand::UpdateInfo => {
                vec![self.send(cfg, &self.myinfo(cfg, share.size(share.root())))]
            }
            HubCommand::Disconnect => vec![Action::Fatal {
                reason: "closed by user".into(),
                reconnect: false,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;

    fn cfg() -> HubConfig {
        HubConfig {
            nick: "tester".into(),
            ..HubConfig::default()
        }
    }

    fn logged_in(session: &mut NmdcSession, cfg: &HubConfig, share: &FileList) {
        let _ = session.handle_msg(b"$Lock EXTENDEDPROTOCOLABCABCABCABCABCABC Pk=x", cfg, share);
        let _ = session.handle_msg(b"$Hello tester", cfg, share);
        assert_eq!(session.phase(), Phase::Normal);
    }

    fn texts(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(b) => Some(String::from_utf8_lossy(b).into_owned()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lock_exchange_sends_supports_key_nick() {
        let mut s = NmdcSession::new(1);
        let share = FileList::new();
        let out = s.handle_msg(
            b"$Lock EXTENDEDPROTOCOLABCABCABCABCABCABC Pk=ref",
            &cfg(),
            &share,
        );
        let sent = texts(&out);
        assert!(sent[0].starts_with("$Supports "));
        assert!(sent[1].starts_with("$Key "));
        assert!(sent[2].starts_with("$ValidateNick tester"));
        assert_eq!(s.phase(), Phase::Identify);
    }

    #[test]
    fn short_lock_skips_supports() {
        let mut s = NmdcSession::new(1);
        let share = FileList::new();
        let out = s.handle_msg(b"$Lock OLDLOCKDATA Pk=x", &cfg(), &share);
        let sent = texts(&out);
        assert!(sent[0].starts_with("$Key "));
    }

    #[test]
    fn hello_logs_in_and_sends_myinfo() {
        let mut s = NmdcSession::new(1);
        let c = cfg();
        let share = FileList::new();
        let _ = s.handle_msg(b"$Lock EXTENDEDPROTOCOLX Pk=x", &c, &share);
        let out = s.handle_msg(b"$Hello tester", &c, &share);
        let sent = texts(&out);
        assert!(sent.iter().any(|m| m.starts_with("$Version ")));
        assert!(sent.iter().any(|m| m.starts_with("$GetNickList")));
        assert!(sent.iter().any(|m| m.starts_with("$MyINFO $ALL tester ")));
        assert!(
            out.iter()
                .any(|a| matches!(a, Action::Event(HubEvent::LoggedIn)))
        );
    }

    #[test]
    fn getpass_with_configured_password() {
        let mut s = NmdcSession::new(1);
        let mut c = cfg();
        c.password = Some("sekrit".into());
        let share = FileList::new();
        let _ = s.handle_msg(b"$Lock EXTENDEDPROTOCOLX Pk=x", &c, &share);
        let out = s.handle_msg(b"$GetPass", &c, &share);
        assert_eq!(texts(&out), vec!["$MyPass sekrit|"]);
        assert_eq!(s.phase(), Phase::Verify);
    }

    #[test]
    fn getpass_without_password_asks_owner() {
        let mut s = NmdcSession::new(1);
        let share = FileList::new();
        let _ = s.handle_msg(b"$Lock EXTENDEDPROTOCOLX Pk=x", &cfg(), &share);
        let out = s.handle_msg(b"$GetPass", &cfg(), &share);
        assert!(
            out.iter()
                .any(|a| matches!(a, Action::Event(HubEvent::PasswordNeeded)))
        );
    }

    #[test]
    fn validate_denide_is_terminal() {
        let mut s = NmdcSession::new(1);
        let share = FileList::new();
        let out = s.handle_msg(b"$ValidateDenide", &cfg(), &share);
        assert!(matches!(
            out[0],
            Action::Fatal {
                reconnect: false,
                ..
            }
        ));
    }

    #[test]
    fn myinfo_tracks_users_and_quits_remove() {
        let mut s = NmdcSession::new(1);
        let c = cfg();
        let share = FileList::new();
        logged_in(&mut s, &c, &share);

        let out = s.handle_msg(
            b"$MyINFO $ALL alice desc<dd V:1,M:A,H:1/0/0,S:3>$ $LAN\x01$$12345$",
            &c,
            &share,
        );
        assert!(
            out.iter()
                .any(|a| matches!(a, Action::Event(HubEvent::UserJoined(_))))
        );
        let alice = s.user("alice").unwrap();
        assert_eq!(alice.share, 12345);
        assert!(alice.active);
        assert_eq!(alice.uid, uid_from_nick(1, "alice"));

        // Second MyINFO is an update, not a join.
        let out = s.handle_msg(
            b"$MyINFO $ALL alice desc$ $LAN\x01$$777$",
            &c,
            &share,
        );
        assert!(
            out.iter()
                .any(|a| matches!(a, Action::Event(HubEvent::UserInfo(_))))
        );

        let out = s.handle_msg(b"$Quit alice", &c, &share);
        assert!(
            out.iter()
                .any(|a| matches!(a, Action::Event(HubEvent::UserQuit(_))))
        );
        assert!(s.user("alice").is_none());
    }

    #[test]
    fn chat_and_pm_events() {
        let mut s = NmdcSession::new(1);
        let c = cfg();
        let share = FileList::new();
        logged_in(&mut s, &c, &share);
        let _ = s.handle_msg(b"$MyINFO $ALL bob x$ $L\x01$$1$", &c, &share);

        let out = s.handle_msg(b"<bob> hi &#124; there", &c, &share);
        match &out[0] {
            Action::Event(HubEvent::Chat { from, text }) => {
                assert_eq!(*from, Some(uid_from_nick(1, "bob")));
                assert_eq!(text, "hi | there");
            }
            other => panic!("unexpected {other:?}"),
        }

        let out = s.handle_msg(b"$To: tester From: bob $<bob> secret", &c, &share);
        assert!(matches!(
            &out[0],
            Action::Event(HubEvent::Private { text, .. }) if text == "secret"
        ));
    }

    #[test]
    fn sr_becomes_result_event() {
        let mut s = NmdcSession::new(7);
        let c = cfg();
        let share = FileList::new();
        logged_in(&mut s, &c, &share);
        let out = s.handle_msg(
            b"$SR bob dir\\f.bin\x0542 1/3\x05TTH:LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ (1.2.3.4:411)",
            &c,
            &share,
        );
        match &out[0] {
            Action::Event(HubEvent::Result(r)) => {
                assert_eq!(r.uid, uid_from_nick(7, "bob"));
                assert_eq!(r.size, Some(42));
                assert!(r.tth.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ctm_detects_tls_suffix() {
        let mut s = NmdcSession::new(1);
        let c = cfg();
        let share = FileList::new();
        logged_in(&mut s, &c, &share);
        let out = s.handle_msg(b"$ConnectToMe tester 10.0.0.9:3000S", &c, &share);
        match &out[0] {
            Action::Event(HubEvent::ConnectToMe { addr, tls, .. }) => {
                assert_eq!(addr, "10.0.0.9:3000");
                assert!(tls);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_commands_ignored() {
        let mut s = NmdcSession::new(1);
        let share = FileList::new();
        assert!(s.handle_msg(b"$Bogus xyz", &cfg(), &share).is_empty());
        assert!(s.handle_msg(b"", &cfg(), &share).is_empty());
    }

    #[test]
    fn outbound_chat_is_escaped() {
        let mut s = NmdcSession::new(1);
        let c = cfg();
        let share = FileList::new();
        logged_in(&mut s, &c, &share);
        let out = s.command(&HubCommand::Chat("a|b".into()), &c, &share);
        assert_eq!(texts(&out), vec!["<tester> a&#124;b|"]);
    }

    #[test]
    fn commands_require_login() {
        let mut s = NmdcSession::new(1);
        let c = cfg();
        let share = FileList::new();
        let out = s.command(&HubCommand::Chat("hello".into()), &c, &share);
        assert!(texts(&out).is_empty());
    }
}
