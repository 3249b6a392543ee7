//! ADC hub session state machine.
//!
//! Mirrors [`crate::nmdc`] for the ADC dialect: UTF-8 lines in, actions
//! out. The session owns the PID/CID identity, the SID assigned by the
//! hub, and the user table keyed by SID.

use crate::event::{HubCommand, HubEvent, SearchResult};
use crate::hub::HubConfig;
use crate::nmdc::{Action, Phase};
use crate::search;
use crate::user::{HubUser, Uid, uid_from_cid};
use data_encoding::BASE32_NOPAD;
use digest::Digest;
use driftdc_filelist::FileList;
use driftdc_proto::adc::{self, AdcMessage, AdcType, Cid, Sid};
use std::collections::HashMap;
use tiger::Tiger;

/// Features we announce in `SU`.
const OWN_FEATURES: &[[u8; 4]] = &[*b"TCP4", *b"UDP4", *b"SUD1"];

/// ADC session state.
pub struct AdcSession {
    hub_id: u64,
    phase: Phase,
    pid: [u8; 24],
    cid: Cid,
    sid: Option<Sid>,
    users: HashMap<Sid, HubUser>,
    /// Keyprint of our own TLS certificate, announced as `KP`.
    own_keyprint: Option<[u8; 32]>,
}

fn tiger_of(parts: &[&[u8]]) -> [u8; 24] {
    let mut h = Tiger::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

/// Derive the client id from a private id.
#[must_use]
pub fn cid_from_pid(pid: &[u8; 24]) -> Cid {
    Cid(tiger_of(&[pid]))
}

impl AdcSession {
    /// Fresh session. The PID (and thus CID) is the client-wide
    /// identity shared by every hub session and peer handshake.
    #[must_use]
    pub fn new(hub_id: u64, pid: [u8; 24], own_keyprint: Option<[u8; 32]>) -> Self {
        let cid = cid_from_pid(&pid);
        Self {
            hub_id,
            phase: Phase::Protocol,
            pid,
            cid,
            sid: None,
            users: HashMap::new(),
            own_keyprint,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Our CID on this hub.
    #[must_use]
    pub fn cid(&self) -> &Cid {
        &self.cid
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

    fn send(msg: &AdcMessage) -> Action {
        let mut bytes = msg.to_line().into_bytes();
        bytes.push(b'\n');
        Action::Send(bytes)
    }

    /// The opening message of a session.
    #[must_use]
    pub fn greeting(&self) -> Vec<Action> {
        let msg = AdcMessage::new(AdcType::H, adc::CMD_SUP)
            .arg("ADBASE")
            .arg("ADTIGR");
        vec![Self::send(&msg)]
    }

    fn own_inf(&self, cfg: &HubConfig, share: &FileList, include_pid: bool) -> AdcMessage {
        let Some(sid) = self.sid else {
            // Callers only build INF after ISID.
            return AdcMessage::new(AdcType::B, adc::CMD_INF);
        };
        let mut msg = AdcMessage::new(AdcType::B, adc::CMD_INF)
            .from_sid(sid)
            .named("ID", self.cid.to_base32());
        if include_pid {
            msg = msg.named("PD", BASE32_NOPAD.encode(&self.pid));
        }
        msg = msg
            .named("NI", &cfg.nick)
            .named("VE", concat!("driftdc ", env!("CARGO_PKG_VERSION")))
            .named("SS", share.size(share.root()).to_string())
            .named(
                "SF",
                share.walk().filter(|&n| !share.is_dir(n)).count().to_string(),
            )
            .named("SL", cfg.upload_slots.to_string())
            .named("HN", "1")
            .named("HR", "0")
            .named("HO", "0");
        if !cfg.description.is_empty() {
            msg = msg.named("DE", &cfg.description);
        }
        if cfg.active {
            if let Some(ip) = cfg.active_ip {
                msg = msg.named("I4", ip.to_string());
            }
            msg = msg.named("U4", cfg.active_udp_port.to_string());
            let features: Vec<String> = OWN_FEATURES
                .iter()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect();
            msg = msg.named("SU", features.join(","));
        } else {
            msg = msg.named("SU", "SUD1");
        }
        if let Some(kp) = self.own_keyprint {
            msg = msg.named("KP", format!("SHA256/{}", BASE32_NOPAD.encode(&kp)));
        }
        msg
    }

    /// Feed one line (without the `\n`).
    #[must_use]
    pub fn handle_msg(&mut self, raw: &[u8], cfg: &HubConfig, share: &FileList) -> Vec<Action> {
        if raw.is_empty() {
            return Vec::new();
        }
        // Invalid UTF-8 is fatal for an ADC session.
        let Ok(line) = std::str::from_utf8(raw) else {
            return vec![Action::Fatal {
                reason: "invalid UTF-8 from hub".into(),
                reconnect: true,
            }];
        };
        let msg = match AdcMessage::parse(line) {
            Ok(msg) => msg,
            Err(e) => {
                if self.phase == Phase::Normal {
                    tracing::debug!(error = %e, "ignoring malformed ADC message");
                    return Vec::new();
                }
                return vec![Action::Fatal {
                    reason: format!("protocol violation during handshake: {e}"),
                    reconnect: true,
                }];
            }
        };
        // Feature-filtered broadcasts that do not apply to us are
        // dropped wholesale.
        if msg.kind == AdcType::F && !msg.features_match(OWN_FEATURES) {
            return Vec::new();
        }
        match msg.command {
            adc::CMD_SUP => Vec::new(),
            adc::CMD_SID => self.on_sid(&msg, cfg, share),
            adc::CMD_INF => self.on_inf(&msg),
            adc::CMD_GPA => self.on_gpa(&msg, cfg),
            adc::CMD_STA => self.on_sta(&msg),
            adc::CMD_QUI => self.on_qui(&msg),
            adc::CMD_MSG => self.on_chat(&msg),
            adc::CMD_SCH => self.on_sch(&msg, cfg, share),
            adc::CMD_RES => self.on_res(&msg),
            adc::CMD_CTM => self.on_ctm(&msg),
            adc::CMD_RCM => self.on_rcm(&msg),
            other => {
                let b = other.to_le_bytes();
                tracing::debug!(
                    command = %String::from_utf8_lossy(&b[..3]),
                    "ignoring unknown ADC command"
                );
                Vec::new()
            }
        }
    }

    fn on_sid(&mut self, msg: &AdcMessage, cfg: &HubConfig, share: &FileList) -> Vec<Action> {
        let Some(sid) = msg.args.first().and_then(|s| Sid::parse(s).ok()) else {
            return vec![Action::Fatal {
                reason: "SID without a session id".into(),
                reconnect: true,
            }];
        };
        self.sid = Some(sid);
        self.phase = Phase::Identify;
        vec![Self::send(&self.own_inf(cfg, share, true))]
    }

    fn on_inf(&mut self, msg: &AdcMessage) -> Vec<Action> {
        let Some(sid) = msg.source else {
            // IINF: hub's own info.
            if let Some(name) = msg.param("NI") {
                return vec![Action::Event(HubEvent::HubMessage(format!(
                    "Hub name: {name}"
                )))];
            }
            return Vec::new();
        };
        if Some(sid) == self.sid {
            // Our own INF echoed back: presence accepted.
            if self.phase != Phase::Normal {
                self.phase = Phase::Normal;
                return vec![Action::Event(HubEvent::LoggedIn)];
            }
            return Vec::new();
        }
        let known = self.users.contains_key(&sid);
        if !known {
            let Some(cid) = msg.param("ID").and_then(|c| Cid::parse(c).ok()) else {
                tracing::debug!("INF without a CID, dropping");
                return Vec::new();
            };
            let nick = msg.param("NI").unwrap_or("");
            self.users
                .insert(sid, HubUser::from_adc(self.hub_id, sid, &cid, nick));
        }
        let Some(user) = self.users.get_mut(&sid) else {
            return Vec::new();
        };
        if let Some(nick) = msg.param("NI") {
            user.nick = nick.to_owned();
        }
        if let Some(share_size) = msg.param("SS").and_then(|s| s.parse().ok()) {
            user.share = share_size;
        }
        if let Some(slots) = msg.param("SL").and_then(|s| s.parse().ok()) {
            user.slots_free = slots;
        }
        if let Some(su) = msg.param("SU") {
            user.active = su.split(',').any(|f| f == "TCP4" || f == "TCP6");
            user.sudp = su.split(',').any(|f| f == "SUD1");
            user.tls = su.split(',').any(|f| f == "ADC0" || f == "ADCS");
        }
        if let Some(ip) = msg.param("I4").and_then(|s| s.parse().ok()) {
            user.ip = Some(ip);
        }
        if let Some(port) = msg.param("U4").and_then(|s| s.parse().ok()) {
            user.udp_port = Some(port);
        }
        let user = user.clone();
        vec![Action::Event(if known {
            HubEvent::UserInfo(user)
        } else {
            HubEvent::UserJoined(user)
        })]
    }

    fn on_gpa(&mut self, msg: &AdcMessage, cfg: &HubConfig) -> Vec<Action> {
        self.phase = Phase::Verify;
        let Some(data) = msg
            .args
            .first()
            .and_then(|d| BASE32_NOPAD.decode(d.as_bytes()).ok())
        else {
            return vec![Action::Fatal {
                reason: "GPA without random data".into(),
                reconnect: true,
            }];
        };
        let Some(pass) = &cfg.password else {
            return vec![Action::Event(HubEvent::PasswordNeeded)];
        };
        let digest = tiger_of(&[pass.as_bytes(), &data]);
        let reply = AdcMessage::new(AdcType::H, adc::CMD_PAS).arg(BASE32_NOPAD.encode(&digest));
        vec![Self::send(&reply)]
    }

    fn on_sta(&mut self, msg: &AdcMessage) -> Vec<Action> {
        let code = msg.args.first().map(String::as_str).unwrap_or("000");
        let text = msg.args.get(1).cloned().unwrap_or_default();
        let mut out = vec![Action::Event(HubEvent::HubMessage(format!(
            "hub status {code}: {text}"
        )))];
        if code.starts_with('2') {
            out.push(Action::Fatal {
                reason: format!("fatal hub status {code}: {text}"),
                reconnect: true,
            });
        }
        out
    }

    fn on_qui(&mut self, msg: &AdcMessage) -> Vec<Action> {
        let Some(sid) = msg.args.first().and_then(|s| Sid::parse(s).ok()) else {
            return Vec::new();
        };
        if Some(sid) == self.sid {
            // A ban (TL -1 or an explicit message) is terminal; a plain
            // QUI re-arms the reconnect timer.
            let banned = msg.param("TL").is_some_and(|t| t == "-1");
            let reason = msg.param("MS").unwrap_or("kicked from hub").to_owned();
            return vec![Action::Fatal {
                reason,
                reconnect: !banned,
            }];
        }
        match self.users.remove(&sid) {
            Some(user) => vec![Action::Event(HubEvent::UserQuit(user.uid))],
            None => Vec::new(),
        }
    }

    fn on_chat(&mut self, msg: &AdcMessage) -> Vec<Action> {
        let Some(text) = msg.args.first().cloned() else {
            return Vec::new();
        };
        let from = msg
            .source
            .and_then(|sid| self.users.get(&sid))
            .map(|u| u.uid);
        let event = match msg.kind {
            AdcType::D | AdcType::E => match from {
                Some(from) => HubEvent::Private { from, text },
                None => return Vec::new(),
            },
            _ if msg.source.is_none() => HubEvent::HubMessage(text),
            _ => HubEvent::Chat { from, text },
        };
        vec![Action::Event(event)]
    }

    fn on_sch(&mut self, msg: &AdcMessage, cfg: &HubConfig, share: &FileList) -> Vec<Action> {
        let Some(source) = msg.source else {
            return Vec::new();
        };
        if Some(source) == self.sid {
            return Vec::new();
        }
        let Some(sid) = self.sid else {
            return Vec::new();
        };
        let requester = self.users.get(&source);
        search::answer_adc(msg, source, sid, &self.cid, requester, cfg, share)
    }

    fn on_res(&mut self, msg: &AdcMessage) -> Vec<Action> {
        let Some(user) = msg.source.and_then(|sid| self.users.get(&sid)) else {
            return Vec::new();
        };
        match search::parse_adc_result(msg, user.uid) {
            Some(result) => vec![Action::Event(HubEvent::Result(result))],
            None => Vec::new(),
        }
    }

    fn on_ctm(&mut self, msg: &AdcMessage) -> Vec<Action> {
        // DCTM <proto> <port> <token>; the address comes from the
        // sender's INF.
        let Some(user) = msg.source.and_then(|sid| self.users.get(&sid)) else {
            return Vec::new();
        };
        let (Some(proto), Some(port)) = (msg.args.first(), msg.args.get(1)) else {
            return Vec::new();
        };
        let Some(ip) = user.ip else {
            tracing::debug!(nick = %user.nick, "CTM from a user without an address");
            return Vec::new();
        };
        let tls = proto.starts_with("ADCS");
        vec![Action::Event(HubEvent::ConnectToMe {
            uid: Some(user.uid),
            addr: format!("{ip}:{port}"),
            tls,
            token: msg.args.get(2).cloned(),
        })]
    }

    fn on_rcm(&mut self, msg: &AdcMessage) -> Vec<Action> {
        let Some(user) = msg.source.and_then(|sid| self.users.get(&sid)) else {
            return Vec::new();
        };
        vec![Action::Event(HubEvent::RevConnectToMe {
            uid: user.uid,
            token: msg.args.get(1).cloned(),
        })]
    }

    /// Serialize an outbound command.
    #[must_use]
    pub fn command(&mut self, cmd: &HubCommand, cfg: &HubConfig, share: &FileList) -> Vec<Action> {
        let Some(sid) = self.sid else {
            return vec![Action::Event(HubEvent::HubMessage(
                "not logged in yet".into(),
            ))];
        };
        if self.phase != Phase::Normal
            && !matches!(cmd, HubCommand::Password(_) | HubCommand::Disconnect)
        {
            return vec![Action::Event(HubEvent::HubMessage(
                "not logged in yet".into(),
            ))];
        }
        match cmd {
            HubCommand::Chat(text) => {
                let msg = AdcMessage::new(AdcType::B, adc::CMD_MSG)
                    .from_sid(sid)
                    .arg(text.clone());
                vec![Self::send(&msg)]
            }
            HubCommand::Private { to, text } => {
                let Some(dest) = self.user_by_uid(*to).and_then(|u| u.sid) else {
                    return vec![Action::Event(HubEvent::HubMessage(
                        "user is no longer online".into(),
                    ))];
                };
                let msg = AdcMessage::new(AdcType::E, adc::CMD_MSG)
                    .from_sid(sid)
                    .to_sid(dest)
                    .arg(text.clone())
                    .named("PM", sid.as_str());
                vec![Self::send(&msg)]
            }
            HubCommand::Search(spec) => {
                let msg = search::adc_search_wire(spec, sid, cfg);
                vec![Self::send(&msg)]
            }
            HubCommand::RequestConnection { uid, token } => {
                let Some(dest) = self.user_by_uid(*uid).and_then(|u| u.sid) else {
                    return Vec::new();
                };
                if cfg.active {
                    let msg = AdcMessage::new(AdcType::D, adc::CMD_CTM)
                        .from_sid(sid)
                        .to_sid(dest)
                        .arg("ADC/1.0")
                        .arg(cfg.active_port.to_string())
                        .arg(token.clone());
                    vec![Self::send(&msg)]
                } else {
                    let msg = AdcMessage::new(AdcType::D, adc::CMD_RCM)
                        .from_sid(sid)
                        .to_sid(dest)
                        .arg("ADC/1.0")
                        .arg(token.clone());
                    vec![Self::send(&msg)]
                }
            }
            HubCommand::Password(pass) => {
                // Replaying GPA data is not possible here; the hub will
                // repeat GPA if needed. Store-and-retry is the owner's
                // job.
                let msg = AdcMessage::new(AdcType::H, adc::CMD_PAS).arg(pass.clone());
                vec![Self::send(&msg)]
            }
            HubCommand::UpdateInfo => vec![Self::send(&self.own_inf(cfg, share, false))],
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

    fn texts(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(b) => Some(String::from_utf8_lossy(b).into_owned()),
                _ => None,
            })
            .collect()
    }

    fn user_inf(sid: &str, cid_byte: u8, nick: &str) -> Vec<u8> {
        let cid = Cid([cid_byte; 24]).to_base32();
        format!("BINF {sid} ID{cid} NI{nick} SS5000 SL2 SUTCP4,UDP4 I41.2.3.4").into_bytes()
    }

    fn login(s: &mut AdcSession, cfg: &HubConfig, share: &FileList) {
        let _ = s.handle_msg(b"ISUP ADBASE ADTIGR", cfg, share);
        let _ = s.handle_msg(b"ISID ABCD", cfg, share);
        let own = format!("BINF ABCD ID{} NItester", s.cid().to_base32());
        let _ = s.handle_msg(own.as_bytes(), cfg, share);
        assert_eq!(s.phase(), Phase::Normal);
    }

    #[test]
    fn greeting_announces_base_and_tigr() {
        let s = AdcSession::new(1, [11u8; 24], None);
        let out = s.greeting();
        assert_eq!(texts(&out), vec!["HSUP ADBASE ADTIGR\n"]);
    }

    #[test]
    fn sid_assignment_triggers_inf_with_pid() {
        let mut s = AdcSession::new(1, [11u8; 24], None);
        let c = cfg();
        let share = FileList::new();
        let out = s.handle_msg(b"ISID ABCD", &c, &share);
        let sent = &texts(&out)[0];
        assert!(sent.starts_with("BINF ABCD "));
        assert!(sent.contains(" PD"));
        assert!(sent.contains(" NItester"));
        assert!(sent.contains(" SU"));
        assert_eq!(s.phase(), Phase::Identify);
    }

    #[test]
    fn own_inf_echo_logs_in() {
        let mut s = AdcSession::new(1, [11u8; 24], None);
        let c = cfg();
        let share = FileList::new();
        let _ = s.handle_msg(b"ISID ABCD", &c, &share);
        let own = format!("BINF ABCD ID{} NItester", s.cid().to_base32());
        let out = s.handle_msg(own.as_bytes(), &c, &share);
        assert!(
            out.iter()
                .any(|a| matches!(a, Action::Event(HubEvent::LoggedIn)))
        );
    }

    #[test]
    fn invalid_utf8_is_fatal() {
        let mut s = AdcSession::new(1, [11u8; 24], None);
        let share = FileList::new();
        let out = s.handle_msg(&[0x42, 0xFF, 0xFE], &cfg(), &share);
        assert!(matches!(out[0], Action::Fatal { .. }));
    }

    #[test]
    fn user_join_info_quit() {
        let mut s = AdcSession::new(3, [11u8; 24], None);
        let c = cfg();
        let share = FileList::new();
        login(&mut s, &c, &share);

        let out = s.handle_msg(&user_inf("BBBB", 7, "alice"), &c, &share);
        assert!(
            out.iter()
                .any(|a| matches!(a, Action::Event(HubEvent::UserJoined(_))))
        );
        let expected_uid = uid_from_cid(3, &Cid([7; 24]));
        let user = s.user_by_uid(expected_uid).unwrap();
        assert_eq!(user.nick, "alice");
        assert_eq!(user.share, 5000);
        assert!(user.active);

        let out = s.handle_msg(b"BINF BBBB SS6000", &c, &share);
        assert!(
            out.iter()
                .any(|a| matches!(a, Action::Event(HubEvent::UserInfo(_))))
        );
        assert_eq!(s.user_by_uid(expected_uid).unwrap().share, 6000);

        let out = s.handle_msg(b"IQUI BBBB", &c, &share);
        assert!(
            out.iter()
                .any(|a| matches!(a, Action::Event(HubEvent::UserQuit(_))))
        );
        assert!(s.user_by_uid(expected_uid).is_none());
    }

    #[test]
    fn gpa_with_password_answers_tiger_digest() {
        let mut s = AdcSession::new(1, [11u8; 24], None);
        let mut c = cfg();
        c.password = Some("pw".into());
        let share = FileList::new();
        let _ = s.handle_msg(b"ISID ABCD", &c, &share);
        let data = BASE32_NOPAD.encode(&[9u8; 16]);
        let out = s.handle_msg(format!("IGPA {data}").as_bytes(), &c, &share);
        let sent = &texts(&out)[0];
        assert!(sent.starts_with("HPAS "));
        let expected = tiger_of(&[b"pw", &[9u8; 16]]);
        assert!(sent.contains(&BASE32_NOPAD.encode(&expected)));
        assert_eq!(s.phase(), Phase::Verify);
    }

    #[test]
    fn qui_for_own_sid_with_ban_is_terminal() {
        let mut s = AdcSession::new(1, [11u8; 24], None);
        let c = cfg();
        let share = FileList::new();
        login(&mut s, &c, &share);
        let out = s.handle_msg(b"IQUI ABCD TL-1 MSbanned", &c, &share);
        assert!(matches!(
            out[0],
            Action::Fatal {
                reconnect: false,
                ..
            }
        ));
    }

    #[test]
    fn ctm_builds_address_from_inf() {
        let mut s = AdcSession::new(1, [11u8; 24], None);
        let c = cfg();
        let share = FileList::new();
        login(&mut s, &c, &share);
        let _ = s.handle_msg(&user_inf("BBBB", 7, "alice"), &c, &share);
        let out = s.handle_msg(b"DCTM BBBB ABCD ADCS/0.10 3000 tok42", &c, &share);
        match &out[0] {
            Action::Event(HubEvent::ConnectToMe {
                uid,
                addr,
                tls,
                token,
            }) => {
                assert!(uid.is_some());
                assert_eq!(addr, "1.2.3.4:3000");
                assert!(tls);
                assert_eq!(token.as_deref(), Some("tok42"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn feature_filtered_broadcast_respects_our_features() {
        let mut s = AdcSession::new(1, [11u8; 24], None);
        let c = cfg();
        let share = FileList::new();
        login(&mut s, &c, &share);
        let _ = s.handle_msg(&user_inf("BBBB", 7, "alice"), &c, &share);
        // Requires NAT0 which we do not announce: dropped.
        let out = s.handle_msg(b"FSCH BBBB +NAT0 ANx", &c, &share);
        assert!(out.is_empty());
    }

    #[test]
    fn chat_and_private_messages() {
        let mut s = AdcSession::new(1, [11u8; 24], None);
        let c = cfg();
        let share = FileList::new();
        login(&mut s, &c, &share);
        let _ = s.handle_msg(&user_inf("BBBB", 7, "alice"), &c, &share);

        let out = s.handle_msg(b"BMSG BBBB hello\\sworld", &c, &share);
        assert!(matches!(
            &out[0],
            Action::Event(HubEvent::Chat { text, .. }) if text == "hello world"
        ));

        let out = s.handle_msg(b"EMSG BBBB ABCD psst PMBBBB", &c, &share);
        assert!(matches!(
            &out[0],
            Action::Event(HubEvent::Private { text, .. }) if text == "psst"
        ));
    }

    #[test]
    fn outbound_search_and_chat() {
        let mut s = AdcSession::new(1, [11u8; 24], None);
        let c = cfg();
        let share = FileList::new();
        login(&mut s, &c, &share);
        let out = s.command(&HubCommand::Chat("hi there".into()), &c, &share);
        assert_eq!(texts(&out), vec!["BMSG ABCD hi\\sthere\n"]);
    }
}
