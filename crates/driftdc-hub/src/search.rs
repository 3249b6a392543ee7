//! Search dispatch: outbound wire forms, inbound request answering,
//! result parsing, and the active-query registry.
//!
//! Reply transport follows the requester's capabilities: UDP `URES`
//! (ADC active), UDP `$SR` (NMDC active), hub-routed otherwise. When the
//! request announces a SUDP key and our policy allows, UDP replies are
//! encrypted. At most 5 results go to passive peers and 10 to active
//! ones.
//!
//! ADC search tokens embed the hub id (`q<id>h<hub>`), which is how a
//! UDP `RES` - carrying only the sender's CID - is mapped back to a hub
//! relationship to reconstruct the uid.

use crate::event::{SearchResult, SearchSpec};
use crate::hub::{HubConfig, SudpPolicy};
use crate::nmdc::Action;
use crate::user::{HubUser, Uid, uid_from_cid};
use crate::{MAX_RESULTS_ACTIVE, MAX_RESULTS_PASSIVE};
use data_encoding::BASE32_NOPAD;
use driftdc_filelist::{FileList, Matcher, MatcherSpec, SizePred};
use driftdc_proto::adc::{self, AdcMessage, AdcType, Cid, Sid};
use driftdc_proto::{SearchKind, SizeConstraint, nmdc, sudp};
use driftdc_tth::Root;
use std::collections::HashMap;

fn size_pred(size: SizeConstraint) -> SizePred {
    match size {
        SizeConstraint::None => SizePred::Any,
        SizeConstraint::Min(n) => SizePred::Ge(n),
        SizeConstraint::Max(n) => SizePred::Le(n),
    }
}

/// NMDC share path: backslash separators, no leading slash.
fn nmdc_path(list: &FileList, node: driftdc_filelist::NodeId) -> String {
    list.path(node)
        .trim_start_matches('/')
        .replace('/', "\\")
}

/// Answer an inbound NMDC `$Search`.
#[must_use]
pub fn answer_nmdc(
    req: &nmdc::SearchRequest,
    cfg: &HubConfig,
    share: &FileList,
) -> Vec<Action> {
    if cfg.chat_only {
        return Vec::new();
    }
    let tth = if req.kind == SearchKind::Tth {
        match req.pattern.strip_prefix("TTH:").and_then(|t| Root::from_base32(t).ok()) {
            Some(root) => Some(root),
            None => return Vec::new(),
        }
    } else {
        None
    };
    let spec = MatcherSpec {
        size: size_pred(req.size),
        kind: req.kind,
        include: if tth.is_some() {
            Vec::new()
        } else {
            req.pattern.split_whitespace().map(str::to_owned).collect()
        },
        exclude: Vec::new(),
        tth,
    };
    let Ok(matcher) = Matcher::compile(&spec) else {
        return Vec::new();
    };
    let (max, active) = match &req.origin {
        nmdc::SearchOrigin::Active(_) => (MAX_RESULTS_ACTIVE, true),
        nmdc::SearchOrigin::Passive(_) => (MAX_RESULTS_PASSIVE, false),
    };
    let hits = matcher.search(share, max);
    let mut out = Vec::new();
    for hit in hits {
        let is_dir = share.is_dir(hit);
        let hub_field = match share.tth(hit) {
            Some(root) if !is_dir => format!("TTH:{root}"),
            _ => cfg.hub_addr.clone(),
        };
        let sr = nmdc::build_sr(
            &cfg.nick,
            &nmdc_path(share, hit),
            (!is_dir).then(|| share.size(hit)),
            cfg.slots_free,
            cfg.upload_slots,
            &hub_field,
            &cfg.hub_addr,
            match &req.origin {
                nmdc::SearchOrigin::Passive(nick) => Some(nick.as_str()),
                nmdc::SearchOrigin::Active(_) => None,
            },
        );
        match &req.origin {
            nmdc::SearchOrigin::Active(addr) if active => {
                let mut payload = nmdc::encode_text(cfg.encoding, &sr);
                payload.push(b'|');
                out.push(Action::SendUdp {
                    to: addr.clone(),
                    payload,
                });
            }
            _ => {
                let mut bytes = nmdc::encode_text(cfg.encoding, &sr);
                bytes.push(b'|');
                out.push(Action::Send(bytes));
            }
        }
    }
    out
}

/// The NMDC wire form of an outbound search.
#[must_use]
pub fn nmdc_search_wire(spec: &SearchSpec, cfg: &HubConfig) -> String {
    let pattern = match (spec.kind, spec.tth) {
        (SearchKind::Tth, Some(root)) => format!("TTH:{root}"),
        _ => spec.terms.join(" "),
    };
    let origin = if cfg.active {
        let ip = cfg.active_ip.map(|i| i.to_string()).unwrap_or_default();
        nmdc::SearchOrigin::Active(format!("{ip}:{}", cfg.active_udp_port))
    } else {
        nmdc::SearchOrigin::Passive(cfg.nick.clone())
    };
    nmdc::build_search(&nmdc::SearchRequest {
        origin,
        kind: spec.kind,
        size: spec.size,
        pattern,
    })
}

/// The ADC wire form of an outbound search.
#[must_use]
pub fn adc_search_wire(spec: &SearchSpec, sid: Sid, cfg: &HubConfig) -> AdcMessage {
    let mut msg = AdcMessage::new(AdcType::B, adc::CMD_SCH).from_sid(sid);
    msg = msg.named("TO", &spec.token);
    if let (SearchKind::Tth, Some(root)) = (spec.kind, spec.tth) {
        msg = msg.named("TR", root.to_base32());
    } else {
        for term in &spec.terms {
            msg = msg.named("AN", term);
        }
        if spec.kind == SearchKind::Dir {
            msg = msg.named("TY", "2");
        }
    }
    match spec.size {
        SizeConstraint::None => {}
        SizeConstraint::Min(n) => msg = msg.named("GE", n.to_string()),
        SizeConstraint::Max(n) => msg = msg.named("LE", n.to_string()),
    }
    if let Some(key) = spec.sudp_key {
        if cfg.sudp_policy != SudpPolicy::Disabled {
            msg = msg.named("KY", BASE32_NOPAD.encode(&key));
        }
    }
    msg
}

/// Answer an inbound ADC `SCH`.
#[must_use]
pub fn answer_adc(
    msg: &AdcMessage,
    requester_sid: Sid,
    own_sid: Sid,
    own_cid: &Cid,
    requester: Option<&HubUser>,
    cfg: &HubConfig,
    share: &FileList,
) -> Vec<Action> {
    if cfg.chat_only {
        return Vec::new();
    }
    let tth = msg.param("TR").and_then(|t| Root::from_base32(t).ok());
    let kind = if tth.is_some() {
        SearchKind::Tth
    } else if msg.param("TY") == Some("2") {
        SearchKind::Dir
    } else {
        SearchKind::Any
    };
    let mut size = SizePred::Any;
    if let Some(n) = msg.param("GE").and_then(|s| s.parse().ok()) {
        size = SizePred::Ge(n);
    }
    if let Some(n) = msg.param("LE").and_then(|s| s.parse().ok()) {
        size = SizePred::Le(n);
    }
    if let Some(n) = msg.param("EQ").and_then(|s| s.parse().ok()) {
        size = SizePred::Eq(n);
    }
    let spec = MatcherSpec {
        size,
        kind,
        include: msg.params("AN").map(str::to_owned).collect(),
        exclude: msg.params("NO").map(str::to_owned).collect(),
        tth,
    };
    let Ok(matcher) = Matcher::compile(&spec) else {
        return Vec::new();
    };

    // UDP replies when the requester is reachable; the hub otherwise.
    let udp_to = requester.and_then(|u| {
        let ip = u.ip?;
        let port = u.udp_port?;
        Some(format!("{ip}:{port}"))
    });
    let sudp_key = match (cfg.sudp_policy, msg.param("KY")) {
        (SudpPolicy::Disabled, _) | (_, None) => None,
        (_, Some(k)) => BASE32_NOPAD
            .decode(k.as_bytes())
            .ok()
            .and_then(|b| <[u8; 16]>::try_from(b).ok()),
    };
    let max = if udp_to.is_some() {
        MAX_RESULTS_ACTIVE
    } else {
        MAX_RESULTS_PASSIVE
    };
    let token = msg.param("TO");

    let mut out = Vec::new();
    for hit in matcher.search(share, max) {
        let is_dir = share.is_dir(hit);
        let path = if is_dir {
            format!("{}/", share.path(hit))
        } else {
            share.path(hit)
        };
        let mut res = if udp_to.is_some() {
            AdcMessage::new(AdcType::U, adc::CMD_RES).arg(own_cid.to_base32())
        } else {
            AdcMessage::new(AdcType::D, adc::CMD_RES)
                .from_sid(own_sid)
                .to_sid(requester_sid)
        };
        res = res
            .named("FN", path)
            .named("SI", share.size(hit).to_string())
            .named("SL", cfg.slots_free.to_string());
        if let Some(root) = share.tth(hit) {
            if !is_dir {
                res = res.named("TR", root.to_base32());
            }
        }
        if let Some(t) = token {
            res = res.named("TO", t);
        }
        let mut line = res.to_line().into_bytes();
        line.push(b'\n');
        match &udp_to {
            Some(addr) => {
                let payload = match sudp_key {
                    Some(key) => sudp::encrypt(&key, &line),
                    None => line,
                };
                out.push(Action::SendUdp {
                    to: addr.clone(),
                    payload,
                });
            }
            None => out.push(Action::Send(line)),
        }
    }
    out
}

/// Decode a hub-routed or UDP ADC `RES` into a [`SearchResult`].
#[must_use]
pub fn parse_adc_result(msg: &AdcMessage, uid: Uid) -> Option<SearchResult> {
    let path = msg.param("FN")?.to_owned();
    let size: u64 = msg.param("SI").and_then(|s| s.parse().ok())?;
    let slots_free = msg
        .param("SL")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let tth = msg.param("TR").and_then(|t| Root::from_base32(t).ok());
    let is_dir = path.ends_with('/');
    Some(SearchResult {
        uid,
        path,
        size: (!is_dir).then_some(size),
        slots_free,
        tth,
    })
}

/// A registered outbound search, alive for the life of its result view.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Registry id.
    pub id: u64,
    /// What was searched for.
    pub kind: SearchKind,
    /// Size restriction.
    pub size: SizeConstraint,
    /// Include terms.
    pub terms: Vec<String>,
    /// Exact root for TTH queries.
    pub tth: Option<Root>,
    /// SUDP reply key, generated when the policy prefers encryption.
    pub key: Option<[u8; 16]>,
}

/// Registry of live queries, keyed by id; owns SUDP keys and token
/// parsing.
#[derive(Default)]
pub struct SearchRegistry {
    queries: HashMap<u64, SearchQuery>,
    next_id: u64,
}

/// A datagram decoded by [`SearchRegistry::parse_udp`].
#[derive(Debug)]
pub enum UdpHit {
    /// NMDC `$SR`: the caller maps `hub_addr` to a hub to derive the
    /// uid from the nick.
    Nmdc(nmdc::SrResult),
    /// ADC `RES` with the uid already reconstructed from CID + token.
    Adc {
        /// Parsed result.
        result: SearchResult,
        /// The query it answers.
        query: u64,
    },
}

impl SearchRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query; generates a SUDP key when `sudp` is set.
    pub fn register(
        &mut self,
        kind: SearchKind,
        size: SizeConstraint,
        terms: Vec<String>,
        tth: Option<Root>,
        sudp: bool,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.queries.insert(
            id,
            SearchQuery {
                id,
                kind,
                size,
                terms,
                tth,
                key: sudp.then(sudp::generate_key),
            },
        );
        id
    }

    /// Drop a query (its result view closed).
    pub fn remove(&mut self, id: u64) {
        self.queries.remove(&id);
    }

    /// A live query by id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&SearchQuery> {
        self.queries.get(&id)
    }

    /// The per-hub broadcast form of a query.
    #[must_use]
    pub fn spec_for_hub(&self, id: u64, hub_id: u64) -> Option<SearchSpec> {
        let q = self.queries.get(&id)?;
        Some(SearchSpec {
            kind: q.kind,
            size: q.size,
            terms: q.terms.clone(),
            tth: q.tth,
            token: make_token(id, hub_id),
            sudp_key: q.key,
        })
    }

    /// Queries whose predicate accepts `result` (client-side filter for
    /// NMDC, where results carry no token).
    #[must_use]
    pub fn matching(&self, result: &SearchResult) -> Vec<u64> {
        self.queries
            .values()
            .filter(|q| query_accepts(q, result))
            .map(|q| q.id)
            .collect()
    }

    /// Decode an inbound search datagram: trial SUDP decryption against
    /// every live key, then `$SR` or `URES` parsing.
    #[must_use]
    pub fn parse_udp(&self, payload: &[u8]) -> Option<UdpHit> {
        if let Some(hit) = self.parse_plain(payload) {
            return Some(hit);
        }
        for q in self.queries.values() {
            let Some(key) = q.key else { continue };
            if let Some(plain) = sudp::decrypt(&key, payload) {
                if let Some(hit) = self.parse_plain(&plain) {
                    return Some(hit);
                }
            }
        }
        None
    }

    fn parse_plain(&self, payload: &[u8]) -> Option<UdpHit> {
        let text = std::str::from_utf8(payload).ok()?;
        let line = text.trim_end_matches(['\n', '|']);
        if let Some(args) = line.strip_prefix("$SR ") {
            return nmdc::parse_sr(args).ok().map(UdpHit::Nmdc);
        }
        let msg = AdcMessage::parse(line).ok()?;
        if msg.kind != AdcType::U || msg.command != adc::CMD_RES {
            return None;
        }
        let cid = Cid::parse(msg.args.first()?).ok()?;
        let (query, hub_id) = parse_token(msg.param("TO")?)?;
        self.queries.contains_key(&query).then_some(())?;
        let uid = uid_from_cid(hub_id, &cid);
        let result = parse_adc_result(&msg, uid)?;
        Some(UdpHit::Adc { result, query })
    }
}

fn query_accepts(q: &SearchQuery, r: &SearchResult) -> bool {
    if let Some(want) = q.tth {
        return r.tth == Some(want);
    }
    match (q.size, r.size) {
        (SizeConstraint::Min(n), Some(s)) if s < n => return false,
        (SizeConstraint::Max(n), Some(s)) if s > n => return false,
        (_, None) if q.kind != SearchKind::Dir && q.kind != SearchKind::Any => return false,
        _ => {}
    }
    let path = r.path.to_lowercase();
    q.terms.iter().all(|t| path.contains(&t.to_lowercase()))
}

fn make_token(query: u64, hub_id: u64) -> String {
    format!("q{query:x}h{hub_id:x}")
}

fn parse_token(token: &str) -> Option<(u64, u64)> {
    let rest = token.strip_prefix('q')?;
    let (q, h) = rest.split_once('h')?;
    Some((
        u64::from_str_radix(q, 16).ok()?,
        u64::from_str_radix(h, 16).ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;

    fn share() -> FileList {
        let mut fl = FileList::new();
        let d = fl.add_dir(fl.root(), "stuff").unwrap();
        fl.add_file(d, "alpha.mp3", 1000, Root([1; 24]), None).unwrap();
        fl.add_file(d, "beta.bin", 2000, Root([2; 24]), None).unwrap();
        fl
    }

    fn cfg() -> HubConfig {
        HubConfig {
            nick: "me".into(),
            hub_addr: "10.0.0.1:411".into(),
            ..HubConfig::default()
        }
    }

    #[test]
    fn nmdc_active_request_replies_via_udp() {
        let req = nmdc::SearchRequest {
            origin: nmdc::SearchOrigin::Active("9.9.9.9:412".into()),
            kind: SearchKind::Any,
            size: SizeConstraint::None,
            pattern: "alpha".into(),
        };
        let out = answer_nmdc(&req, &cfg(), &share());
        assert_eq!(out.len(), 1);
        match &out[0] {
            Action::SendUdp { to, payload } => {
                assert_eq!(to, "9.9.9.9:412");
                let text = String::from_utf8_lossy(payload);
                assert!(text.starts_with("$SR me stuff\\alpha.mp3\x051000"));
                assert!(text.contains("TTH:"));
                assert!(text.ends_with('|'));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn nmdc_passive_request_replies_via_hub_with_target() {
        let req = nmdc::SearchRequest {
            origin: nmdc::SearchOrigin::Passive("someone".into()),
            kind: SearchKind::Any,
            size: SizeConstraint::None,
            pattern: "stuff".into(),
        };
        let out = answer_nmdc(&req, &cfg(), &share());
        // Directory itself plus both files under it.
        assert_eq!(out.len(), 3);
        for a in &out {
            match a {
                Action::Send(b) => {
                    let text = String::from_utf8_lossy(b);
                    assert!(text.contains("\x05someone"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn passive_results_are_capped_at_five() {
        let mut fl = FileList::new();
        for i in 0..20 {
            fl.add_file(fl.root(), &format!("match{i}"), 1, Root([i; 24]), None)
                .unwrap();
        }
        let req = nmdc::SearchRequest {
            origin: nmdc::SearchOrigin::Passive("x".into()),
            kind: SearchKind::Any,
            size: SizeConstraint::None,
            pattern: "match".into(),
        };
        assert_eq!(answer_nmdc(&req, &cfg(), &fl).len(), MAX_RESULTS_PASSIVE);
    }

    #[test]
    fn chat_only_hub_never_answers() {
        let mut c = cfg();
        c.chat_only = true;
        let req = nmdc::SearchRequest {
            origin: nmdc::SearchOrigin::Passive("x".into()),
            kind: SearchKind::Any,
            size: SizeConstraint::None,
            pattern: "alpha".into(),
        };
        assert!(answer_nmdc(&req, &c, &share()).is_empty());
    }

    #[test]
    fn adc_request_via_hub() {
        let msg = AdcMessage::parse("BSCH BBBB ANalpha TOq1h2").unwrap();
        let out = answer_adc(
            &msg,
            Sid(*b"BBBB"),
            Sid(*b"AAAA"),
            &Cid([5; 24]),
            None,
            &cfg(),
            &share(),
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            Action::Send(b) => {
                let text = String::from_utf8_lossy(b);
                assert!(text.starts_with("DRES AAAA BBBB "));
                assert!(text.contains("FN/stuff/alpha.mp3"));
                assert!(text.contains("SI1000"));
                assert!(text.contains("TOq1h2"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn adc_tth_request_finds_exact_file() {
        let root = Root([2; 24]);
        let line = format!("BSCH BBBB TR{} TOq0h0", root.to_base32());
        let msg = AdcMessage::parse(&line).unwrap();
        let out = answer_adc(
            &msg,
            Sid(*b"BBBB"),
            Sid(*b"AAAA"),
            &Cid([5; 24]),
            None,
            &cfg(),
            &share(),
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn adc_active_requester_gets_udp() {
        let mut user = HubUser::from_adc(1, Sid(*b"BBBB"), &Cid([7; 24]), "alice");
        user.ip = Some("5.6.7.8".parse().unwrap());
        user.udp_port = Some(7000);
        let msg = AdcMessage::parse("BSCH BBBB ANalpha").unwrap();
        let out = answer_adc(
            &msg,
            Sid(*b"BBBB"),
            Sid(*b"AAAA"),
            &Cid([5; 24]),
            Some(&user),
            &cfg(),
            &share(),
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            Action::SendUdp { to, payload } => {
                assert_eq!(to, "5.6.7.8:7000");
                assert!(String::from_utf8_lossy(payload).starts_with("URES "));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sudp_reply_is_encrypted_and_registry_decrypts() {
        let mut reg = SearchRegistry::new();
        let id = reg.register(SearchKind::Any, SizeConstraint::None, vec!["alpha".into()], None, true);
        let key = reg.get(id).unwrap().key.unwrap();

        let mut user = HubUser::from_adc(2, Sid(*b"BBBB"), &Cid([7; 24]), "alice");
        user.ip = Some("5.6.7.8".parse().unwrap());
        user.udp_port = Some(7000);
        let line = format!("BSCH BBBB ANalpha KY{} TO{}", BASE32_NOPAD.encode(&key), make_token(id, 2));
        let msg = AdcMessage::parse(&line).unwrap();
        let out = answer_adc(
            &msg,
            Sid(*b"BBBB"),
            Sid(*b"AAAA"),
            &Cid([5; 24]),
            Some(&user),
            &cfg(),
            &share(),
        );
        let Action::SendUdp { payload, .. } = &out[0] else {
            panic!("expected UDP");
        };
        // Ciphertext, not a URES line.
        assert!(!payload.starts_with(b"URES "));
        match reg.parse_udp(payload) {
            Some(UdpHit::Adc { result, query }) => {
                assert_eq!(query, id);
                assert_eq!(result.path, "/stuff/alpha.mp3");
                // uid derives from hub 2 and the replying CID.
                assert_eq!(result.uid, uid_from_cid(2, &Cid([5; 24])));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn plain_udp_sr_parses() {
        let reg = SearchRegistry::new();
        let dgram =
            b"$SR bob dir\\f\x0510 1/2\x05TTH:LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ (1.2.3.4)|";
        match reg.parse_udp(dgram) {
            Some(UdpHit::Nmdc(sr)) => {
                assert_eq!(sr.nick, "bob");
                assert_eq!(sr.hub_addr, "1.2.3.4");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn registry_matching_filters_results() {
        let mut reg = SearchRegistry::new();
        let id = reg.register(
            SearchKind::Any,
            SizeConstraint::Min(100),
            vec!["alpha".into()],
            None,
            false,
        );
        let hit = SearchResult {
            uid: Uid(1),
            path: "share\\Alpha.mp3".into(),
            size: Some(500),
            slots_free: 1,
            tth: None,
        };
        assert_eq!(reg.matching(&hit), vec![id]);
        let miss = SearchResult {
            size: Some(50),
            ..hit.clone()
        };
        assert!(reg.matching(&miss).is_empty());
        reg.remove(id);
        assert!(reg.matching(&hit).is_empty());
    }

    #[test]
    fn token_roundtrip() {
        let t = make_token(0x2a, 0x7);
        assert_eq!(parse_token(&t), Some((0x2a, 0x7)));
        assert_eq!(parse_token("garbage"), None);
    }
}
