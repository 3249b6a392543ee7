//! NMDC wire syntax.
//!
//! Messages are `|`-terminated commands in a per-hub byte encoding. This
//! module handles the byte-level transforms: text escaping, the Lock→Key
//! handshake, `$Search`/`$SR` grammar, and `$MyINFO` assembly. The codes
//! and layouts follow the NeoModus protocol as implemented by the
//! surviving hub software.

use crate::{ProtoError, SearchKind, SizeConstraint};
use encoding_rs::Encoding;

/// Escape user-visible text for embedding in a command.
///
/// `$`, `|` and `&` collide with framing and are written as HTML-style
/// entities.
#[must_use]
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '$' => out.push_str("&#36;"),
            '|' => out.push_str("&#124;"),
            '&' => out.push_str("&amp;"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse [`escape`]. Unknown entities are left untouched.
#[must_use]
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let replaced = [("&#36;", "$"), ("&#124;", "|"), ("&amp;", "&")]
            .iter()
            .find(|(ent, _)| rest.starts_with(ent));
        if let Some((ent, ch)) = replaced {
            out.push_str(ch);
            rest = &rest[ent.len()..];
        } else {
            out.push('&');
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Decode hub bytes to text using the hub's configured encoding.
///
/// Undecodable sequences are replaced, never fatal; NMDC predates any
/// charset discipline.
#[must_use]
pub fn decode_text(enc: &'static Encoding, bytes: &[u8]) -> String {
    let (text, _, _) = enc.decode(bytes);
    text.into_owned()
}

/// Encode text to hub bytes. Unmappable characters become numeric
/// references, matching what the reference clients send.
#[must_use]
pub fn encode_text(enc: &'static Encoding, s: &str) -> Vec<u8> {
    let (bytes, _, _) = enc.encode(s);
    bytes.into_owned()
}

/// Bytes that may not appear literally in a `$Key` payload.
const KEY_FORBIDDEN: [u8; 6] = [0, 5, 36, 96, 124, 126];

/// The Lock→Key handshake transform.
///
/// Given the lock string from `$Lock`, produces the bytes to send back in
/// `$Key`. Locks shorter than 3 bytes yield an empty key; no conforming
/// hub sends one.
#[must_use]
pub fn lock_to_key(lock: &[u8]) -> Vec<u8> {
    let len = lock.len();
    if len < 3 {
        return Vec::new();
    }
    let mut key = vec![0u8; len];
    key[0] = lock[0] ^ lock[len - 1] ^ lock[len - 2] ^ 5;
    for i in (1..len).rev() {
        key[i] = lock[i] ^ lock[i - 1];
    }
    let mut out = Vec::with_capacity(len);
    for b in key {
        let swapped = ((b << 4) & 0xF0) | ((b >> 4) & 0x0F);
        if KEY_FORBIDDEN.contains(&swapped) {
            out.extend_from_slice(format!("/%DCN{swapped:03}%/").as_bytes());
        } else {
            out.push(swapped);
        }
    }
    out
}

/// Split a raw message into command name and argument string.
///
/// `$Lock EXTENDED... Pk=x` → `("$Lock", "EXTENDED... Pk=x")`; chat lines
/// (no leading `$`) return an empty command.
#[must_use]
pub fn split_command(line: &str) -> (&str, &str) {
    if !line.starts_with('$') {
        return ("", line);
    }
    match line.find(' ') {
        Some(pos) => (&line[..pos], &line[pos + 1..]),
        None => (line, ""),
    }
}

/// A parsed `$SR` search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrResult {
    /// Nick of the peer holding the result.
    pub nick: String,
    /// Full share path; directory results carry no size.
    pub path: String,
    /// File size, `None` for a directory result.
    pub size: Option<u64>,
    /// Free upload slots at the peer.
    pub slots_free: u32,
    /// Total upload slots at the peer.
    pub slots_total: u32,
    /// Tiger root in base32, present on file results from TTH-capable
    /// peers; directory results carry the hub name here instead.
    pub tth: Option<String>,
    /// The trailing `(hub_ip[:port])` field, used to map UDP results
    /// back to a hub session.
    pub hub_addr: String,
}

/// Parse the argument string of `$SR`.
///
/// The grammar is ambiguous from the front (paths may contain spaces and
/// parentheses), so this scans backward: the trailing `(hubaddr)`, the
/// preceding `\x05TTH:<base32>` or `\x05<hubname>`, the ` free/total`
/// slot pair, then `path\x05size` or bare `path`.
///
/// # Errors
///
/// Returns [`ProtoError::BadNmdc`] when any layer of the backward scan is
/// missing.
pub fn parse_sr(args: &str) -> Result<SrResult, ProtoError> {
    let (nick, rest) = args
        .split_once(' ')
        .ok_or(ProtoError::BadNmdc("SR: missing nick"))?;

    // Trailing "(hubaddr)".
    let rest = rest
        .strip_suffix(')')
        .ok_or(ProtoError::BadNmdc("SR: missing hub address"))?;
    let open = rest
        .rfind(" (")
        .ok_or(ProtoError::BadNmdc("SR: missing hub address"))?;
    let hub_addr = rest[open + 2..].to_owned();
    let rest = &rest[..open];

    // "\x05TTH:root" or "\x05hubname".
    let sep = rest
        .rfind('\x05')
        .ok_or(ProtoError::BadNmdc("SR: missing hub field"))?;
    let hub_field = &rest[sep + 1..];
    let rest = &rest[..sep];
    let tth = hub_field.strip_prefix("TTH:").map(str::to_owned);

    // " free/total".
    let slot_sep = rest
        .rfind(' ')
        .ok_or(ProtoError::BadNmdc("SR: missing slots"))?;
    let slots = &rest[slot_sep + 1..];
    let rest = &rest[..slot_sep];
    let (free, total) = slots
        .split_once('/')
        .ok_or(ProtoError::BadNmdc("SR: malformed slots"))?;
    let slots_free: u32 = free
        .parse()
        .map_err(|_| ProtoError::BadNmdc("SR: malformed slots"))?;
    let slots_total: u32 = total
        .parse()
        .map_err(|_| ProtoError::BadNmdc("SR: malformed slots"))?;

    // "path\x05size" for files, bare path for directories.
    let (path, size) = match rest.rfind('\x05') {
        Some(pos) => {
            let size: u64 = rest[pos + 1..]
                .parse()
                .map_err(|_| ProtoError::BadNmdc("SR: malformed size"))?;
            (rest[..pos].to_owned(), Some(size))
        }
        None => (rest.to_owned(), None),
    };

    Ok(SrResult {
        nick: nick.to_owned(),
        path,
        size,
        slots_free,
        slots_total,
        tth,
        hub_addr,
    })
}

/// Build the argument string of an outbound `$SR`, addressed to
/// `target_nick` when routed through the hub.
#[must_use]
pub fn build_sr(
    own_nick: &str,
    path: &str,
    size: Option<u64>,
    slots_free: u32,
    slots_total: u32,
    hub_field: &str,
    hub_addr: &str,
    target_nick: Option<&str>,
) -> String {
    let mut out = format!("$SR {own_nick} {path}");
    if let Some(size) = size {
        out.push('\x05');
        out.push_str(&size.to_string());
    }
    out.push_str(&format!(
        " {slots_free}/{slots_total}\x05{hub_field} ({hub_addr})"
    ));
    if let Some(nick) = target_nick {
        out.push('\x05');
        out.push_str(nick);
    }
    out
}

/// NMDC numeric codes for [`SearchKind`].
#[must_use]
pub fn search_kind_code(kind: SearchKind) -> u8 {
    match kind {
        SearchKind::Any => 1,
        SearchKind::Audio => 2,
        SearchKind::Archive => 3,
        SearchKind::Doc => 4,
        SearchKind::Exe => 5,
        SearchKind::Img => 6,
        SearchKind::Video => 7,
        SearchKind::Dir => 8,
        SearchKind::Tth => 9,
    }
}

/// Inverse of [`search_kind_code`].
#[must_use]
pub fn search_kind_from_code(code: u8) -> Option<SearchKind> {
    Some(match code {
        1 => SearchKind::Any,
        2 => SearchKind::Audio,
        3 => SearchKind::Archive,
        4 => SearchKind::Doc,
        5 => SearchKind::Exe,
        6 => SearchKind::Img,
        7 => SearchKind::Video,
        8 => SearchKind::Dir,
        9 => SearchKind::Tth,
        _ => return None,
    })
}

/// A decoded `$Search` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// `ip:port` of an active searcher, or the nick of a passive one.
    pub origin: SearchOrigin,
    /// What is being searched for.
    pub kind: SearchKind,
    /// Size restriction.
    pub size: SizeConstraint,
    /// Pattern: space-separated terms with spaces encoded as `$`, or
    /// `TTH:<root>` for [`SearchKind::Tth`].
    pub pattern: String,
}

/// Where search results should be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOrigin {
    /// Active searcher: reply with a UDP `$SR` to this address.
    Active(String),
    /// Passive searcher: route the `$SR` back through the hub.
    Passive(String),
}

/// Encode the `a?b?c?d?e` payload of `$Search`.
#[must_use]
pub fn build_search(req: &SearchRequest) -> String {
    let origin = match &req.origin {
        SearchOrigin::Active(addr) => addr.clone(),
        SearchOrigin::Passive(nick) => format!("Hub:{nick}"),
    };
    let (restricted, is_max, bound) = match req.size {
        SizeConstraint::None => ('F', 'T', 0),
        SizeConstraint::Min(n) => ('T', 'F', n),
        SizeConstraint::Max(n) => ('T', 'T', n),
    };
    let pattern = req.pattern.replace(' ', "$");
    format!(
        "$Search {origin} {restricted}?{is_max}?{bound}?{}?{pattern}",
        search_kind_code(req.kind)
    )
}

/// Decode the argument string of `$Search`.
///
/// # Errors
///
/// Returns [`ProtoError::BadNmdc`] on a missing field or an unknown type
/// code.
pub fn parse_search(args: &str) -> Result<SearchRequest, ProtoError> {
    let (origin_s, spec) = args
        .split_once(' ')
        .ok_or(ProtoError::BadNmdc("Search: missing origin"))?;
    let origin = match origin_s.strip_prefix("Hub:") {
        Some(nick) => SearchOrigin::Passive(nick.to_owned()),
        None => SearchOrigin::Active(origin_s.to_owned()),
    };

    let mut fields = spec.splitn(5, '?');
    let restricted = fields
        .next()
        .ok_or(ProtoError::BadNmdc("Search: missing size flag"))?;
    let is_max = fields
        .next()
        .ok_or(ProtoError::BadNmdc("Search: missing max flag"))?;
    let bound: u64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(ProtoError::BadNmdc("Search: malformed size"))?;
    let code: u8 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(ProtoError::BadNmdc("Search: malformed type"))?;
    let pattern = fields
        .next()
        .ok_or(ProtoError::BadNmdc("Search: missing pattern"))?;

    let size = if restricted == "T" {
        if is_max == "T" {
            SizeConstraint::Max(bound)
        } else {
            SizeConstraint::Min(bound)
        }
    } else {
        SizeConstraint::None
    };
    let kind =
        search_kind_from_code(code).ok_or(ProtoError::BadNmdc("Search: unknown type code"))?;

    Ok(SearchRequest {
        origin,
        kind,
        size,
        pattern: pattern.replace('$', " "),
    })
}

/// Assemble a `$MyINFO` argument string.
///
/// `status` is the single status byte (1 = normal); `share` in bytes.
#[must_use]
pub fn build_myinfo(
    nick: &str,
    description: &str,
    tag: &str,
    connection: &str,
    status: u8,
    email: &str,
    share: u64,
) -> String {
    format!(
        "$ALL {nick} {}{}$ ${}{}${}${share}$",
        escape(description),
        tag,
        connection,
        char::from(status),
        escape(email),
    )
}

/// Fields picked out of a peer's `$MyINFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MyInfo {
    /// Peer nick.
    pub nick: String,
    /// Description with the client tag stripped.
    pub description: String,
    /// Raw `<client V:x,M:A,...>` tag, empty if absent.
    pub tag: String,
    /// Advertised share size in bytes.
    pub share: u64,
}

/// Parse a `$MyINFO $ALL nick desc$ $conn$email$share$` argument string.
///
/// # Errors
///
/// Returns [`ProtoError::BadNmdc`] when the dollar-framed layout is
/// broken; unknown trailing fields are ignored.
pub fn parse_myinfo(args: &str) -> Result<MyInfo, ProtoError> {
    let rest = args
        .strip_prefix("$ALL ")
        .ok_or(ProtoError::BadNmdc("MyINFO: missing $ALL"))?;
    let (nick, rest) = rest
        .split_once(' ')
        .ok_or(ProtoError::BadNmdc("MyINFO: missing nick"))?;
    let mut fields = rest.split('$');
    let desc_tag = fields.next().unwrap_or("");
    let _sep = fields.next();
    let _conn = fields.next();
    let _email = fields.next();
    let share: u64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .unwrap_or(0);

    let (description, tag) = match desc_tag.rfind('<') {
        Some(pos) if desc_tag.ends_with('>') => {
            (desc_tag[..pos].to_owned(), desc_tag[pos..].to_owned())
        }
        _ => (desc_tag.to_owned(), String::new()),
    };

    Ok(MyInfo {
        nick: nick.to_owned(),
        description: unescape(&description),
        tag,
        share,
    })
}
