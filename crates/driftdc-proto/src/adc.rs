//! ADC wire syntax.
//!
//! Messages are UTF-8 lines: a one-byte message type, a three-letter
//! command, then space-separated arguments. `B`, `D`, `E` and `F`
//! messages carry a source session id after the command; `D` and `E` add
//! a destination session id; `F` adds a feature filter. Spaces inside
//! arguments are escaped `\s`, newlines `\n`, backslashes `\\`.

use crate::ProtoError;
use data_encoding::BASE32_NOPAD;
use std::fmt;

/// Pack a three-letter command into its 24-bit little-endian dispatch
/// form.
#[must_use]
pub const fn cmd(name: &[u8; 3]) -> u32 {
    u32::from_le_bytes([name[0], name[1], name[2], 0])
}

/// `SUP` - protocol support negotiation.
pub const CMD_SUP: u32 = cmd(b"SUP");
/// `STA` - status/error report.
pub const CMD_STA: u32 = cmd(b"STA");
/// `INF` - client information broadcast.
pub const CMD_INF: u32 = cmd(b"INF");
/// `MSG` - chat or private message.
pub const CMD_MSG: u32 = cmd(b"MSG");
/// `SCH` - search request.
pub const CMD_SCH: u32 = cmd(b"SCH");
/// `RES` - search result.
pub const CMD_RES: u32 = cmd(b"RES");
/// `CTM` - connect-to-me request.
pub const CMD_CTM: u32 = cmd(b"CTM");
/// `RCM` - reverse connect-to-me request.
pub const CMD_RCM: u32 = cmd(b"RCM");
/// `GPA` - password request.
pub const CMD_GPA: u32 = cmd(b"GPA");
/// `PAS` - password response.
pub const CMD_PAS: u32 = cmd(b"PAS");
/// `QUI` - session quit notice.
pub const CMD_QUI: u32 = cmd(b"QUI");
/// `GET` - file request (client-client).
pub const CMD_GET: u32 = cmd(b"GET");
/// `GFI` - file info request (client-client).
pub const CMD_GFI: u32 = cmd(b"GFI");
/// `SND` - file send header (client-client).
pub const CMD_SND: u32 = cmd(b"SND");
/// `SID` - session id assignment.
pub const CMD_SID: u32 = cmd(b"SID");

/// ADC message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcType {
    /// Broadcast (carries a source SID).
    B,
    /// Client-client (no SIDs).
    C,
    /// Direct message (source and destination SIDs).
    D,
    /// Echoed direct message (source and destination SIDs).
    E,
    /// Feature broadcast (source SID plus ±FOURCC filters).
    F,
    /// Hub-to-client.
    H,
    /// Info (hub-originated).
    I,
    /// UDP datagram.
    U,
}

impl AdcType {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            b'B' => Self::B,
            b'C' => Self::C,
            b'D' => Self::D,
            b'E' => Self::E,
            b'F' => Self::F,
            b'H' => Self::H,
            b'I' => Self::I,
            b'U' => Self::U,
            _ => return None,
        })
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::B => b'B',
            Self::C => b'C',
            Self::D => b'D',
            Self::E => b'E',
            Self::F => b'F',
            Self::H => b'H',
            Self::I => b'I',
            Self::U => b'U',
        }
    }

    fn has_source(self) -> bool {
        matches!(self, Self::B | Self::D | Self::E | Self::F)
    }

    fn has_dest(self) -> bool {
        matches!(self, Self::D | Self::E)
    }
}

/// A 4-character base32 session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sid(pub [u8; 4]);

impl Sid {
    /// Parse from its 4-character wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::BadAdc`] unless the input is exactly four
    /// base32 characters.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        let b = s.as_bytes();
        if b.len() != 4 || !b.iter().all(|c| c.is_ascii_uppercase() || (b'2'..=b'7').contains(c)) {
            return Err(ProtoError::BadAdc("bad session id"));
        }
        Ok(Sid([b[0], b[1], b[2], b[3]]))
    }

    /// The wire string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Constructed from validated ASCII.
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 24-byte ADC client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cid(pub [u8; 24]);

impl Cid {
    /// Parse the 39-character base32 wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::BadAdc`] on bad length or alphabet.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        if s.len() != 39 {
            return Err(ProtoError::BadAdc("bad CID length"));
        }
        let bytes = BASE32_NOPAD
            .decode(s.as_bytes())
            .map_err(|_| ProtoError::BadAdc("bad CID encoding"))?;
        let arr: [u8; 24] = bytes
            .try_into()
            .map_err(|_| ProtoError::BadAdc("bad CID length"))?;
        Ok(Cid(arr))
    }

    /// Encode to the wire form.
    #[must_use]
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }
}

/// Escape an argument for the wire.
#[must_use]
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse [`escape`].
///
/// # Errors
///
/// Returns [`ProtoError::BadAdc`] on a dangling or unknown escape.
pub fn unescape(s: &str) -> Result<String, ProtoError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            _ => return Err(ProtoError::BadAdc("bad escape")),
        }
    }
    Ok(out)
}

/// One `±FOURCC` entry of a feature broadcast filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSel {
    /// `true` for `+FEAT` (required), `false` for `-FEAT` (forbidden).
    pub required: bool,
    /// The feature FOURCC.
    pub feature: [u8; 4],
}

/// A parsed ADC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcMessage {
    /// Message type.
    pub kind: AdcType,
    /// Command in 24-bit little-endian dispatch form.
    pub command: u32,
    /// Source session id (`B`, `D`, `E`, `F`).
    pub source: Option<Sid>,
    /// Destination session id (`D`, `E`).
    pub dest: Option<Sid>,
    /// Feature filters (`F`).
    pub features: Vec<FeatureSel>,
    /// Unescaped positional arguments.
    pub args: Vec<String>,
}

impl AdcMessage {
    /// Build an outbound message with no SIDs.
    #[must_use]
    pub fn new(kind: AdcType, command: u32) -> Self {
        Self {
            kind,
            command,
            source: None,
            dest: None,
            features: Vec::new(),
            args: Vec::new(),
        }
    }

    /// Attach a source SID.
    #[must_use]
    pub fn from_sid(mut self, sid: Sid) -> Self {
        self.source = Some(sid);
        self
    }

    /// Attach a destination SID.
    #[must_use]
    pub fn to_sid(mut self, sid: Sid) -> Self {
        self.dest = Some(sid);
        self
    }

    /// Append a positional argument (unescaped form).
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a named `XXvalue` parameter.
    #[must_use]
    pub fn named(self, prefix: &str, value: impl AsRef<str>) -> Self {
        debug_assert_eq!(prefix.len(), 2);
        self.arg(format!("{prefix}{}", value.as_ref()))
    }

    /// First argument with the given two-letter prefix, without the
    /// prefix.
    #[must_use]
    pub fn param(&self, prefix: &str) -> Option<&str> {
        self.args.iter().find_map(|a| a.strip_prefix(prefix))
    }

    /// All arguments with the given two-letter prefix, without the
    /// prefix.
    pub fn params<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.args.iter().filter_map(move |a| a.strip_prefix(prefix))
    }

    /// Parse one line (without the trailing `\n`).
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::BadAdc`] on an unknown type byte, a short
    /// command, a malformed SID, or a bad escape. Empty lines are
    /// keep-alives and also rejected here; the session layer filters
    /// them first.
    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        let bytes = line.as_bytes();
        if bytes.len() < 4 {
            return Err(ProtoError::BadAdc("short message"));
        }
        let kind =
            AdcType::from_byte(bytes[0]).ok_or(ProtoError::BadAdc("unknown message type"))?;
        if !bytes[1..4].iter().all(u8::is_ascii_uppercase) {
            return Err(ProtoError::BadAdc("bad command name"));
        }
        let command = cmd(&[bytes[1], bytes[2], bytes[3]]);

        let mut fields = line[4..].split(' ');
        let lead = fields.next().unwrap_or("");
        if !lead.is_empty() {
            return Err(ProtoError::BadAdc("missing space after command"));
        }

        let mut msg = Self::new(kind, command);
        if kind.has_source() {
            let sid = fields.next().ok_or(ProtoError::BadAdc("missing source sid"))?;
            msg.source = Some(Sid::parse(sid)?);
        }
        if kind.has_dest() {
            let sid = fields.next().ok_or(ProtoError::BadAdc("missing dest sid"))?;
            msg.dest = Some(Sid::parse(sid)?);
        }
        if kind == AdcType::F {
            let filter = fields.next().ok_or(ProtoError::BadAdc("missing feature filter"))?;
            msg.features = parse_features(filter)?;
        }
        for raw in fields {
            msg.args.push(unescape(raw)?);
        }
        Ok(msg)
    }

    /// Serialize to one line (without the trailing `\n`).
    #[must_use]
    pub fn to_line(&self) -> String {
        let mut out = String::new();
        out.push(char::from(self.kind.to_byte()));
        let c = self.command.to_le_bytes();
        out.push(char::from(c[0]));
        out.push(char::from(c[1]));
        out.push(char::from(c[2]));
        if let Some(sid) = self.source {
            out.push(' ');
            out.push_str(sid.as_str());
        }
        if let Some(sid) = self.dest {
            out.push(' ');
            out.push_str(sid.as_str());
        }
        if self.kind == AdcType::F {
            out.push(' ');
            for sel in &self.features {
                out.push(if sel.required { '+' } else { '-' });
                for b in sel.feature {
                    out.push(char::from(b));
                }
            }
        }
        for arg in &self.args {
            out.push(' ');
            out.push_str(&escape(arg));
        }
        out
    }

    /// Whether a feature broadcast applies to a client announcing
    /// `supported`: every `+FEAT` must be announced, every `-FEAT` must
    /// not be.
    #[must_use]
    pub fn features_match(&self, supported: &[[u8; 4]]) -> bool {
        self.features.iter().all(|sel| {
            let has = supported.contains(&sel.feature);
            has == sel.required
        })
    }
}

fn parse_features(filter: &str) -> Result<Vec<FeatureSel>, ProtoError> {
    let bytes = filter.as_bytes();
    if bytes.len() % 5 != 0 {
        return Err(ProtoError::BadAdc("bad feature filter"));
    }
    let mut out = Vec::with_capacity(bytes.len() / 5);
    for chunk in bytes.chunks_exact(5) {
        let required = match chunk[0] {
            b'+' => true,
            b'-' => false,
            _ => return Err(ProtoError::BadAdc("bad feature filter")),
        };
        out.push(FeatureSel {
            required,
            feature: [chunk[1], chunk[2], chunk[3], chunk[4]],
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_binf_example() {
        let msg = AdcMessage::parse(
            "BINF AAAA IDABCDEFGHIJKLMNOPQRSTUVWXYZ234567ABCDEFGHIJKL NIAlice",
        )
        .unwrap();
        assert_eq!(msg.kind, AdcType::B);
        assert_eq!(msg.command, CMD_INF);
        assert_eq!(msg.source, Some(Sid(*b"AAAA")));
        assert_eq!(msg.dest, None);
        assert_eq!(
            msg.args,
            vec![
                "IDABCDEFGHIJKLMNOPQRSTUVWXYZ234567ABCDEFGHIJKL".to_owned(),
                "NIAlice".to_owned()
            ]
        );
        assert_eq!(msg.param("NI"), Some("Alice"));
    }

    #[test]
    fn escape_example() {
        assert_eq!(escape("a b\nc\\"), "a\\sb\\nc\\\\");
        assert_eq!(unescape("a\\sb\\nc\\\\").unwrap(), "a b\nc\\");
    }

    #[test]
    fn unescape_rejects_dangling() {
        assert!(unescape("tail\\").is_err());
        assert!(unescape("bad\\q").is_err());
    }

    #[test]
    fn direct_message_sids() {
        let msg = AdcMessage::parse("DCTM AAAA BBBB ADC/1.0 3000 12345").unwrap();
        assert_eq!(msg.kind, AdcType::D);
        assert_eq!(msg.command, CMD_CTM);
        assert_eq!(msg.source.unwrap().as_str(), "AAAA");
        assert_eq!(msg.dest.unwrap().as_str(), "BBBB");
        assert_eq!(msg.args, vec!["ADC/1.0", "3000", "12345"]);
    }

    #[test]
    fn info_message_no_sid() {
        let msg = AdcMessage::parse("ISID ABCD").unwrap();
        assert_eq!(msg.kind, AdcType::I);
        assert_eq!(msg.command, CMD_SID);
        assert_eq!(msg.source, None);
        assert_eq!(msg.args, vec!["ABCD"]);
    }

    #[test]
    fn feature_broadcast_filters() {
        let msg = AdcMessage::parse("FSCH AAAA +TCP4-NAT0 ANx TOauto").unwrap();
        assert_eq!(msg.features.len(), 2);
        assert!(msg.features[0].required);
        assert_eq!(&msg.features[0].feature, b"TCP4");
        assert!(!msg.features[1].required);
        assert_eq!(&msg.features[1].feature, b"NAT0");

        assert!(msg.features_match(&[*b"TCP4"]));
        assert!(!msg.features_match(&[*b"TCP4", *b"NAT0"]));
        assert!(!msg.features_match(&[]));
    }

    #[test]
    fn rejects_malformed() {
        assert!(AdcMessage::parse("").is_err());
        assert!(AdcMessage::parse("XObK").is_err());
        assert!(AdcMessage::parse("Binf AAAA").is_err());
        assert!(AdcMessage::parse("BINF").is_err());
        assert!(AdcMessage::parse("BINF aaaa NIx").is_err());
        assert!(AdcMessage::parse("BINFAAAA").is_err());
        assert!(AdcMessage::parse("FSCH AAAA TCP4").is_err());
    }

    #[test]
    fn serialize_roundtrip() {
        let msg = AdcMessage::new(AdcType::B, CMD_SCH)
            .from_sid(Sid(*b"AB34"))
            .named("AN", "two words")
            .named("TO", "search1");
        let line = msg.to_line();
        assert_eq!(line, "BSCH AB34 ANtwo\\swords TOsearch1");
        assert_eq!(AdcMessage::parse(&line).unwrap(), msg);
    }

    #[test]
    fn named_param_helpers() {
        let msg = AdcMessage::parse("BSCH AAAA ANfoo ANbar SI100").unwrap();
        assert_eq!(msg.param("AN"), Some("foo"));
        let all: Vec<_> = msg.params("AN").collect();
        assert_eq!(all, vec!["foo", "bar"]);
        assert_eq!(msg.param("TR"), None);
    }

    #[test]
    fn cid_roundtrip() {
        let cid = Cid([7u8; 24]);
        let s = cid.to_base32();
        assert_eq!(s.len(), 39);
        assert_eq!(Cid::parse(&s).unwrap(), cid);
        assert!(Cid::parse("TOOSHORT").is_err());
    }

    #[test]
    fn cmd_dispatch_form() {
        // 24-bit little-endian packing of the ASCII letters.
        assert_eq!(CMD_INF, u32::from_le_bytes([b'I', b'N', b'F', 0]));
        assert_ne!(CMD_INF, CMD_SUP);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_escape_roundtrip(s in "[^\\x00]*") {
                prop_assert_eq!(unescape(&escape(&s)).unwrap(), s);
            }

            #[test]
            fn prop_parse_doesnt_panic(line in "\\PC*") {
                let _ = AdcMessage::parse(&line);
            }
        }
    }
}
