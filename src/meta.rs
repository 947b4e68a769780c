//! Line-level building blocks shared by all document grammars.
//!
//! A Tor directory document is a sequence of lines, each starting with a
//! keyword followed by whitespace-separated arguments. Some items are
//! followed by a multi-line object (see [`block`]).

pub(crate) mod block;

use std::collections::BTreeMap;
use std::fmt;
use std::iter::{Enumerate, Peekable};
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{DocumentParseError, ErrorContext};

//
// External dependencies
//
use chrono::{offset::TimeZone, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use memchr::memmem;
use nom::bytes::complete::take_till1;
use nom::character::complete::multispace1;
use nom::combinator::all_consuming;
use nom::multi::many0;
use nom::sequence::{pair, preceded};
use nom::IResult;
use regex::Regex;

lazy_static! {
    static ref NICKNAME: Regex = Regex::new(r"^[A-Za-z0-9]{1,19}$").unwrap();
    static ref HEX_DIGEST: Regex = Regex::new(r"^[0-9A-Fa-f]{40}$").unwrap();
    static ref HOSTNAME: Regex =
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.-]{0,251}[A-Za-z0-9])?$").unwrap();
}

/// Format of all timestamps in directory documents (always UTC).
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single keyword line, split into its keyword and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Item<'a> {
    pub keyword: &'a str,
    pub args: Vec<&'a str>,
    /// 1-based line number within the document.
    pub line: usize,
}

fn word(input: &str) -> IResult<&str, &str> {
    take_till1(char::is_whitespace)(input)
}

fn keyword_line(input: &str) -> IResult<&str, (&str, Vec<&str>)> {
    all_consuming(pair(word, many0(preceded(multispace1, word))))(input)
}

impl<'a> Item<'a> {
    /// Split one (already trimmed, non-empty) line into an item.
    pub(crate) fn parse(line: &'a str, line_no: usize) -> Result<Item<'a>, DocumentParseError> {
        let (_, (keyword, args)) =
            keyword_line(line).map_err(|_| DocumentParseError::MalformedLine {
                keyword: line.to_string(),
                line: line_no,
                reason: "cannot split into keyword and arguments".to_string(),
            })?;
        Ok(Item {
            keyword,
            args,
            line: line_no,
        })
    }

    /// Number of whitespace-separated tokens, keyword included.
    pub(crate) fn n_tokens(&self) -> usize {
        self.args.len() + 1
    }

    /// Build a MalformedLine error for this item.
    pub(crate) fn malformed(&self, reason: impl Into<String>) -> DocumentParseError {
        DocumentParseError::MalformedLine {
            keyword: self.keyword.to_string(),
            line: self.line,
            reason: reason.into(),
        }
    }

    /// All arguments, joined back together with single spaces.
    pub(crate) fn joined_args(&self) -> String {
        self.args.join(" ")
    }

    /// All arguments as owned strings.
    pub(crate) fn owned_args(&self) -> Vec<String> {
        self.args.iter().map(|a| a.to_string()).collect()
    }
}

/// A cursor over the lines of a document.
///
/// Blank lines between items are skipped; object blocks are read raw with
/// [`Lines::next_line`].
pub(crate) struct Lines<'a> {
    inner: Peekable<Enumerate<std::str::Lines<'a>>>,
}

impl<'a> Lines<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        Lines {
            inner: text.lines().enumerate().peekable(),
        }
    }

    fn skip_blank(&mut self) {
        while let Some((_, line)) = self.inner.peek() {
            if !line.trim().is_empty() {
                break;
            }
            self.inner.next();
        }
    }

    /// Tokenize the next non-blank line without consuming it.
    pub(crate) fn peek_item(&mut self) -> Result<Option<Item<'a>>, DocumentParseError> {
        self.skip_blank();
        match self.inner.peek() {
            Some(&(idx, line)) => Item::parse(line.trim(), idx + 1).map(Some),
            None => Ok(None),
        }
    }

    /// Consume and tokenize the next non-blank line.
    pub(crate) fn next_item(&mut self) -> Result<Option<Item<'a>>, DocumentParseError> {
        self.skip_blank();
        match self.inner.next() {
            Some((idx, line)) => Item::parse(line.trim(), idx + 1).map(Some),
            None => Ok(None),
        }
    }

    /// Consume the next raw line (trimmed), together with its line number.
    pub(crate) fn next_line(&mut self) -> Option<(usize, &'a str)> {
        self.inner.next().map(|(idx, line)| (idx + 1, line.trim()))
    }

    /// Return the next non-blank raw line (trimmed) without consuming it.
    pub(crate) fn peek_line(&mut self) -> Option<&'a str> {
        self.skip_blank();
        self.inner.peek().map(|(_, line)| line.trim())
    }

    /// True if nothing but blank lines remain.
    pub(crate) fn is_exhausted(&mut self) -> bool {
        self.skip_blank();
        self.inner.peek().is_none()
    }
}

/// A 20-byte digest used to identify keys, relays and documents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    /// Build a fingerprint from raw digest bytes.
    pub fn from_u8(bytes: &[u8]) -> Result<Fingerprint, DocumentParseError> {
        if bytes.len() != 20 {
            return Err(DocumentParseError::invalid(format!(
                "digest of {} bytes (expected 20)",
                bytes.len()
            )));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(bytes);
        Ok(Fingerprint(out))
    }

    /// Parse 40 hexadecimal digits (either case).
    pub fn from_str_hex(s: &str) -> Result<Fingerprint, DocumentParseError> {
        if !HEX_DIGEST.is_match(s) {
            return Err(DocumentParseError::invalid(format!("hex fingerprint '{}'", s)));
        }
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).context("hex fingerprint")?;
        }
        Ok(Fingerprint(out))
    }

    /// Parse base64 (padding optional), as used in consensus `r` lines.
    pub fn from_str_b64(s: &str) -> Result<Fingerprint, DocumentParseError> {
        let bytes = base64::decode_config(s.trim_end_matches('='), base64::STANDARD_NO_PAD)
            .map_err(|_| DocumentParseError::invalid(format!("base64 digest '{}'", s)))?;
        Fingerprint::from_u8(&bytes)
    }

    /// Unpadded base64, the form consensus documents use.
    pub fn to_b64(&self) -> String {
        base64::encode_config(self.0, base64::STANDARD_NO_PAD)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for Fingerprint {
    fn from(bytes: [u8; 20]) -> Self {
        Fingerprint(bytes)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl FromStr for Fingerprint {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_str_hex(s)
    }
}

/// Convert a `YYYY-MM-DD HH:MM:SS` pair of tokens to epoch seconds.
pub(crate) fn parse_timestamp(
    date: &str,
    time: &str,
    context: &str,
) -> Result<i64, DocumentParseError> {
    let naive = NaiveDateTime::parse_from_str(&format!("{} {}", date, time), TIME_FORMAT)
        .map_err(|_| DocumentParseError::invalid(format!("{} timestamp", context)))?;
    Ok(Utc.from_utc_datetime(&naive).timestamp())
}

/// Parse a TCP port. Zero is allowed and conventionally means "none".
pub(crate) fn parse_port(s: &str, context: &str) -> Result<u16, DocumentParseError> {
    s.parse::<u16>().context(context)
}

pub(crate) fn parse_ipv4(s: &str, context: &str) -> Result<Ipv4Addr, DocumentParseError> {
    s.parse::<Ipv4Addr>().context(context)
}

pub(crate) fn check_nickname(s: &str) -> Result<(), DocumentParseError> {
    if NICKNAME.is_match(s) {
        Ok(())
    } else {
        Err(DocumentParseError::invalid(format!("nickname '{}'", s)))
    }
}

/// Accept an IPv4 address or a DNS hostname.
pub(crate) fn check_host(s: &str, context: &str) -> Result<(), DocumentParseError> {
    if s.parse::<Ipv4Addr>().is_ok() || HOSTNAME.is_match(s) {
        Ok(())
    } else {
        Err(DocumentParseError::invalid(format!("{} '{}'", context, s)))
    }
}

/// Parse `key=value` arguments with integer values.
pub(crate) fn parse_int_pairs(
    args: &[&str],
    context: &str,
) -> Result<BTreeMap<String, i64>, DocumentParseError> {
    let mut out = BTreeMap::new();
    for arg in args {
        let (k, v) = arg
            .split_once('=')
            .ok_or_else(|| DocumentParseError::invalid(format!("{} entry '{}'", context, arg)))?;
        if k.is_empty() {
            return Err(DocumentParseError::invalid(format!("{} entry '{}'", context, arg)));
        }
        let v = v.parse::<i64>().context(format!("{} value for '{}'", context, k))?;
        out.insert(k.to_string(), v);
    }
    Ok(out)
}

/// Offsets in `text` where `needle` starts a line.
fn line_starts<'a>(text: &'a [u8], needle: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
    memmem::find_iter(text, needle).filter(move |&p| p == 0 || text[p - 1] == b'\n')
}

/// Return the signed part of a document: from the line starting with
/// `first` through the first later line that is exactly the keyword
/// `last`, including that line's terminator. Either line ending is
/// accepted and kept as is.
pub(crate) fn signed_content<'a>(text: &'a str, first: &str, last: &str) -> Option<&'a str> {
    let bytes = text.as_bytes();
    let start = line_starts(bytes, first.as_bytes()).next()?;
    let rest = &bytes[start..];
    let end = line_starts(rest, last.as_bytes()).find_map(|p| {
        let after = &rest[p + last.len()..];
        if after.starts_with(b"\n") {
            Some(p + last.len() + 1)
        } else if after.starts_with(b"\r\n") {
            Some(p + last.len() + 2)
        } else {
            None
        }
    })?;
    text.get(start..start + end)
}

/// Copy the first item with `keyword`, with the object following it if
/// any, and insert the copy right after the original. Also returns the
/// line number of the copy.
#[cfg(test)]
pub(crate) fn repeat_item(text: &str, keyword: &str) -> Option<(String, usize)> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines
        .iter()
        .position(|l| l.split_whitespace().next() == Some(keyword))?;
    let mut end = start + 1;
    if lines.get(end).map_or(false, |l| l.starts_with("-----BEGIN ")) {
        while !lines.get(end)?.starts_with("-----END ") {
            end += 1;
        }
        end += 1;
    }
    let mut out = lines[..end].to_vec();
    out.extend_from_slice(&lines[start..end]);
    out.extend_from_slice(&lines[end..]);
    Some((out.join("\n") + "\n", end + 1))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_items() {
        let item = Item::parse("r  test1 \tabc def", 4).unwrap();
        assert_eq!(item.keyword, "r");
        assert_eq!(item.args, vec!["test1", "abc", "def"]);
        assert_eq!(item.n_tokens(), 4);
        assert_eq!(item.line, 4);

        let item = Item::parse("directory-footer", 1).unwrap();
        assert!(item.args.is_empty());
    }

    #[test]
    fn cursor_skips_blank_lines() {
        let mut lines = Lines::new("a 1\n\n   \nb 2\n");
        assert_eq!(lines.next_item().unwrap().unwrap().keyword, "a");
        assert_eq!(lines.peek_item().unwrap().unwrap().keyword, "b");
        let b = lines.next_item().unwrap().unwrap();
        assert_eq!(b.line, 4);
        assert!(lines.is_exhausted());
        assert!(lines.next_item().unwrap().is_none());
    }

    #[test]
    fn fingerprints() {
        let hex = "0EB7C8AAD759B26D37B857E7080FD2B138B75A1C";
        let fp = Fingerprint::from_str_hex(hex).unwrap();
        assert_eq!(fp.to_string(), hex);
        assert_eq!(fp.to_b64(), "DrfIqtdZsm03uFfnCA/SsTi3Whw");
        assert_eq!(Fingerprint::from_str_b64("DrfIqtdZsm03uFfnCA/SsTi3Whw").unwrap(), fp);
        assert_eq!(
            Fingerprint::from_str_hex(&hex.to_lowercase()).unwrap(),
            fp
        );
        assert!(Fingerprint::from_str_hex("0EB7").is_err());
        assert!(Fingerprint::from_str_b64("AAAA").is_err());
    }

    #[test]
    fn timestamps() {
        assert_eq!(
            parse_timestamp("2014-03-02", "13:00:00", "test").unwrap(),
            1393765200
        );
        assert!(parse_timestamp("2014-03-02", "13:00:0x", "test").is_err());
        assert!(parse_timestamp("2014-13-02", "13:00:00", "test").is_err());
    }

    #[test]
    fn validators() {
        assert!(parse_port("9001", "port").is_ok());
        assert!(parse_port("65536", "port").is_err());
        assert!(parse_ipv4("10.0.0.300", "ip").is_err());
        assert!(check_nickname("moria1").is_ok());
        assert!(check_nickname("not-a-nick").is_err());
        assert!(check_host("tor.example.org", "address").is_ok());
        assert!(check_host("bad host!", "address").is_err());

        let pairs = parse_int_pairs(&["a=1", "b=-2"], "params").unwrap();
        assert_eq!(pairs["b"], -2);
        assert!(parse_int_pairs(&["cbttestfreq=x"], "params").is_err());
        assert!(parse_int_pairs(&["novalue"], "params").is_err());
    }

    #[test]
    fn content_range() {
        let text = "@type x\nrouter a\nfoo router-signature\nrouter-signature\nsig";
        assert_eq!(
            signed_content(text, "router ", "router-signature"),
            Some("router a\nfoo router-signature\nrouter-signature\n")
        );
        let crlf = "router a\r\nrouter-signatures\r\nrouter-signature\r\nsig";
        assert_eq!(
            signed_content(crlf, "router ", "router-signature"),
            Some("router a\r\nrouter-signatures\r\nrouter-signature\r\n")
        );
        assert_eq!(signed_content(text, "nope", "x"), None);
        let unterminated = "router a\nrouter-signature";
        assert_eq!(signed_content(unterminated, "router ", "router-signature"), None);
    }
}
