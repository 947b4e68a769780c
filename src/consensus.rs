//! Tor consensus documents ("network-status-version 3")
//!
//! A consensus has four sections that must appear in order: the preamble,
//! one `dir-source` record per authority, one router-status record per
//! relay (each introduced by an `r` line), and the footer with bandwidth
//! weights and authority signatures.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::descriptor::ExitPolicyType;
use crate::dispatch::{self, Args, Cardinality, Handled, Rule, Table, UnknownKeywords, Unphased};
use crate::error::{DocumentParseError, ErrorContext};
use crate::meta::block::{self, Block, BlockKind};
use crate::meta::{self, Fingerprint, Item, Lines};

//
// External dependencies
//
use derive_builder::Builder;
use strum::{EnumString, IntoStaticStr};

/// Consensus methods we know how to interpret.
pub const SUPPORTED_CONSENSUS_METHODS: RangeInclusive<u32> = 17..=35;

/// Algorithm assumed for a `directory-signature` line that names none.
pub const DEFAULT_SIGNATURE_ALGORITHM: &str = "sha1";

/// Every weight name a `bandwidth-weights` line may carry.
pub const BANDWIDTH_WEIGHT_NAMES: [&str; 19] = [
    "Wbd", "Wbe", "Wbg", "Wbm", "Wdb", "Web", "Wed", "Wee", "Weg", "Wem", "Wgb", "Wgd", "Wgg",
    "Wgm", "Wmb", "Wmd", "Wme", "Wmg", "Wmm",
];

/// A relay flag in the consensus
#[derive(Debug, Clone, Copy, EnumString, IntoStaticStr, PartialEq, Eq)]
pub enum Flag {
    Authority,
    BadExit,
    Exit,
    Fast,
    Guard,
    HSDir,
    Named,
    Unnamed,
    NoEdConsensus,
    Running,
    Stable,
    StaleDesc,
    Sybil,
    V2Dir,
    Valid,
}

/// A range of supported protocol versions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedProtocolVersion {
    versions: Vec<u8>,
}

impl SupportedProtocolVersion {
    pub fn supports(&self, v: u8) -> bool {
        self.versions.contains(&v)
    }
}

impl fmt::Display for SupportedProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut last_version = None;
        let mut range_end = None;
        for v in self.versions.iter().copied() {
            match last_version {
                Some(last) => {
                    if v == last + 1 {
                        if range_end.is_none() {
                            write!(f, "-")?;
                        }
                        range_end = Some(v);
                    } else {
                        if let Some(x) = range_end.take() {
                            write!(f, "{}", x)?;
                        }
                        write!(f, ",{}", v)?;
                    }
                }
                None => {
                    // first element
                    write!(f, "{}", v)?;
                }
            }
            last_version = Some(v);
        }
        if let Some(x) = range_end.take() {
            write!(f, "{}", x)?;
        }

        Ok(())
    }
}

impl FromStr for SupportedProtocolVersion {
    type Err = DocumentParseError;

    /// Parse from "3" or "2-5" or "1,3-4".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut versions = Vec::new();
        for component in s.split(',') {
            match component.split_once('-') {
                Some((min, max)) => {
                    let min = min.parse::<u8>().context("protocol version (from)")?;
                    let max = max.parse::<u8>().context("protocol version (to)")?;
                    versions.extend(min..=max);
                }
                None => {
                    versions.push(component.parse::<u8>().context("protocol version")?);
                }
            }
        }
        versions.sort_unstable();
        versions.dedup();
        Ok(SupportedProtocolVersion { versions })
    }
}

/// Exit port entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicyEntry {
    SinglePort(u16),
    PortRange { min: u16, max: u16 },
}

impl ExitPolicyEntry {
    pub fn contains(&self, port: u16) -> bool {
        match *self {
            ExitPolicyEntry::SinglePort(x) => x == port,
            ExitPolicyEntry::PortRange { min, max } => min <= port && port <= max,
        }
    }
}

impl FromStr for ExitPolicyEntry {
    type Err = DocumentParseError;

    /// Parse from "3" or "2-5".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((min, max)) => {
                let min = min.parse::<u16>().context("exit policy port (from)")?;
                let max = max.parse::<u16>().context("exit policy port (to)")?;
                if min > max {
                    return Err(DocumentParseError::invalid(format!("exit policy range '{}'", s)));
                }
                Ok(ExitPolicyEntry::PortRange { min, max })
            }
            None => Ok(ExitPolicyEntry::SinglePort(
                s.parse::<u16>().context("exit policy port")?,
            )),
        }
    }
}

impl fmt::Display for ExitPolicyEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitPolicyEntry::SinglePort(x) => write!(f, "{}", x),
            ExitPolicyEntry::PortRange { min: x, max: y } => write!(f, "{}-{}", x, y),
        }
    }
}

/// A relay's condensed exit policy (ports for "most" target IP addresses)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondensedExitPolicy {
    pub policy_type: ExitPolicyType,
    pub entries: Vec<ExitPolicyEntry>,
}

impl CondensedExitPolicy {
    pub fn allows_port(&self, port: u16) -> bool {
        let listed = self.entries.iter().any(|e| e.contains(port));
        match self.policy_type {
            ExitPolicyType::Accept => listed,
            ExitPolicyType::Reject => !listed,
        }
    }
}

impl FromStr for CondensedExitPolicy {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cmd, ports) = s
            .split_once(' ')
            .ok_or_else(|| DocumentParseError::invalid(format!("port policy '{}'", s)))?;
        let policy_type = match cmd {
            "accept" => ExitPolicyType::Accept,
            "reject" => ExitPolicyType::Reject,
            _ => return Err(DocumentParseError::invalid(format!("port policy verdict '{}'", cmd))),
        };
        let entries = ports
            .split(',')
            .map(|x| x.parse::<ExitPolicyEntry>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CondensedExitPolicy {
            policy_type,
            entries,
        })
    }
}

impl fmt::Display for CondensedExitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.policy_type,
            self.entries
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(",")
        )
    }
}

/// The fields of a consensus preamble.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preamble {
    /// The `network-status-version`; always "3" once parsed.
    pub version: String,
    pub vote_status: String,
    pub consensus_method: Option<u32>,
    pub valid_after: Option<i64>,
    pub fresh_until: Option<i64>,
    pub valid_until: Option<i64>,
    /// (vote seconds, distribution seconds)
    pub voting_delay: Option<(u32, u32)>,
    pub client_versions: Option<Vec<String>>,
    pub server_versions: Option<Vec<String>>,
    pub known_flags: Option<Vec<String>>,
    pub params: BTreeMap<String, i64>,
    /// `recommended-*-protocols` / `required-*-protocols`, by keyword.
    pub protocols: BTreeMap<String, Vec<String>>,
}

/// The three times that bound a consensus' usefulness, as epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    pub valid_after: i64,
    pub fresh_until: i64,
    pub valid_until: i64,
}

impl Lifetime {
    pub fn new(
        valid_after: i64,
        fresh_until: i64,
        valid_until: i64,
    ) -> Result<Lifetime, DocumentParseError> {
        if valid_after <= fresh_until && fresh_until < valid_until {
            Ok(Lifetime {
                valid_after,
                fresh_until,
                valid_until,
            })
        } else {
            Err(DocumentParseError::invalid(
                "consensus lifetime (valid-after, fresh-until, valid-until out of order)",
            ))
        }
    }
}

/// An authority entry: a `dir-source` line with its `contact` and
/// `vote-digest` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSource {
    pub nickname: String,
    pub identity: Fingerprint,
    pub address: String,
    pub ip: Ipv4Addr,
    pub dir_port: u16,
    pub or_port: u16,
    pub contact: Vec<String>,
    pub vote_digest: Fingerprint,
}

/// A relay entry within the consensus, containing only these sparse information
/// instead of the full server descriptor
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(private)]
pub struct RouterStatus {
    pub nickname: String,
    /// Base64 identity digest, exactly as listed.
    pub identity: String,
    /// Base64 digest of the relay's current descriptor, exactly as listed.
    pub digest: String,
    pub published: i64,
    pub address: Ipv4Addr,
    pub or_port: u16,
    pub dir_port: u16,
    #[builder(default)]
    pub ipv6_addresses: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub flags: Option<Vec<String>>,
    #[builder(default, setter(strip_option))]
    pub version: Option<Vec<String>>,
    #[builder(default, setter(strip_option))]
    pub protocols: Option<BTreeMap<String, SupportedProtocolVersion>>,
    #[builder(default, setter(strip_option))]
    pub bandwidth: Option<BTreeMap<String, i64>>,
    #[builder(default, setter(strip_option))]
    pub exit_policy: Option<CondensedExitPolicy>,
}

impl RouterStatusBuilder {
    fn add_ipv6_address(&mut self, addr: String) {
        self.ipv6_addresses.get_or_insert_with(Vec::new).push(addr);
    }
}

impl RouterStatus {
    pub fn has_flag(&self, flag: Flag) -> bool {
        let name: &'static str = flag.into();
        self.flags
            .as_ref()
            .map_or(false, |flags| flags.iter().any(|f| f == name))
    }

    pub fn identity_fingerprint(&self) -> Result<Fingerprint, DocumentParseError> {
        Fingerprint::from_str_b64(&self.identity)
    }

    pub fn descriptor_digest(&self) -> Result<Fingerprint, DocumentParseError> {
        Fingerprint::from_str_b64(&self.digest)
    }

    /// True if this relay serves directory documents to clients.
    pub fn is_directory_cache(&self) -> bool {
        self.dir_port != 0
            && self.has_flag(Flag::V2Dir)
            && self.has_flag(Flag::Running)
            && self.has_flag(Flag::Valid)
    }
}

/// One `directory-signature` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySignature {
    pub algorithm: String,
    pub signing_key_digest: Fingerprint,
    pub signature: Block,
}

/// A parsed consensus document ("network status").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consensus {
    pub preamble: Preamble,
    /// Authorities, keyed by hex identity fingerprint.
    pub authorities: BTreeMap<String, DirSource>,
    /// Relays, keyed by base64 identity digest.
    pub relays: BTreeMap<String, RouterStatus>,
    pub bandwidth_weights: Option<BTreeMap<String, i64>>,
    /// Signatures, keyed by hex authority identity; an authority may sign
    /// with more than one algorithm.
    pub signatures: BTreeMap<String, Vec<DirectorySignature>>,
    /// Keywords that were recognized but not kept.
    pub ignored: Vec<String>,
}

impl Consensus {
    /// Parse a consensus document from raw text.
    pub fn parse(text: impl AsRef<str>) -> Result<Consensus, DocumentParseError> {
        let mut acc = ConsensusBuilder::default();
        let mut lines = Lines::new(text.as_ref());
        let summary = dispatch::run(&CONSENSUS, &mut acc, &mut lines, |_| false)?;
        acc.note_ignored(summary.ignored);
        Ok(acc.finish())
    }

    /// The consensus' validity interval; all three times must be present.
    pub fn lifetime(&self) -> Result<Lifetime, DocumentParseError> {
        let p = &self.preamble;
        Lifetime::new(
            p.valid_after.ok_or_else(|| DocumentParseError::missing("valid-after"))?,
            p.fresh_until.ok_or_else(|| DocumentParseError::missing("fresh-until"))?,
            p.valid_until.ok_or_else(|| DocumentParseError::missing("valid-until"))?,
        )
    }

    /// True if the consensus may still be used at `now`.
    pub fn is_live(&self, now: i64) -> bool {
        self.preamble.valid_until.map_or(false, |vu| now < vu)
    }

    /// Relays that serve directory documents.
    pub fn directory_caches(&self) -> impl Iterator<Item = &RouterStatus> {
        self.relays.values().filter(|r| r.is_directory_cache())
    }
}

impl FromStr for Consensus {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Consensus::parse(s)
    }
}

/// The sections of a consensus, in the order they must appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::IntoStaticStr)]
enum Section {
    #[strum(serialize = "preamble")]
    Preamble,
    #[strum(serialize = "authority section")]
    Authority,
    #[strum(serialize = "router-status section")]
    RouterStatus,
    #[strum(serialize = "footer")]
    Footer,
}

/// Accumulates a consensus while it is being parsed.
#[derive(Default)]
struct ConsensusBuilder {
    preamble: Preamble,
    authorities: BTreeMap<String, DirSource>,
    relays: BTreeMap<String, RouterStatus>,
    bandwidth_weights: Option<BTreeMap<String, i64>>,
    signatures: BTreeMap<String, Vec<DirectorySignature>>,
    ignored: Vec<String>,
}

impl ConsensusBuilder {
    fn note_ignored(&mut self, keywords: Vec<String>) {
        for k in keywords {
            if !self.ignored.contains(&k) {
                self.ignored.push(k);
            }
        }
    }

    fn finish(self) -> Consensus {
        Consensus {
            preamble: self.preamble,
            authorities: self.authorities,
            relays: self.relays,
            bandwidth_weights: self.bandwidth_weights,
            signatures: self.signatures,
            ignored: self.ignored,
        }
    }
}

type Res = Result<Handled, DocumentParseError>;
type CRule = Rule<ConsensusBuilder, Section>;

macro_rules! rule {
    ($card:ident, $args:expr, $phase:ident, $handler:expr) => {
        Rule {
            cardinality: Cardinality::$card,
            args: $args,
            phase: Section::$phase,
            handler: $handler,
        }
    };
}

static CONSENSUS_RULES: phf::Map<&'static str, CRule> = phf::phf_map! {
    "network-status-version" => rule!(RequiredFirst, Args::Exactly(1), Preamble, kw_version),
    "vote-status" => rule!(RequiredOnce, Args::Exactly(1), Preamble, kw_vote_status),
    "consensus-method" => rule!(OptionalOnce, Args::Exactly(1), Preamble, kw_consensus_method),
    "valid-after" => rule!(OptionalOnce, Args::Exactly(2), Preamble, kw_valid_after),
    "fresh-until" => rule!(OptionalOnce, Args::Exactly(2), Preamble, kw_fresh_until),
    "valid-until" => rule!(OptionalOnce, Args::Exactly(2), Preamble, kw_valid_until),
    "voting-delay" => rule!(OptionalOnce, Args::Exactly(2), Preamble, kw_voting_delay),
    "client-versions" => rule!(OptionalOnce, Args::Exactly(1), Preamble, kw_client_versions),
    "server-versions" => rule!(OptionalOnce, Args::Exactly(1), Preamble, kw_server_versions),
    "known-flags" => rule!(OptionalOnce, Args::Any, Preamble, kw_known_flags),
    "recommended-client-protocols" => rule!(OptionalOnce, Args::Any, Preamble, kw_protocols),
    "recommended-relay-protocols" => rule!(OptionalOnce, Args::Any, Preamble, kw_protocols),
    "required-client-protocols" => rule!(OptionalOnce, Args::Any, Preamble, kw_protocols),
    "required-relay-protocols" => rule!(OptionalOnce, Args::Any, Preamble, kw_protocols),
    "params" => rule!(OptionalOnce, Args::Any, Preamble, kw_params),
    "shared-rand-previous-value" => rule!(OptionalOnce, Args::AtLeast(2), Preamble, kw_ignore),
    "shared-rand-current-value" => rule!(OptionalOnce, Args::AtLeast(2), Preamble, kw_ignore),
    "dir-source" => rule!(OptionalMany, Args::Exactly(6), Authority, kw_dir_source),
    "r" => rule!(OptionalMany, Args::Exactly(8), RouterStatus, kw_router_status),
    "directory-footer" => rule!(OptionalOnce, Args::Exactly(0), Footer, kw_footer),
    "bandwidth-weights" => rule!(OptionalOnce, Args::Any, Footer, kw_bandwidth_weights),
    "directory-signature" => rule!(OptionalMany, Args::AtLeast(2), Footer, kw_directory_signature),
};

static CONSENSUS: Table<ConsensusBuilder, Section> = Table {
    name: "consensus",
    rules: &CONSENSUS_RULES,
    unknown: UnknownKeywords::Reject,
};

fn timestamp(item: &Item<'_>) -> Result<i64, DocumentParseError> {
    meta::parse_timestamp(item.args[0], item.args[1], item.keyword)
}

fn comma_list(item: &Item<'_>) -> Vec<String> {
    item.args[0]
        .split(',')
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .collect()
}

fn kw_version(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    if item.args[0] != "3" {
        return Err(DocumentParseError::UnsupportedVersion {
            found: item.args[0].to_string(),
        });
    }
    acc.preamble.version = item.args[0].to_string();
    Ok(Handled::Stored)
}

fn kw_vote_status(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    if item.args[0] != "consensus" {
        return Err(DocumentParseError::invalid(format!(
            "vote-status '{}' (expected 'consensus')",
            item.args[0]
        )));
    }
    acc.preamble.vote_status = item.args[0].to_string();
    Ok(Handled::Stored)
}

fn kw_consensus_method(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    let method = item.args[0].parse::<u32>().context("consensus-method")?;
    if !SUPPORTED_CONSENSUS_METHODS.contains(&method) {
        return Err(DocumentParseError::UnsupportedVersion {
            found: format!("consensus-method {}", method),
        });
    }
    acc.preamble.consensus_method = Some(method);
    Ok(Handled::Stored)
}

fn kw_valid_after(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    acc.preamble.valid_after = Some(timestamp(item)?);
    Ok(Handled::Stored)
}

fn kw_fresh_until(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    acc.preamble.fresh_until = Some(timestamp(item)?);
    Ok(Handled::Stored)
}

fn kw_valid_until(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    acc.preamble.valid_until = Some(timestamp(item)?);
    Ok(Handled::Stored)
}

fn kw_voting_delay(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    let vote = item.args[0].parse::<u32>().context("voting-delay")?;
    let dist = item.args[1].parse::<u32>().context("voting-delay")?;
    acc.preamble.voting_delay = Some((vote, dist));
    Ok(Handled::Stored)
}

fn kw_client_versions(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    acc.preamble.client_versions = Some(comma_list(item));
    Ok(Handled::Stored)
}

fn kw_server_versions(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    acc.preamble.server_versions = Some(comma_list(item));
    Ok(Handled::Stored)
}

fn kw_known_flags(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    acc.preamble.known_flags = Some(item.owned_args());
    Ok(Handled::Stored)
}

fn kw_protocols(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    acc.preamble
        .protocols
        .insert(item.keyword.to_string(), item.owned_args());
    Ok(Handled::Stored)
}

fn kw_params(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    acc.preamble.params = meta::parse_int_pairs(&item.args, "params")?;
    Ok(Handled::Stored)
}

fn kw_ignore(_: &mut ConsensusBuilder, _: &Item<'_>, _: &mut Lines<'_>) -> Res {
    Ok(Handled::Ignored)
}

fn kw_footer(_: &mut ConsensusBuilder, _: &Item<'_>, _: &mut Lines<'_>) -> Res {
    Ok(Handled::Stored)
}

fn kw_dir_source(acc: &mut ConsensusBuilder, item: &Item<'_>, lines: &mut Lines<'_>) -> Res {
    let (nickname, identity, address, ip, dir_port, or_port) = match item.args[..] {
        [a, b, c, d, e, f] => (a, b, c, d, e, f),
        _ => return Err(item.malformed("expected 7 tokens")),
    };
    meta::check_host(address, "dir-source address")?;
    let identity = Fingerprint::from_str_hex(identity)?;

    let contact = match lines.next_item()? {
        Some(next) if next.keyword == "contact" => next.owned_args(),
        Some(next) if next.keyword == "vote-digest" => {
            return Err(DocumentParseError::OrderingViolation {
                keyword: next.keyword.to_string(),
                phase: "authority section".to_string(),
                line: next.line,
            })
        }
        _ => return Err(DocumentParseError::missing("contact")),
    };
    let vote_digest = match lines.next_item()? {
        Some(next) if next.keyword == "vote-digest" => {
            if next.args.len() != 1 {
                return Err(next.malformed("expected 2 tokens"));
            }
            Fingerprint::from_str_hex(next.args[0])?
        }
        Some(next) if next.keyword == "contact" => return Err(duplicate(&next)),
        _ => return Err(DocumentParseError::missing("vote-digest")),
    };
    if let Some(next) = lines.peek_item()? {
        if matches!(next.keyword, "contact" | "vote-digest") {
            return Err(duplicate(&next));
        }
    }

    let source = DirSource {
        nickname: nickname.to_string(),
        identity,
        address: address.to_string(),
        ip: meta::parse_ipv4(ip, "dir-source IP")?,
        dir_port: meta::parse_port(dir_port, "dir-source DirPort")?,
        or_port: meta::parse_port(or_port, "dir-source ORPort")?,
        contact,
        vote_digest,
    };
    if acc
        .authorities
        .insert(identity.to_string(), source)
        .is_some()
    {
        return Err(DocumentParseError::invalid(format!(
            "dir-source (authority {} listed twice)",
            identity
        )));
    }
    Ok(Handled::Stored)
}

fn duplicate(item: &Item<'_>) -> DocumentParseError {
    DocumentParseError::DuplicateKeyword {
        keyword: item.keyword.to_string(),
        line: item.line,
    }
}

/// Keywords that end a router-status record.
fn is_status_boundary(keyword: &str) -> bool {
    matches!(
        keyword,
        "r" | "directory-footer" | "bandwidth-weights" | "directory-signature"
    )
}

fn kw_router_status(acc: &mut ConsensusBuilder, item: &Item<'_>, lines: &mut Lines<'_>) -> Res {
    let (nickname, identity, digest, date, time, ip, or_port, dir_port) = match item.args[..] {
        [a, b, c, d, e, f, g, h] => (a, b, c, d, e, f, g, h),
        _ => return Err(item.malformed("expected 9 tokens")),
    };
    meta::check_nickname(nickname)?;
    Fingerprint::from_str_b64(identity)?;
    Fingerprint::from_str_b64(digest)?;

    let mut relay = RouterStatusBuilder::default();
    relay
        .nickname(nickname.to_string())
        .identity(identity.to_string())
        .digest(digest.to_string())
        .published(meta::parse_timestamp(date, time, "r publication")?)
        .address(meta::parse_ipv4(ip, "r IP")?)
        .or_port(meta::parse_port(or_port, "r ORPort")?)
        .dir_port(meta::parse_port(dir_port, "r DirPort")?);

    let summary = dispatch::run(&ROUTER_STATUS, &mut relay, lines, is_status_boundary)?;
    let relay = relay.build().map_err(DocumentParseError::from_builder)?;

    acc.note_ignored(summary.ignored);
    if acc.relays.insert(identity.to_string(), relay).is_some() {
        return Err(DocumentParseError::invalid(format!(
            "r line (relay {} listed twice)",
            identity
        )));
    }
    Ok(Handled::Stored)
}

fn kw_bandwidth_weights(acc: &mut ConsensusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    let weights = meta::parse_int_pairs(&item.args, "bandwidth-weights")?;
    if let Some(name) = weights
        .keys()
        .find(|k| !BANDWIDTH_WEIGHT_NAMES.contains(&k.as_str()))
    {
        return Err(DocumentParseError::invalid(format!(
            "bandwidth-weights (unknown weight '{}')",
            name
        )));
    }
    acc.bandwidth_weights = Some(weights);
    Ok(Handled::Stored)
}

fn kw_directory_signature(acc: &mut ConsensusBuilder, item: &Item<'_>, lines: &mut Lines<'_>) -> Res {
    let (algorithm, identity, key_digest) = match item.args[..] {
        [alg, id, key] => (alg, id, key),
        [id, key] => (DEFAULT_SIGNATURE_ALGORITHM, id, key),
        _ => return Err(item.malformed("expected 3 or 4 tokens")),
    };
    let identity = Fingerprint::from_str_hex(identity)?;
    let signature = DirectorySignature {
        algorithm: algorithm.to_string(),
        signing_key_digest: Fingerprint::from_str_hex(key_digest)?,
        signature: block::extract(lines, BlockKind::Signature)?,
    };

    let entry = acc.signatures.entry(identity.to_string()).or_default();
    if entry.iter().any(|s| s.algorithm == signature.algorithm) {
        return Err(DocumentParseError::invalid(format!(
            "directory-signature ({} signed twice with {})",
            identity, signature.algorithm
        )));
    }
    entry.push(signature);
    Ok(Handled::Stored)
}

type SRes = Result<Handled, DocumentParseError>;

macro_rules! status_rule {
    ($card:ident, $args:expr, $handler:expr) => {
        Rule {
            cardinality: Cardinality::$card,
            args: $args,
            phase: Unphased::Body,
            handler: $handler,
        }
    };
}

static ROUTER_STATUS_RULES: phf::Map<&'static str, Rule<RouterStatusBuilder, Unphased>> = phf::phf_map! {
    "a" => status_rule!(OptionalMany, Args::Exactly(1), kw_a),
    "s" => status_rule!(OptionalOnce, Args::Any, kw_s),
    "v" => status_rule!(OptionalOnce, Args::AtLeast(1), kw_v),
    "pr" => status_rule!(OptionalOnce, Args::Any, kw_pr),
    "w" => status_rule!(OptionalOnce, Args::AtLeast(1), kw_w),
    "p" => status_rule!(OptionalOnce, Args::Exactly(2), kw_p),
    "m" => status_rule!(OptionalMany, Args::Any, kw_m),
};

static ROUTER_STATUS: Table<RouterStatusBuilder, Unphased> = Table {
    name: "router-status entry",
    rules: &ROUTER_STATUS_RULES,
    unknown: UnknownKeywords::Reject,
};

fn kw_a(relay: &mut RouterStatusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> SRes {
    match item.args[0].parse::<SocketAddr>() {
        Ok(SocketAddr::V6(_)) => {
            relay.add_ipv6_address(item.args[0].to_string());
            Ok(Handled::Stored)
        }
        _ => Err(DocumentParseError::invalid(format!(
            "a line address '{}'",
            item.args[0]
        ))),
    }
}

fn kw_s(relay: &mut RouterStatusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> SRes {
    relay.flags(item.owned_args());
    Ok(Handled::Stored)
}

fn kw_v(relay: &mut RouterStatusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> SRes {
    relay.version(item.owned_args());
    Ok(Handled::Stored)
}

fn kw_pr(relay: &mut RouterStatusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> SRes {
    let mut protocols = BTreeMap::new();
    for arg in item.args.iter() {
        let (name, versions) = arg
            .split_once('=')
            .ok_or_else(|| DocumentParseError::invalid(format!("pr entry '{}'", arg)))?;
        protocols.insert(name.to_string(), versions.parse::<SupportedProtocolVersion>()?);
    }
    relay.protocols(protocols);
    Ok(Handled::Stored)
}

fn kw_w(relay: &mut RouterStatusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> SRes {
    if !item.args[0].starts_with("Bandwidth=") {
        return Err(DocumentParseError::invalid("w line (must start with Bandwidth=)"));
    }
    relay.bandwidth(meta::parse_int_pairs(&item.args, "w line")?);
    Ok(Handled::Stored)
}

fn kw_p(relay: &mut RouterStatusBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> SRes {
    relay.exit_policy(item.joined_args().parse::<CondensedExitPolicy>()?);
    Ok(Handled::Stored)
}

fn kw_m(_: &mut RouterStatusBuilder, _: &Item<'_>, _: &mut Lines<'_>) -> SRes {
    Ok(Handled::Ignored)
}
