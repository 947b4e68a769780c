//! Tor server descriptor documents

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::config::{ParseOptions, TrailingContent};
use crate::consensus::{CondensedExitPolicy, ExitPolicyEntry};
use crate::dispatch::{self, Args, Cardinality, Handled, Rule, Table, UnknownKeywords, Unphased};
use crate::error::{DocumentParseError, ErrorContext};
use crate::meta::block::{self, Block, BlockKind};
use crate::meta::{self, Fingerprint, Item, Lines};

mod exit;
pub use exit::{
    DescriptorExitPolicy, DescriptorExitPolicyRule, ExitPolicyAddress, ExitPolicyPort,
    ExitPolicyType, ExitPortRange,
};

//
// External dependencies
//
use derive_builder::Builder;
use sha1::{Digest, Sha1};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FamilyMember {
    Fingerprint(Fingerprint),
    Nickname(String),
}

impl FromStr for FamilyMember {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix('$') {
            // "$HEX=nick" and "$HEX~nick" also name a fingerprint
            Some(rest) => Ok(FamilyMember::Fingerprint(Fingerprint::from_str_hex(
                rest.split(|c| c == '=' || c == '~').next().unwrap_or(rest),
            )?)),
            None => {
                meta::check_nickname(s)?;
                Ok(FamilyMember::Nickname(s.to_string()))
            }
        }
    }
}

/// Average, burst and observed bandwidth in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bandwidth {
    pub avg: u64,
    pub burst: u64,
    pub observed: u64,
}

/// A relay server descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(private)]
pub struct RouterDescriptor {
    pub nickname: String,
    pub address: Ipv4Addr,
    pub or_port: u16,
    pub socks_port: u16,
    pub dir_port: u16,
    pub bandwidth: Bandwidth,
    #[builder(default, setter(strip_option))]
    pub platform: Option<String>,
    pub published: i64,
    #[builder(default, setter(strip_option))]
    pub fingerprint: Option<Fingerprint>,
    #[builder(default)]
    pub hibernating: bool,
    #[builder(default, setter(strip_option))]
    pub uptime: Option<u64>,
    #[builder(default, setter(strip_option))]
    pub onion_key: Option<Block>,
    pub signing_key: Block,
    #[builder(default, setter(strip_option))]
    pub ntor_onion_key: Option<String>,
    /// `accept`/`reject` rules in document order; the first match wins.
    #[builder(setter(custom), default)]
    pub exit_policy: DescriptorExitPolicy,
    /// A missing "ipv6-policy" line is equivalent to "ipv6-policy reject 1-65535".
    #[builder(default = "default_ipv6_policy()")]
    pub ipv6_policy: CondensedExitPolicy,
    #[builder(default, setter(strip_option))]
    pub family: Option<Vec<FamilyMember>>,
    #[builder(default, setter(strip_option))]
    pub contact: Option<String>,
    #[builder(default, setter(strip_option))]
    pub protocols: Option<Vec<String>>,
    #[builder(default, setter(strip_option))]
    pub extra_info_digest: Option<Vec<String>>,
    #[builder(setter(custom), default)]
    pub or_addresses: Vec<SocketAddr>,
    #[builder(default)]
    pub caches_extra_info: bool,
    #[builder(default)]
    pub allow_single_hop_exits: bool,
    #[builder(default, setter(strip_option))]
    pub hidden_service_dir: Option<Vec<String>>,
    pub router_signature: Block,
    /// SHA-1 over the text from `router ` through the `router-signature` line.
    pub digest: Fingerprint,
    /// Keywords that were ignored or not recognized.
    #[builder(default)]
    pub ignored: Vec<String>,
}

fn default_ipv6_policy() -> CondensedExitPolicy {
    CondensedExitPolicy {
        policy_type: ExitPolicyType::Reject,
        entries: vec![ExitPolicyEntry::PortRange { min: 1, max: 65535 }],
    }
}

impl RouterDescriptorBuilder {
    fn add_or_address(&mut self, or: SocketAddr) {
        self.or_addresses.get_or_insert_with(Vec::new).push(or);
    }

    fn add_exit_policy_rule(&mut self, epr: DescriptorExitPolicyRule) {
        self.exit_policy
            .get_or_insert_with(DescriptorExitPolicy::new)
            .add_rule(epr);
    }
}

impl RouterDescriptor {
    /// Parse a single descriptor, rejecting content after `router-signature`.
    pub fn parse(text: impl AsRef<str>) -> Result<RouterDescriptor, DocumentParseError> {
        Self::parse_with(text, &ParseOptions::default())
    }

    /// Parse a single descriptor with explicit options.
    pub fn parse_with(
        text: impl AsRef<str>,
        options: &ParseOptions,
    ) -> Result<RouterDescriptor, DocumentParseError> {
        let text = text.as_ref();
        let mut lines = Lines::new(text);
        while lines.peek_line().map_or(false, |l| l.starts_with('@')) {
            lines.next_line();
        }

        let mut builder = RouterDescriptorBuilder::default();
        let summary = dispatch::run(&DESCRIPTOR, &mut builder, &mut lines, |_| false)?;

        if let Some(next) = lines.peek_item()? {
            match options.trailing_content {
                TrailingContent::Reject => {
                    return Err(DocumentParseError::OrderingViolation {
                        keyword: next.keyword.to_string(),
                        phase: "content after router-signature".to_string(),
                        line: next.line,
                    })
                }
                TrailingContent::Ignore => {
                    tracing::trace!(line = next.line, "ignoring content after router-signature");
                }
            }
        }

        let signed = meta::signed_content(text, "router ", "router-signature")
            .ok_or_else(|| DocumentParseError::missing("router-signature"))?;
        builder.digest(digest_from_raw(signed));
        builder.ignored(summary.ignored);

        builder.build().map_err(DocumentParseError::from_builder)
    }

    /// Parse several descriptors all contained in a raw text, as returned
    /// for a batched request. Annotation lines (`@...`) are skipped.
    pub fn parse_many(
        text: impl AsRef<str>,
        options: &ParseOptions,
    ) -> Result<Vec<RouterDescriptor>, DocumentParseError> {
        split_descriptors(text.as_ref())
            .into_iter()
            .map(|chunk| Self::parse_with(chunk, options))
            .collect()
    }

    /// True if the descriptor's IPv4 exit policy accepts `ip:port`.
    pub fn allows_exit(&self, ip: std::net::IpAddr, port: u16) -> bool {
        self.exit_policy.allows(ip, port)
    }
}

impl FromStr for RouterDescriptor {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RouterDescriptor::parse(s)
    }
}

/// Compute a descriptor's digest given the extracted raw content
pub fn digest_from_raw<R: AsRef<[u8]>>(raw: R) -> Fingerprint {
    let mut hasher = Sha1::new();
    hasher.update(raw.as_ref());
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    Fingerprint::from(out)
}

/// Split concatenated descriptors. Each piece starts at a `router ` line,
/// or at the annotation lines directly preceding one.
pub(crate) fn split_descriptors(text: &str) -> Vec<&str> {
    let mut starts = Vec::new();
    let mut annotations_from = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.starts_with('@') {
            annotations_from.get_or_insert(offset);
        } else if line.starts_with("router ") {
            starts.push(annotations_from.take().unwrap_or(offset));
        } else if !line.trim().is_empty() {
            annotations_from = None;
        }
        offset += line.len();
    }

    let mut pieces = Vec::new();
    match starts.first() {
        None if !text.trim().is_empty() => pieces.push(text),
        Some(&first) if !text[..first].trim().is_empty() => pieces.push(&text[..first]),
        _ => {}
    }
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(text.len());
        pieces.push(&text[start..end]);
    }
    pieces
}

type Res = Result<Handled, DocumentParseError>;

macro_rules! rule {
    ($card:ident, $args:expr, $handler:expr) => {
        Rule {
            cardinality: Cardinality::$card,
            args: $args,
            phase: Unphased::Body,
            handler: $handler,
        }
    };
}

static DESCRIPTOR_RULES: phf::Map<&'static str, Rule<RouterDescriptorBuilder, Unphased>> = phf::phf_map! {
    "router" => rule!(RequiredFirst, Args::Any, kw_router),
    "bandwidth" => rule!(RequiredOnce, Args::Exactly(3), kw_bandwidth),
    "platform" => rule!(OptionalOnce, Args::AtLeast(1), kw_platform),
    "published" => rule!(RequiredOnce, Args::Exactly(2), kw_published),
    "fingerprint" => rule!(OptionalOnce, Args::AtLeast(1), kw_fingerprint),
    "hibernating" => rule!(OptionalOnce, Args::Exactly(1), kw_hibernating),
    "uptime" => rule!(OptionalOnce, Args::Exactly(1), kw_uptime),
    "onion-key" => rule!(OptionalOnce, Args::Exactly(0), kw_onion_key),
    "signing-key" => rule!(RequiredOnce, Args::Exactly(0), kw_signing_key),
    "ntor-onion-key" => rule!(OptionalOnce, Args::Exactly(1), kw_ntor_onion_key),
    "accept" => rule!(OptionalMany, Args::Exactly(1), exit::kw_accept),
    "reject" => rule!(OptionalMany, Args::Exactly(1), exit::kw_reject),
    "ipv6-policy" => rule!(OptionalOnce, Args::Exactly(2), exit::kw_ipv6_policy),
    "contact" => rule!(OptionalOnce, Args::Any, kw_contact),
    "family" => rule!(OptionalOnce, Args::AtLeast(1), kw_family),
    "read-history" => rule!(OptionalOnce, Args::Any, kw_ignore),
    "write-history" => rule!(OptionalOnce, Args::Any, kw_ignore),
    "eventdns" => rule!(OptionalOnce, Args::Any, kw_ignore),
    "caches-extra-info" => rule!(OptionalOnce, Args::Exactly(0), kw_caches_extra_info),
    "extra-info-digest" => rule!(OptionalOnce, Args::AtLeast(1), kw_extra_info_digest),
    "hidden-service-dir" => rule!(OptionalOnce, Args::Any, kw_hidden_service_dir),
    "protocols" => rule!(OptionalOnce, Args::Any, kw_protocols),
    "allow-single-hop-exits" => rule!(OptionalOnce, Args::Exactly(0), kw_allow_single_hop_exits),
    "or-address" => rule!(OptionalMany, Args::Exactly(1), kw_or_address),
    "router-signature" => rule!(RequiredLast, Args::Exactly(0), kw_router_signature),
};

static DESCRIPTOR: Table<RouterDescriptorBuilder, Unphased> = Table {
    name: "router descriptor",
    rules: &DESCRIPTOR_RULES,
    unknown: UnknownKeywords::Tolerate,
};

fn kw_router(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    match item.args[..] {
        // nickname address ORPort SOCKSPort DirPort
        [nickname, ip, or_port, socks_port, dir_port] => {
            meta::check_nickname(nickname)?;
            builder
                .nickname(nickname.to_string())
                .address(meta::parse_ipv4(ip, "router address")?)
                .or_port(meta::parse_port(or_port, "router ORPort")?)
                .socks_port(meta::parse_port(socks_port, "router SOCKSPort")?)
                .dir_port(meta::parse_port(dir_port, "router DirPort")?);
            Ok(Handled::Stored)
        }
        // a router line of any other shape does not start a descriptor
        _ => Err(DocumentParseError::missing("router")),
    }
}

fn kw_bandwidth(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    match item.args[..] {
        // bandwidth-avg bandwidth-burst bandwidth-observed
        [avg, burst, observed] => {
            builder.bandwidth(Bandwidth {
                avg: avg.parse::<u64>().context("bandwidth avg")?,
                burst: burst.parse::<u64>().context("bandwidth burst")?,
                observed: observed.parse::<u64>().context("bandwidth observed")?,
            });
            Ok(Handled::Stored)
        }
        _ => Err(item.malformed("expected 4 tokens")),
    }
}

fn kw_platform(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    builder.platform(item.joined_args());
    Ok(Handled::Stored)
}

fn kw_published(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    builder.published(meta::parse_timestamp(item.args[0], item.args[1], "published")?);
    Ok(Handled::Stored)
}

fn kw_fingerprint(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    // written in groups of four hex digits
    builder.fingerprint(Fingerprint::from_str_hex(&item.args.concat())?);
    Ok(Handled::Stored)
}

fn kw_hibernating(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    let hibernating = match item.args[0] {
        "0" => false,
        "1" => true,
        other => return Err(DocumentParseError::invalid(format!("hibernating '{}'", other))),
    };
    builder.hibernating(hibernating);
    Ok(Handled::Stored)
}

fn kw_uptime(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    builder.uptime(item.args[0].parse::<u64>().context("uptime")?);
    Ok(Handled::Stored)
}

fn kw_onion_key(builder: &mut RouterDescriptorBuilder, _: &Item<'_>, lines: &mut Lines<'_>) -> Res {
    builder.onion_key(block::extract(lines, BlockKind::RsaPublicKey)?);
    Ok(Handled::Stored)
}

fn kw_signing_key(builder: &mut RouterDescriptorBuilder, _: &Item<'_>, lines: &mut Lines<'_>) -> Res {
    builder.signing_key(block::extract(lines, BlockKind::RsaPublicKey)?);
    Ok(Handled::Stored)
}

fn kw_ntor_onion_key(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    builder.ntor_onion_key(item.args[0].to_string());
    Ok(Handled::Stored)
}

fn kw_contact(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    builder.contact(item.joined_args());
    Ok(Handled::Stored)
}

fn kw_family(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    let family_members = item
        .args
        .iter()
        .map(|x| x.parse::<FamilyMember>())
        .collect::<Result<Vec<FamilyMember>, DocumentParseError>>()?;
    builder.family(family_members);
    Ok(Handled::Stored)
}

fn kw_ignore(_: &mut RouterDescriptorBuilder, _: &Item<'_>, _: &mut Lines<'_>) -> Res {
    Ok(Handled::Ignored)
}

fn kw_caches_extra_info(builder: &mut RouterDescriptorBuilder, _: &Item<'_>, _: &mut Lines<'_>) -> Res {
    builder.caches_extra_info(true);
    Ok(Handled::Stored)
}

fn kw_extra_info_digest(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    Fingerprint::from_str_hex(item.args[0])?;
    builder.extra_info_digest(item.owned_args());
    Ok(Handled::Stored)
}

fn kw_hidden_service_dir(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    builder.hidden_service_dir(item.owned_args());
    Ok(Handled::Stored)
}

fn kw_protocols(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    builder.protocols(item.owned_args());
    Ok(Handled::Stored)
}

fn kw_allow_single_hop_exits(builder: &mut RouterDescriptorBuilder, _: &Item<'_>, _: &mut Lines<'_>) -> Res {
    builder.allow_single_hop_exits(true);
    Ok(Handled::Stored)
}

fn kw_or_address(builder: &mut RouterDescriptorBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    // "1.2.3.4:9001" or "[2001:db8::1]:9001"
    builder.add_or_address(item.args[0].parse::<SocketAddr>().context("or-address")?);
    Ok(Handled::Stored)
}

fn kw_router_signature(builder: &mut RouterDescriptorBuilder, _: &Item<'_>, lines: &mut Lines<'_>) -> Res {
    builder.router_signature(block::extract(lines, BlockKind::Signature)?);
    Ok(Handled::Stored)
}

#[cfg(test)]
mod test {
    use super::*;

    const KEY: &str = "-----BEGIN RSA PUBLIC KEY-----\nSGVsbG8g\nd29ybGQh\n-----END RSA PUBLIC KEY-----\n";
    const SIG: &str = "-----BEGIN SIGNATURE-----\nAAAA\n-----END SIGNATURE-----\n";

    fn descriptor(nickname: &str, middle: &str) -> String {
        format!(
            "router {} 10.0.0.1 9001 0 9030\n\
             platform Tor 0.4.8.9 on Linux\n\
             published 2014-04-24 02:45:39\n\
             fingerprint 0EB7 C8AA D759 B26D 37B8 57E7 080F D2B1 38B7 5A1C\n\
             bandwidth 1000 2000 1500\n\
             onion-key\n{}signing-key\n{}{}router-signature\n{}",
            nickname, KEY, KEY, middle, SIG
        )
    }

    #[test]
    fn full_descriptor() {
        let text = descriptor(
            "relay1",
            "ntor-onion-key Y2lyY3VpdHM=\n\
             hibernating 0\n\
             uptime 3600\n\
             contact someone <at> example dot org\n\
             family $9E062F6F04D5266A97A187EB020BD1FE4C935073 relay3\n\
             or-address [2001:db8::1]:9001\n\
             caches-extra-info\n\
             extra-info-digest F71CD0157CD231C57BE85186337A160AF2AB9B2E\n\
             read-history 2014-04-24 02:00:00 (900 s) 1,2,3\n\
             identity-ed25519\n-----BEGIN ED25519 CERT-----\nAQQABp\n-----END ED25519 CERT-----\n\
             ipv6-policy accept 80,443\n\
             reject 10.0.0.0/8:*\n\
             accept *:80\n\
             reject *:*\n",
        );
        let d = RouterDescriptor::parse(&text).unwrap();
        assert_eq!(d.nickname, "relay1");
        assert_eq!(d.address, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!((d.or_port, d.socks_port, d.dir_port), (9001, 0, 9030));
        assert_eq!(d.bandwidth.burst, 2000);
        assert_eq!(d.platform.as_deref(), Some("Tor 0.4.8.9 on Linux"));
        assert_eq!(d.published, 1398307539);
        assert_eq!(
            d.fingerprint.unwrap().to_b64(),
            "DrfIqtdZsm03uFfnCA/SsTi3Whw"
        );
        assert_eq!(d.signing_key.data, "SGVsbG8gd29ybGQh");
        assert_eq!(d.router_signature.kind, BlockKind::Signature);
        assert_eq!(d.ntor_onion_key.as_deref(), Some("Y2lyY3VpdHM="));
        assert_eq!(d.uptime, Some(3600));
        assert!(d.caches_extra_info);
        assert!(!d.allow_single_hop_exits);
        assert_eq!(d.family.as_ref().unwrap().len(), 2);
        assert_eq!(d.or_addresses.len(), 1);
        assert!(d.ipv6_policy.allows_port(443));
        assert_eq!(d.ignored, vec!["read-history", "identity-ed25519"]);

        let rules: Vec<String> = d.exit_policy.rules.iter().map(|r| r.to_string()).collect();
        assert_eq!(rules, vec!["reject 10.0.0.0/8:*", "accept *:80", "reject *:*"]);
        assert!(!d.allows_exit("10.1.1.1".parse().unwrap(), 80));
        assert!(d.allows_exit("192.0.2.1".parse().unwrap(), 80));
        assert!(!d.allows_exit("192.0.2.1".parse().unwrap(), 22));
    }

    #[test]
    fn digest_covers_signed_part() {
        let text = descriptor("relay1", "");
        let d = RouterDescriptor::parse(&text).unwrap();
        let signed = &text[..text.find("router-signature\n").unwrap() + "router-signature\n".len()];
        assert_eq!(d.digest, digest_from_raw(signed));
        assert_eq!(RouterDescriptor::parse(&text).unwrap(), d);
        assert!(d.exit_policy.rules.is_empty());
        assert_eq!(d.ipv6_policy, default_ipv6_policy());
        assert!(!d.ipv6_policy.allows_port(80));
    }

    #[test]
    fn must_start_with_router() {
        let text = format!("published 2014-04-24 02:45:39\n{}", descriptor("relay1", ""));
        assert_eq!(
            RouterDescriptor::parse(text).unwrap_err(),
            DocumentParseError::missing("router")
        );
        let wrong_arity = [
            "router relay1 10.0.0.1 9001 0\n",
            "router relay1 10.0.0.1 9001 0 9030 x\n",
        ];
        for text in wrong_arity {
            assert_eq!(
                RouterDescriptor::parse(text).unwrap_err(),
                DocumentParseError::missing("router")
            );
        }
    }

    #[test]
    fn crlf_line_endings() {
        let lf = descriptor("relay1", "uptime 60\n");
        let crlf = lf.replace('\n', "\r\n");
        let d = RouterDescriptor::parse(&crlf).unwrap();
        assert_eq!(d.nickname, "relay1");
        assert_eq!(d.uptime, Some(60));

        // the digest covers the bytes as sent
        let end = crlf.find("router-signature\r\n").unwrap() + "router-signature\r\n".len();
        assert_eq!(d.digest, digest_from_raw(&crlf[..end]));
        assert_ne!(d.digest, RouterDescriptor::parse(&lf).unwrap().digest);
    }

    #[test]
    fn field_errors() {
        let dup = descriptor("relay1", "uptime 1\nuptime 2\n");
        assert!(matches!(
            RouterDescriptor::parse(dup).unwrap_err(),
            DocumentParseError::DuplicateKeyword { .. }
        ));
        let bad_port = descriptor("relay1", "").replace("9001 0 9030", "9001 0 90300");
        assert!(matches!(
            RouterDescriptor::parse(bad_port).unwrap_err(),
            DocumentParseError::InvalidValue { .. }
        ));
        let no_sig = descriptor("relay1", "").replace("router-signature\n", "");
        assert!(RouterDescriptor::parse(no_sig).is_err());
        let no_bandwidth = descriptor("relay1", "").replace("bandwidth 1000 2000 1500\n", "");
        assert_eq!(
            RouterDescriptor::parse(no_bandwidth).unwrap_err(),
            DocumentParseError::missing("bandwidth")
        );
        let bad_key = descriptor("relay1", "").replacen("SGVsbG8g", "SGVs*G8g", 1);
        assert!(matches!(
            RouterDescriptor::parse(bad_key).unwrap_err(),
            DocumentParseError::SignatureBlockError { .. }
        ));
    }

    #[test]
    fn repeated_keywords() {
        let text = descriptor(
            "relay1",
            "ntor-onion-key Y2lyY3VpdHM=\n\
             hibernating 0\n\
             uptime 3600\n\
             contact someone\n\
             family relay3\n\
             read-history 2014-04-24 02:00:00 (900 s) 1,2,3\n\
             write-history 2014-04-24 02:00:00 (900 s) 1,2,3\n\
             eventdns 1\n\
             caches-extra-info\n\
             extra-info-digest F71CD0157CD231C57BE85186337A160AF2AB9B2E\n\
             hidden-service-dir\n\
             protocols Link 1 2 Circuit 1\n\
             allow-single-hop-exits\n\
             ipv6-policy accept 80\n",
        );
        RouterDescriptor::parse(&text).unwrap();
        DESCRIPTOR.assert_rejects_repeats(&text, |t| RouterDescriptor::parse(t));
    }

    #[test]
    fn trailing_content() {
        let text = descriptor("relay1", "") + "uptime 5\n";
        assert!(matches!(
            RouterDescriptor::parse(&text).unwrap_err(),
            DocumentParseError::OrderingViolation { .. }
        ));
        let lenient = ParseOptions {
            trailing_content: TrailingContent::Ignore,
        };
        let d = RouterDescriptor::parse_with(&text, &lenient).unwrap();
        assert_eq!(d.uptime, None);
    }

    #[test]
    fn many_descriptors() {
        let text = format!(
            "@downloaded-at 2014-04-24 03:00:00\n{}@source \"10.0.0.2\"\n{}",
            descriptor("relay1", ""),
            descriptor("relay2", "")
        );
        let all = RouterDescriptor::parse_many(&text, &ParseOptions::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].nickname, "relay2");
        assert_ne!(all[0].digest, all[1].digest);
        assert!(RouterDescriptor::parse_many("", &ParseOptions::default())
            .unwrap()
            .is_empty());
        assert!(RouterDescriptor::parse_many("garbage\n", &ParseOptions::default()).is_err());
    }
}
