//! Directory authority key certificates
//!
//! A key certificate document is a sequence of records, one per authority
//! key, each opened by `dir-key-certificate-version` and closed by the
//! `dir-key-certification` signature.

use std::collections::BTreeMap;
use std::net::SocketAddrV4;

use crate::dispatch::{self, Args, Cardinality, Handled, Rule, Table, UnknownKeywords, Unphased};
use crate::error::{DocumentParseError, ErrorContext};
use crate::meta::block::{self, Block, BlockKind};
use crate::meta::{self, Fingerprint, Item, Lines};

//
// External dependencies
//
use derive_builder::Builder;
use sha1::{Digest, Sha1};

/// A single authority key certificate.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(private)]
pub struct KeyCertificate {
    pub version: u32,
    /// The authority's identity fingerprint.
    pub fingerprint: Fingerprint,
    #[builder(default, setter(strip_option))]
    pub dir_address: Option<SocketAddrV4>,
    #[builder(default, setter(strip_option))]
    pub published: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub expires: Option<i64>,
    pub identity_key: Block,
    pub signing_key: Block,
    #[builder(default, setter(strip_option))]
    pub crosscert: Option<Block>,
    pub certification: Block,
}

impl KeyCertificate {
    /// SHA-1 of the signing key, as named by consensus `directory-signature` lines.
    pub fn signing_key_digest(&self) -> Result<Fingerprint, DocumentParseError> {
        let der = self.signing_key.decode()?;
        let mut out = [0u8; 20];
        out.copy_from_slice(&Sha1::digest(&der));
        Ok(Fingerprint::from(out))
    }

    /// False once the certificate has expired.
    pub fn is_current(&self, now: i64) -> bool {
        self.expires.map_or(true, |expires| now < expires)
    }
}

/// All certificates from one document, keyed by authority fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCertificateSet {
    pub certificates: BTreeMap<Fingerprint, KeyCertificate>,
}

impl KeyCertificateSet {
    /// Parse a key certificate document. When one authority has several
    /// certificates, the most recently published one is kept.
    pub fn parse(text: impl AsRef<str>) -> Result<KeyCertificateSet, DocumentParseError> {
        let mut set = KeyCertificateSet::default();
        let mut lines = Lines::new(text.as_ref());
        dispatch::run(&KEY_CERTIFICATES, &mut set, &mut lines, |_| false)?;
        Ok(set)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&KeyCertificate> {
        self.certificates.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Keep only the certificates for which `keep` holds.
    pub fn retain(&mut self, mut keep: impl FnMut(&Fingerprint) -> bool) {
        self.certificates.retain(|fp, _| keep(fp));
    }

    fn insert(&mut self, cert: KeyCertificate) {
        match self.certificates.get(&cert.fingerprint) {
            Some(old) if old.published >= cert.published => {}
            _ => {
                self.certificates.insert(cert.fingerprint, cert);
            }
        }
    }
}

type Res = Result<Handled, DocumentParseError>;

static KEY_CERTIFICATE_RULES: phf::Map<&'static str, Rule<KeyCertificateSet, Unphased>> = phf::phf_map! {
    "dir-key-certificate-version" => Rule {
        cardinality: Cardinality::OptionalMany,
        args: Args::Exactly(1),
        phase: Unphased::Body,
        handler: kw_certificate,
    },
};

static KEY_CERTIFICATES: Table<KeyCertificateSet, Unphased> = Table {
    name: "key certificates",
    rules: &KEY_CERTIFICATE_RULES,
    unknown: UnknownKeywords::Reject,
};

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

static RECORD_RULES: phf::Map<&'static str, Rule<KeyCertificateBuilder, Unphased>> = phf::phf_map! {
    "fingerprint" => rule!(RequiredOnce, Args::Exactly(1), kw_fingerprint),
    "dir-address" => rule!(OptionalOnce, Args::Exactly(1), kw_dir_address),
    "dir-key-published" => rule!(OptionalOnce, Args::Exactly(2), kw_published),
    "dir-key-expires" => rule!(OptionalOnce, Args::Exactly(2), kw_expires),
    "dir-identity-key" => rule!(RequiredOnce, Args::Exactly(0), kw_identity_key),
    "dir-signing-key" => rule!(RequiredOnce, Args::Exactly(0), kw_signing_key),
    "dir-key-crosscert" => rule!(OptionalOnce, Args::Exactly(0), kw_crosscert),
    "dir-key-certification" => rule!(RequiredLast, Args::Exactly(0), kw_certification),
};

static RECORD: Table<KeyCertificateBuilder, Unphased> = Table {
    name: "key certificate",
    rules: &RECORD_RULES,
    unknown: UnknownKeywords::Reject,
};

fn kw_certificate(set: &mut KeyCertificateSet, item: &Item<'_>, lines: &mut Lines<'_>) -> Res {
    let version = item.args[0].parse::<u32>().context("dir-key-certificate-version")?;
    if version != 3 {
        return Err(DocumentParseError::UnsupportedVersion {
            found: item.args[0].to_string(),
        });
    }

    // the fingerprint line must come right after the version line
    match lines.peek_item()? {
        Some(next) if next.keyword == "fingerprint" => {}
        _ => return Err(DocumentParseError::missing("fingerprint")),
    }

    let mut record = KeyCertificateBuilder::default();
    record.version(version);
    dispatch::run(&RECORD, &mut record, lines, |_| false)?;
    set.insert(record.build().map_err(DocumentParseError::from_builder)?);
    Ok(Handled::Stored)
}

fn kw_fingerprint(record: &mut KeyCertificateBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    record.fingerprint(Fingerprint::from_str_hex(item.args[0])?);
    Ok(Handled::Stored)
}

fn kw_dir_address(record: &mut KeyCertificateBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    record.dir_address(item.args[0].parse::<SocketAddrV4>().context("dir-address")?);
    Ok(Handled::Stored)
}

fn kw_published(record: &mut KeyCertificateBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    record.published(meta::parse_timestamp(item.args[0], item.args[1], item.keyword)?);
    Ok(Handled::Stored)
}

fn kw_expires(record: &mut KeyCertificateBuilder, item: &Item<'_>, _: &mut Lines<'_>) -> Res {
    record.expires(meta::parse_timestamp(item.args[0], item.args[1], item.keyword)?);
    Ok(Handled::Stored)
}

fn kw_identity_key(record: &mut KeyCertificateBuilder, _: &Item<'_>, lines: &mut Lines<'_>) -> Res {
    record.identity_key(block::extract(lines, BlockKind::RsaPublicKey)?);
    Ok(Handled::Stored)
}

fn kw_signing_key(record: &mut KeyCertificateBuilder, _: &Item<'_>, lines: &mut Lines<'_>) -> Res {
    record.signing_key(block::extract(lines, BlockKind::RsaPublicKey)?);
    Ok(Handled::Stored)
}

fn kw_crosscert(record: &mut KeyCertificateBuilder, _: &Item<'_>, lines: &mut Lines<'_>) -> Res {
    // newer authorities label the cross-certificate as a plain signature
    let kind = match lines.peek_line() {
        Some(line) if line == BlockKind::Signature.begin_marker() => BlockKind::Signature,
        _ => BlockKind::IdSignature,
    };
    record.crosscert(block::extract(lines, kind)?);
    Ok(Handled::Stored)
}

fn kw_certification(record: &mut KeyCertificateBuilder, _: &Item<'_>, lines: &mut Lines<'_>) -> Res {
    record.certification(block::extract(lines, BlockKind::Signature)?);
    Ok(Handled::Stored)
}

#[cfg(test)]
mod test {
    use super::*;

    const AUTH1: &str = "A1DA625EBABD2FC0DE51FDC05116994A55171AD0";
    const AUTH2: &str = "48E6319B00F9D534FCC8065876C3A7D344DC45F6";

    fn record(fingerprint: &str, published: &str) -> String {
        format!(
            "dir-key-certificate-version 3\n\
             fingerprint {}\n\
             dir-address 192.0.2.5:80\n\
             dir-key-published {}\n\
             dir-key-expires 2015-04-24 02:45:39\n\
             dir-identity-key\n-----BEGIN RSA PUBLIC KEY-----\nAAAA\n-----END RSA PUBLIC KEY-----\n\
             dir-signing-key\n-----BEGIN RSA PUBLIC KEY-----\nSGVsbG8gd29ybGQh\n-----END RSA PUBLIC KEY-----\n\
             dir-key-crosscert\n-----BEGIN ID SIGNATURE-----\nAAAA\n-----END ID SIGNATURE-----\n\
             dir-key-certification\n-----BEGIN SIGNATURE-----\nAAAA\n-----END SIGNATURE-----\n",
            fingerprint, published
        )
    }

    #[test]
    fn two_records() {
        let text = record(AUTH1, "2014-04-24 02:45:39") + &record(AUTH2, "2014-04-24 02:45:39");
        let set = KeyCertificateSet::parse(&text).unwrap();
        assert_eq!(set.len(), 2);
        let fp = Fingerprint::from_str_hex(AUTH1).unwrap();
        let cert = set.get(&fp).unwrap();
        assert_eq!(cert.version, 3);
        assert_eq!(cert.dir_address.unwrap().port(), 80);
        assert_eq!(cert.published, Some(1398307539));
        assert!(cert.is_current(1398307539));
        assert!(!cert.is_current(cert.expires.unwrap()));
        assert_eq!(cert.crosscert.as_ref().unwrap().kind, BlockKind::IdSignature);
        assert_eq!(
            cert.signing_key_digest().unwrap(),
            crate::descriptor::digest_from_raw(b"Hello world!")
        );
        assert!(KeyCertificateSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn newest_certificate_wins() {
        let text = record(AUTH1, "2014-04-24 02:45:39") + &record(AUTH1, "2014-05-24 02:45:39");
        let set = KeyCertificateSet::parse(&text).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.certificates.values().next().unwrap().published, Some(1400899539));
    }

    #[test]
    fn fingerprint_must_follow_version() {
        let text = record(AUTH1, "2014-04-24 02:45:39")
            .replace(&format!("fingerprint {}\n", AUTH1), "");
        assert_eq!(
            KeyCertificateSet::parse(text).unwrap_err(),
            DocumentParseError::missing("fingerprint")
        );
        let split = record(AUTH1, "2014-04-24 02:45:39").replace(
            &format!("fingerprint {}", AUTH1),
            &format!("fingerprint {} extra", AUTH1),
        );
        assert!(matches!(
            KeyCertificateSet::parse(split).unwrap_err(),
            DocumentParseError::MalformedLine { .. }
        ));
        let twice = record(AUTH1, "2014-04-24 02:45:39").replace(
            &format!("fingerprint {}\n", AUTH1),
            &format!("fingerprint {}\nfingerprint {}\n", AUTH1, AUTH1),
        );
        assert_eq!(
            KeyCertificateSet::parse(twice).unwrap_err(),
            DocumentParseError::DuplicateKeyword {
                keyword: "fingerprint".into(),
                line: 3,
            }
        );
    }

    #[test]
    fn repeated_keywords() {
        let text = record(AUTH1, "2014-04-24 02:45:39");
        RECORD.assert_rejects_repeats(&text, |t| KeyCertificateSet::parse(t));
    }

    #[test]
    fn record_errors() {
        let unknown = record(AUTH1, "2014-04-24 02:45:39")
            .replace("dir-address 192.0.2.5:80\n", "contact someone\n");
        assert!(matches!(
            KeyCertificateSet::parse(unknown).unwrap_err(),
            DocumentParseError::UnrecognizedKeyword { .. }
        ));
        let bad_address = record(AUTH1, "2014-04-24 02:45:39").replace("192.0.2.5:80", "192.0.2.5");
        assert!(matches!(
            KeyCertificateSet::parse(bad_address).unwrap_err(),
            DocumentParseError::InvalidValue { .. }
        ));
        let dup = record(AUTH1, "2014-04-24 02:45:39")
            .replace("dir-address 192.0.2.5:80\n", "dir-address 192.0.2.5:80\ndir-address 192.0.2.5:80\n");
        assert!(matches!(
            KeyCertificateSet::parse(dup).unwrap_err(),
            DocumentParseError::DuplicateKeyword { .. }
        ));
        let truncated = record(AUTH1, "2014-04-24 02:45:39");
        let truncated = &truncated[..truncated.find("dir-key-certification").unwrap()];
        assert!(matches!(
            KeyCertificateSet::parse(truncated).unwrap_err(),
            DocumentParseError::UnexpectedEndOfDocument { .. }
        ));
        assert!(matches!(
            KeyCertificateSet::parse("fingerprint 1\n").unwrap_err(),
            DocumentParseError::UnrecognizedKeyword { .. }
        ));
    }
}
