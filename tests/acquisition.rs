use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::executor::block_on;

use tordoc_fetch::consensus::Flag;
use tordoc_fetch::descriptor::FamilyMember;
use tordoc_fetch::fetch::{CERTIFICATES_PATH, CONSENSUS_PATH};
use tordoc_fetch::{
    AcceptAll, Authority, Consensus, DirConfig, DocumentFamily, DocumentFetcher,
    DocumentParseError, FetchCoordinator, FetchError, Fingerprint, KeyCertificateSet,
    ParseOptions, RouterDescriptor, Store, StoreError, Target, TargetState, TrailingContent,
};

const CONSENSUS: &str = include_str!("data/consensus.txt");
const DESCRIPTORS: &str = include_str!("data/descriptors.txt");
const CERTIFICATES: &str = include_str!("data/certificates.txt");

const ID1: &str = "DrfIqtdZsm03uFfnCA/SsTi3Whw";
const ID2: &str = "ngYvbwTVJmqXoYfrAgvR/kyTUHM";
const AUTH1: &str = "A1DA625EBABD2FC0DE51FDC05116994A55171AD0";

/// 2014-04-24 15:10:00
const NOW: i64 = 1398352200;

fn descriptors() -> Vec<RouterDescriptor> {
    RouterDescriptor::parse_many(DESCRIPTORS, &ParseOptions::default()).unwrap()
}

/// The consensus, listing the digests of the descriptors we hold.
fn consensus_text() -> String {
    descriptors().iter().fold(CONSENSUS.to_string(), |text, d| {
        text.replace(&format!("<{}>", d.nickname), &d.digest.to_b64())
    })
}

#[test]
fn consensus_document() {
    let c = Consensus::parse(consensus_text()).unwrap();
    let p = &c.preamble;
    assert_eq!(p.consensus_method, Some(28));
    assert_eq!(p.voting_delay, Some((300, 300)));
    assert_eq!(p.client_versions.as_ref().unwrap().len(), 2);
    assert_eq!(p.params["bwweightscale"], 10000);
    assert!(p.protocols.contains_key("recommended-client-protocols"));

    let lifetime = c.lifetime().unwrap();
    assert_eq!(lifetime.fresh_until - lifetime.valid_after, 3600);
    assert!(c.is_live(NOW));
    assert!(!c.is_live(lifetime.valid_until));

    let auth = &c.authorities[AUTH1];
    assert_eq!(auth.nickname, "auth1");
    assert_eq!((auth.dir_port, auth.or_port), (80, 443));

    assert_eq!(c.relays.len(), 2);
    let relay1 = &c.relays[ID1];
    assert!(relay1.has_flag(Flag::Exit));
    assert!(relay1.exit_policy.as_ref().unwrap().allows_port(443));
    let relay2 = &c.relays[ID2];
    assert!(!relay2.exit_policy.as_ref().unwrap().allows_port(80));
    assert_eq!(relay2.bandwidth.as_ref().unwrap()["Unmeasured"], 1);

    let caches: Vec<&str> = c.directory_caches().map(|r| r.nickname.as_str()).collect();
    assert_eq!(caches, vec!["relay1"]);

    assert_eq!(c.bandwidth_weights.as_ref().unwrap()["Wbg"], 4194);
    assert_eq!(c.signatures[AUTH1][0].signature.decode().unwrap(), b"Hello world!");
}

#[test]
fn descriptor_documents() {
    let all = descriptors();
    assert_eq!(all.len(), 2);

    let relay1 = &all[0];
    assert_eq!(relay1.fingerprint.unwrap().to_b64(), ID1);
    assert_eq!(relay1.bandwidth.observed, 5242880);
    assert_eq!(relay1.uptime, Some(86400));
    assert_eq!(relay1.ignored, vec!["proto"]);
    assert!(relay1.allows_exit("192.0.2.1".parse().unwrap(), 443));
    assert!(!relay1.allows_exit("192.0.2.1".parse().unwrap(), 25));
    assert!(relay1.ipv6_policy.allows_port(80));
    assert_eq!(
        relay1.family.as_ref().unwrap()[0],
        FamilyMember::Fingerprint(Fingerprint::from_str_b64(ID2).unwrap())
    );

    let relay2 = &all[1];
    assert!(relay2.hibernating);
    assert!(relay2.onion_key.is_none());
    assert!(!relay2.ipv6_policy.allows_port(80));
    assert_eq!(relay2.family.as_ref().unwrap()[0], FamilyMember::Nickname("relay1".into()));

    // the consensus lists exactly these documents
    let c = Consensus::parse(consensus_text()).unwrap();
    for d in &all {
        let id = d.fingerprint.unwrap().to_b64();
        assert_eq!(c.relays[&id].descriptor_digest().unwrap(), d.digest);
    }
}

#[test]
fn single_descriptor_rejects_what_follows() {
    assert!(matches!(
        RouterDescriptor::parse(DESCRIPTORS).unwrap_err(),
        DocumentParseError::OrderingViolation { .. }
    ));
    let lenient = ParseOptions {
        trailing_content: TrailingContent::Ignore,
    };
    let d = RouterDescriptor::parse_with(DESCRIPTORS, &lenient).unwrap();
    assert_eq!(d.nickname, "relay1");
}

#[test]
fn certificate_document() {
    let set = KeyCertificateSet::parse(CERTIFICATES).unwrap();
    assert_eq!(set.len(), 1);
    let cert = set.get(&Fingerprint::from_str_hex(AUTH1).unwrap()).unwrap();
    assert!(cert.is_current(NOW));
    assert_eq!(cert.dir_address.unwrap().to_string(), "192.0.2.5:80");

    let c = Consensus::parse(consensus_text()).unwrap();
    assert_eq!(
        cert.signing_key_digest().unwrap(),
        c.signatures[AUTH1][0].signing_key_digest
    );
}

/// Serves the documents under `tests/data` from every host.
#[derive(Default)]
struct Directory {
    calls: Mutex<Vec<(String, u16, String)>>,
}

#[async_trait]
impl DocumentFetcher for Directory {
    async fn fetch(&self, host: &str, port: u16, path: &str) -> Result<String, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((host.to_string(), port, path.to_string()));
        match path {
            CONSENSUS_PATH => Ok(consensus_text()),
            CERTIFICATES_PATH => Ok(CERTIFICATES.to_string()),
            p if p.starts_with("/tor/server/d/") => Ok(DESCRIPTORS.to_string()),
            _ => Err(FetchError::Timeout {
                host: host.into(),
                port,
            }),
        }
    }
}

#[derive(Default)]
struct MemStore(Mutex<HashMap<DocumentFamily, String>>);

impl Store for MemStore {
    fn load(&self, family: DocumentFamily) -> Result<Option<String>, StoreError> {
        Ok(self.0.lock().unwrap().get(&family).cloned())
    }

    fn store(&self, family: DocumentFamily, text: &str) -> Result<(), StoreError> {
        self.0.lock().unwrap().insert(family, text.to_string());
        Ok(())
    }
}

fn config() -> DirConfig {
    let mut config = DirConfig::new(vec![Authority {
        nickname: "auth1".into(),
        address: "192.0.2.5".into(),
        dir_port: 80,
        v3ident: Some(AUTH1.into()),
    }]);
    config.rng_seed = Some(7);
    config
}

#[test]
fn fetch_everything() {
    let directory = Arc::new(Directory::default());
    let store = Arc::new(MemStore::default());
    let mut coord =
        FetchCoordinator::new(config(), Arc::clone(&directory), Arc::clone(&store), AcceptAll)
            .unwrap();

    let next = block_on(coord.step(NOW)).unwrap();
    assert!(next > NOW);

    let cache = coord.cache();
    assert_eq!(cache.descriptor_count(), 2);
    assert!(cache.descriptor(ID1).unwrap().allows_exit("192.0.2.1".parse().unwrap(), 80));
    for target in [
        Target::Consensus,
        Target::Certificates,
        Target::Descriptor(ID1.into()),
        Target::Descriptor(ID2.into()),
    ] {
        assert_eq!(coord.target_state(&target, NOW), TargetState::Fetched, "{}", target);
    }

    // consensus and certificates from the authority, descriptors from the
    // only directory cache
    let calls = directory.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    assert_eq!((calls[0].0.as_str(), calls[0].1), ("192.0.2.5", 80));
    assert_eq!((calls[2].0.as_str(), calls[2].1), ("10.0.0.1", 9030));

    // a restart picks everything up from the store
    let mut restarted =
        FetchCoordinator::new(config(), Arc::new(Directory::default()), store, AcceptAll).unwrap();
    restarted.load_from_store(NOW + 60).unwrap();
    assert_eq!(restarted.cache().descriptor_count(), 2);
    assert_eq!(
        restarted.target_state(&Target::Consensus, NOW + 60),
        TargetState::Cached
    );
}

#[test]
fn configuration_is_checked() {
    let err = FetchCoordinator::new(
        DirConfig::new(Vec::new()),
        Directory::default(),
        MemStore::default(),
        AcceptAll,
    )
    .err()
    .unwrap();
    assert!(matches!(err, tordoc_fetch::Error::NoAuthorities));
}
