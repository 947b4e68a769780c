//! Fetching documents from mirrors and installing them in the cache.
//!
//! The [`FetchCoordinator`] turns the [`Scheduler`]'s decisions into
//! requests through a [`DocumentFetcher`], checks that every response is
//! what was asked for, and swaps accepted documents into the
//! [`DocumentCache`]. Failures of any kind only feed the backoff; nothing
//! is retried synchronously.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::cache::DocumentCache;
use crate::certificate::{KeyCertificate, KeyCertificateSet};
use crate::config::DirConfig;
use crate::consensus::Consensus;
use crate::descriptor::{self, RouterDescriptor};
use crate::error::{Error, FetchError, StoreError};
use crate::meta::Fingerprint;
use crate::schedule::{Batch, DescriptorRequest, Mirror, Scheduler, Target, TargetState};
use crate::seeded_rand::rng_from_seed;

/// Where directory servers publish the current consensus.
pub const CONSENSUS_PATH: &str = "/tor/status-vote/current/consensus.z";
/// Where directory servers publish all authority key certificates.
pub const CERTIFICATES_PATH: &str = "/tor/keys/all.z";

/// Fetches raw documents from directory servers.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// Fetch `path` from `host:port` and return the decompressed text.
    async fn fetch(&self, host: &str, port: u16, path: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl<T: DocumentFetcher + ?Sized> DocumentFetcher for Arc<T> {
    async fn fetch(&self, host: &str, port: u16, path: &str) -> Result<String, FetchError> {
        (**self).fetch(host, port, path).await
    }
}

/// The families of documents that are persisted, one blob each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum DocumentFamily {
    Consensus,
    Certificates,
    Descriptors,
}

/// Persistent storage for raw documents.
pub trait Store: Send + Sync {
    fn load(&self, family: DocumentFamily) -> Result<Option<String>, StoreError>;
    fn store(&self, family: DocumentFamily, text: &str) -> Result<(), StoreError>;
}

impl<T: Store + ?Sized> Store for Arc<T> {
    fn load(&self, family: DocumentFamily) -> Result<Option<String>, StoreError> {
        (**self).load(family)
    }

    fn store(&self, family: DocumentFamily, text: &str) -> Result<(), StoreError> {
        (**self).store(family, text)
    }
}

/// Signature checks, performed before a document is accepted.
pub trait Verifier: Send + Sync {
    fn verify_consensus(
        &self,
        consensus: &Consensus,
        certificates: Option<&KeyCertificateSet>,
    ) -> bool;
    fn verify_certificate(&self, certificate: &KeyCertificate) -> bool;
    fn verify_descriptor(&self, descriptor: &RouterDescriptor) -> bool;
}

/// A [`Verifier`] that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Verifier for AcceptAll {
    fn verify_consensus(&self, _: &Consensus, _: Option<&KeyCertificateSet>) -> bool {
        true
    }

    fn verify_certificate(&self, _: &KeyCertificate) -> bool {
        true
    }

    fn verify_descriptor(&self, _: &RouterDescriptor) -> bool {
        true
    }
}

/// Keep fetch failures out of the way: they are already in the backoff.
fn absorb<T>(result: Result<T, Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(Error::Fetch(e)) => {
            debug!(error = %e, "fetch did not succeed");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn secs(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

/// Drives all downloads for one client.
pub struct FetchCoordinator<F, S, V = AcceptAll> {
    config: DirConfig,
    fetcher: F,
    store: S,
    verifier: V,
    cache: Arc<DocumentCache>,
    scheduler: Scheduler,
}

impl<F: DocumentFetcher, S: Store, V: Verifier> FetchCoordinator<F, S, V> {
    pub fn new(config: DirConfig, fetcher: F, store: S, verifier: V) -> Result<Self, Error> {
        Self::with_cache(config, fetcher, store, verifier, Arc::new(DocumentCache::new()))
    }

    /// Like [`FetchCoordinator::new`], installing into an existing cache.
    pub fn with_cache(
        config: DirConfig,
        fetcher: F,
        store: S,
        verifier: V,
        cache: Arc<DocumentCache>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let scheduler = Scheduler::new(config.schedule.clone(), rng_from_seed(config.rng_seed));
        Ok(FetchCoordinator {
            config,
            fetcher,
            store,
            verifier,
            cache,
            scheduler,
        })
    }

    pub fn cache(&self) -> Arc<DocumentCache> {
        Arc::clone(&self.cache)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn target_state(&self, target: &Target, now: i64) -> TargetState {
        self.scheduler.target_state(target, &self.cache, now)
    }

    /// Fill the cache from the store. Stored documents that no longer
    /// parse are skipped, as is a stored consensus that has expired.
    pub fn load_from_store(&mut self, now: i64) -> Result<(), Error> {
        if let Some(text) = self.store.load(DocumentFamily::Consensus)? {
            match Consensus::parse(&text) {
                Ok(c) if c.is_live(now) => {
                    self.cache.set_consensus(c);
                }
                Ok(_) => debug!("stored consensus has expired"),
                Err(e) => warn!(error = %e, "ignoring unparseable stored consensus"),
            }
        }

        if let Some(text) = self.store.load(DocumentFamily::Certificates)? {
            match self.check_certificates(&text) {
                Ok(set) => self.cache.set_certificates(set),
                Err(e) => warn!(error = %e, "ignoring stored key certificates"),
            }
        }

        if let Some(text) = self.store.load(DocumentFamily::Descriptors)? {
            let consensus = self.cache.consensus();
            for chunk in descriptor::split_descriptors(&text) {
                let desc = match RouterDescriptor::parse_with(chunk, &self.config.parse) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(error = %e, "ignoring unparseable stored descriptor");
                        continue;
                    }
                };
                let identity = desc.fingerprint.map(|fp| fp.to_b64()).or_else(|| {
                    consensus.as_ref().and_then(|c| {
                        c.relays
                            .iter()
                            .find(|(_, r)| r.descriptor_digest().ok() == Some(desc.digest))
                            .map(|(id, _)| id.clone())
                    })
                });
                match identity {
                    Some(id) => {
                        self.cache.insert_descriptor(&id, desc, chunk, now);
                    }
                    None => debug!(digest = %desc.digest, "stored descriptor names no relay"),
                }
            }
        }
        Ok(())
    }

    /// Fetch a consensus and install it if it is newer than the one held.
    /// Returns false if a consensus fetch was already in flight.
    pub async fn refresh_consensus(&mut self, now: i64) -> Result<bool, Error> {
        let target = Target::Consensus;
        let cached = self.cache.consensus();
        let mirror = self
            .scheduler
            .consensus_source(cached.as_deref(), &self.config.authorities, now)
            .ok_or_else(|| FetchError::NoSource(target.clone()))?;
        if !self.scheduler.begin(&target) {
            return Ok(false);
        }

        debug!(mirror = %mirror, "fetching consensus");
        let result = self
            .fetcher
            .fetch(&mirror.host, mirror.dir_port, CONSENSUS_PATH)
            .await;
        self.scheduler.finish(&target);

        let checked = result.and_then(|text| {
            self.check_consensus(&text, cached.as_deref(), now)
                .map(|c| (c, text))
        });
        let (consensus, text) = match checked {
            Ok(v) => v,
            Err(e) => {
                self.scheduler.record_failure(&mirror, &target, now);
                return Err(e.into());
            }
        };

        self.cache.set_consensus(consensus);
        self.scheduler.record_success(&mirror, &target);
        self.store.store(DocumentFamily::Consensus, &text)?;
        Ok(true)
    }

    fn check_consensus(
        &self,
        text: &str,
        cached: Option<&Consensus>,
        now: i64,
    ) -> Result<Consensus, FetchError> {
        let consensus = Consensus::parse(text)?;
        let lifetime = consensus.lifetime()?;
        if let Some(held) = cached.and_then(|c| c.preamble.valid_after) {
            if lifetime.valid_after <= held {
                warn!(
                    valid_after = lifetime.valid_after,
                    held, "discarding consensus that is not newer than ours"
                );
                return Err(FetchError::StaleDocument {
                    what: "consensus".into(),
                });
            }
        }
        if !consensus.is_live(now) {
            warn!(valid_until = lifetime.valid_until, "discarding expired consensus");
            return Err(FetchError::StaleDocument {
                what: "consensus".into(),
            });
        }
        let certificates = self.cache.certificates();
        if !self
            .verifier
            .verify_consensus(&consensus, certificates.as_deref())
        {
            return Err(FetchError::SignatureRejected {
                what: "consensus".into(),
            });
        }
        Ok(consensus)
    }

    /// True if key certificates should be fetched now.
    pub fn certificates_due(&self, now: i64) -> bool {
        let target = Target::Certificates;
        let backoff = self.scheduler.backoff();
        if self.scheduler.is_in_flight(&target)
            || !self
                .config
                .authorities
                .iter()
                .any(|a| backoff.is_ready(&Mirror::from(a), &target, now))
        {
            return false;
        }
        match self.cache.certificates() {
            None => true,
            Some(set) => set.is_empty() || set.certificates.values().any(|c| !c.is_current(now)),
        }
    }

    /// Fetch key certificates from an authority.
    pub async fn fetch_certificates(&mut self, now: i64) -> Result<bool, Error> {
        let target = Target::Certificates;
        let mirror = self
            .scheduler
            .pick_authority(&self.config.authorities, &target, now)
            .ok_or_else(|| FetchError::NoSource(target.clone()))?;
        if !self.scheduler.begin(&target) {
            return Ok(false);
        }

        debug!(mirror = %mirror, "fetching key certificates");
        let result = self
            .fetcher
            .fetch(&mirror.host, mirror.dir_port, CERTIFICATES_PATH)
            .await;
        self.scheduler.finish(&target);

        match result.and_then(|text| self.check_certificates(&text).map(|s| (s, text))) {
            Ok((set, text)) => {
                self.cache.set_certificates(set);
                self.scheduler.record_success(&mirror, &target);
                self.store.store(DocumentFamily::Certificates, &text)?;
                Ok(true)
            }
            Err(e) => {
                self.scheduler.record_failure(&mirror, &target, now);
                Err(e.into())
            }
        }
    }

    /// Authorities we accept certificates for: those the consensus lists,
    /// and those configured with a v3ident.
    fn known_authorities(&self) -> BTreeSet<Fingerprint> {
        let mut known: BTreeSet<Fingerprint> = self
            .config
            .authorities
            .iter()
            .filter_map(|a| a.v3ident_fingerprint())
            .collect();
        if let Some(c) = self.cache.consensus() {
            known.extend(c.authorities.values().map(|a| a.identity));
        }
        known
    }

    fn check_certificates(&self, text: &str) -> Result<KeyCertificateSet, FetchError> {
        let mut set = KeyCertificateSet::parse(text)?;
        let known = self.known_authorities();
        if !known.is_empty() {
            set.retain(|fp| {
                let keep = known.contains(fp);
                if !keep {
                    warn!(fingerprint = %fp, "discarding certificate of an unknown authority");
                }
                keep
            });
        }
        if set.is_empty() {
            return Err(FetchError::UnsolicitedDocument {
                what: "key certificates".into(),
            });
        }
        let verifier = &self.verifier;
        set.certificates.retain(|_, c| verifier.verify_certificate(c));
        if set.is_empty() {
            return Err(FetchError::SignatureRejected {
                what: "key certificates".into(),
            });
        }
        Ok(set)
    }

    /// Launch a descriptor round if one is due. Returns how many
    /// descriptors were installed.
    pub async fn run_descriptor_round(&mut self, now: i64) -> Result<usize, Error> {
        let consensus = match self.cache.consensus().filter(|c| c.is_live(now)) {
            Some(c) => c,
            None => return Ok(0),
        };
        let mut mirrors: Vec<Mirror> = consensus.directory_caches().map(Mirror::from).collect();
        if mirrors.is_empty() {
            mirrors = self.config.authorities.iter().map(Mirror::from).collect();
        }
        let wanted = self
            .scheduler
            .downloadable(&consensus, &self.cache, &mirrors, now);
        if !self.scheduler.should_launch_round(wanted.len(), now) {
            return Ok(0);
        }

        let batches = self.scheduler.plan_round(wanted, &mirrors, now);
        if batches.is_empty() {
            return Ok(0);
        }
        let generation = consensus.preamble.valid_after;
        info!(
            n_requests = batches.len(),
            n_descriptors = batches.iter().map(|b| b.requests.len()).sum::<usize>(),
            "launching descriptor round"
        );

        let fetcher = &self.fetcher;
        let responses: Vec<(Batch, Result<String, FetchError>)> = stream::iter(batches)
            .map(|batch| async move {
                let result = fetcher
                    .fetch(&batch.mirror.host, batch.mirror.dir_port, &batch.path())
                    .await;
                (batch, result)
            })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;

        let current = self.cache.consensus().and_then(|c| c.preamble.valid_after);
        if current != generation {
            warn!("consensus replaced during descriptor round; discarding its results");
            for (batch, _) in &responses {
                self.finish_batch(batch);
            }
            return Ok(0);
        }

        let mut installed = 0;
        for (batch, result) in responses {
            installed += self.absorb_batch(&batch, result, now);
            self.finish_batch(&batch);
        }
        if installed > 0 {
            self.store
                .store(DocumentFamily::Descriptors, &self.cache.descriptors_raw())?;
        }
        Ok(installed)
    }

    fn finish_batch(&mut self, batch: &Batch) {
        for r in &batch.requests {
            self.scheduler.finish(&Target::Descriptor(r.identity.clone()));
        }
    }

    /// Install what a mirror returned for `batch`; record failures for
    /// whatever it did not deliver.
    fn absorb_batch(&mut self, batch: &Batch, result: Result<String, FetchError>, now: i64) -> usize {
        let text = match result {
            Ok(text) => text,
            Err(e) => {
                debug!(mirror = %batch.mirror, error = %e, "descriptor fetch failed");
                for r in &batch.requests {
                    self.scheduler
                        .record_failure(&batch.mirror, &Target::Descriptor(r.identity.clone()), now);
                }
                return 0;
            }
        };

        let mut pending: HashMap<Fingerprint, &DescriptorRequest> =
            batch.requests.iter().map(|r| (r.digest, r)).collect();
        let mut installed = 0;
        for chunk in descriptor::split_descriptors(&text) {
            let desc = match RouterDescriptor::parse_with(chunk, &self.config.parse) {
                Ok(d) => d,
                Err(e) => {
                    warn!(mirror = %batch.mirror, error = %e, "mirror sent an unparseable descriptor");
                    continue;
                }
            };
            let request = match pending.remove(&desc.digest) {
                Some(r) => r,
                None => {
                    warn!(mirror = %batch.mirror, digest = %desc.digest, "discarding unsolicited descriptor");
                    continue;
                }
            };
            let target = Target::Descriptor(request.identity.clone());
            if !self.verifier.verify_descriptor(&desc) {
                warn!(mirror = %batch.mirror, target = %target, "descriptor signature rejected");
                self.scheduler.record_failure(&batch.mirror, &target, now);
                continue;
            }
            if self.cache.insert_descriptor(&request.identity, desc, chunk, now) {
                installed += 1;
            }
            self.scheduler.record_success(&batch.mirror, &target);
        }

        for request in pending.values() {
            debug!(mirror = %batch.mirror, identity = %request.identity, "requested descriptor missing");
            self.scheduler
                .record_failure(&batch.mirror, &Target::Descriptor(request.identity.clone()), now);
        }
        installed
    }

    /// One iteration of the control loop: refresh the consensus if due,
    /// fetch certificates if missing, evict old descriptors and run a
    /// descriptor round if due. Returns when to call again.
    pub async fn step(&mut self, now: i64) -> Result<i64, Error> {
        let consensus = self.cache.consensus();
        if self
            .scheduler
            .consensus_due(consensus.as_deref(), &self.config.authorities, now)
        {
            absorb(self.refresh_consensus(now).await)?;
        }
        if self.certificates_due(now) {
            absorb(self.fetch_certificates(now).await)?;
        }
        self.cache
            .evict_descriptors(now, self.scheduler.config().descriptor_retention);
        absorb(self.run_descriptor_round(now).await)?;
        self.scheduler.expire_backoff(now);
        Ok(self.next_wake(now))
    }

    fn next_wake(&mut self, now: i64) -> i64 {
        let mut next = now + secs(self.scheduler.config().descriptor_check_interval).max(1);
        let consensus = self.cache.consensus();
        if let Some(at) = self.scheduler.consensus_refresh_time(consensus.as_deref(), now) {
            if at > now {
                next = next.min(at);
            }
        }
        let sources =
            Scheduler::consensus_mirrors(consensus.as_deref(), &self.config.authorities, now);
        let retry = self
            .scheduler
            .backoff()
            .first_ready_at(&sources, &Target::Consensus, now);
        if let Some(retry) = retry.filter(|&t| t > now) {
            next = next.min(retry);
        }
        next
    }

    /// Run [`FetchCoordinator::step`] forever. `clock` returns the current
    /// time; `sleep` waits until the given time and returns false to stop.
    pub async fn run<C, Z, Fut>(&mut self, clock: C, mut sleep: Z) -> Result<(), Error>
    where
        C: Fn() -> i64,
        Z: FnMut(i64) -> Fut,
        Fut: Future<Output = bool>,
    {
        loop {
            let next = self.step(clock()).await?;
            if !sleep(next).await {
                return Ok(());
            }
        }
    }
}
