//! Deciding what to fetch, when, and from where.
//!
//! The scheduler keeps no documents itself: every decision is made from the
//! [`DocumentCache`] contents, the in-flight markers and the failure
//! [`Backoff`]. All times are seconds since the epoch.

use std::collections::HashSet;
use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, trace};

use crate::cache::DocumentCache;
use crate::config::{Authority, ScheduleConfig};
use crate::consensus::{Consensus, Flag, Lifetime, RouterStatus};
use crate::meta::Fingerprint;
use crate::retry::Backoff;
use crate::seeded_rand::SchedulerRng;

/// Something we download.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Consensus,
    Certificates,
    /// A relay's descriptor, by base64 identity digest.
    Descriptor(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Target::Consensus => write!(f, "consensus"),
            Target::Certificates => write!(f, "key certificates"),
            Target::Descriptor(id) => write!(f, "descriptor for {}", id),
        }
    }
}

/// Where a target stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// Nothing usable is held.
    Missing,
    /// A usable document is held, loaded from the store.
    Cached,
    /// A fetch is in flight.
    FetchPending,
    /// A usable document is held, downloaded during this run.
    Fetched,
}

/// A directory server: an authority or a relay that caches documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mirror {
    pub nickname: String,
    pub host: String,
    pub dir_port: u16,
}

impl Mirror {
    pub fn new(nickname: impl Into<String>, host: impl Into<String>, dir_port: u16) -> Self {
        Mirror {
            nickname: nickname.into(),
            host: host.into(),
            dir_port,
        }
    }
}

impl From<&Authority> for Mirror {
    fn from(auth: &Authority) -> Self {
        Mirror::new(auth.nickname.as_str(), auth.address.as_str(), auth.dir_port)
    }
}

impl From<&RouterStatus> for Mirror {
    fn from(relay: &RouterStatus) -> Self {
        Mirror::new(relay.nickname.as_str(), relay.address.to_string(), relay.dir_port)
    }
}

impl fmt::Display for Mirror {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}:{})", self.nickname, self.host, self.dir_port)
    }
}

/// One descriptor to fetch: the relay and the digest the consensus lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorRequest {
    pub identity: String,
    pub digest: Fingerprint,
}

/// Descriptors to request from one mirror in a single fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub mirror: Mirror,
    pub requests: Vec<DescriptorRequest>,
}

impl Batch {
    /// The request path, e.g. `/tor/server/d/<HEX>+<HEX>.z`.
    pub fn path(&self) -> String {
        let digests: Vec<String> = self.requests.iter().map(|r| r.digest.to_string()).collect();
        format!("/tor/server/d/{}.z", digests.join("+"))
    }
}

/// The interval a consensus refresh time is drawn from.
///
/// It starts three quarters of the way from `fresh_until` to `valid_until`
/// and covers seven eighths of the time remaining after that point.
pub fn refresh_window(fresh_until: i64, valid_until: i64) -> (i64, i64) {
    let slack = (valid_until - fresh_until).max(0);
    let start = fresh_until + (3 * slack + 3) / 4;
    let uncertainty = 7 * (valid_until - start).max(0) / 8;
    (start, start + uncertainty)
}

/// Draw a refresh time for a consensus with the given lifetime.
pub fn pick_refresh_time<R: Rng>(lifetime: &Lifetime, rng: &mut R) -> i64 {
    let (start, end) = refresh_window(lifetime.fresh_until, lifetime.valid_until);
    rng.gen_range(start..=end)
}

/// How many mirrors to spread `n_descriptors` over.
///
/// Enough mirrors that none gets more than `max_per_mirror`; otherwise
/// `min_mirrors`, unless that would leave some with fewer than
/// `min_per_request`.
pub fn mirror_count(config: &ScheduleConfig, n_descriptors: usize, n_available: usize) -> usize {
    if n_descriptors == 0 || n_available == 0 {
        return 0;
    }
    let per_request = config.min_descriptors_per_request.max(1);
    let max_per_mirror = config.max_descriptors_per_mirror.max(1);
    let wanted = config
        .min_mirrors
        .min(n_descriptors / per_request)
        .max(1)
        .max((n_descriptors + max_per_mirror - 1) / max_per_mirror);
    wanted.min(n_available)
}

/// The scheduler's mutable state.
#[derive(Debug)]
pub struct Scheduler {
    config: ScheduleConfig,
    backoff: Backoff,
    in_flight: HashSet<Target>,
    fetched: HashSet<Target>,
    /// Refresh time drawn for the consensus with the given valid-after.
    consensus_refresh: Option<(i64, i64)>,
    last_round: Option<i64>,
    rng: SchedulerRng,
}

impl Scheduler {
    pub fn new(config: ScheduleConfig, rng: SchedulerRng) -> Self {
        Scheduler {
            backoff: Backoff::new(&config),
            config,
            in_flight: HashSet::new(),
            fetched: HashSet::new(),
            consensus_refresh: None,
            last_round: None,
            rng,
        }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Mark `target` as in flight. Returns false, and changes nothing, if
    /// it already is: a second request for it is suppressed.
    pub fn begin(&mut self, target: &Target) -> bool {
        if !self.in_flight.insert(target.clone()) {
            trace!(target = %target, "fetch already in flight");
            return false;
        }
        true
    }

    /// Clear the in-flight marker of `target`.
    pub fn finish(&mut self, target: &Target) {
        self.in_flight.remove(target);
    }

    pub fn is_in_flight(&self, target: &Target) -> bool {
        self.in_flight.contains(target)
    }

    pub fn record_failure(&mut self, mirror: &Mirror, target: &Target, now: i64) {
        self.backoff.record_failure(mirror, target, now);
    }

    /// Note that `target` was fetched from `mirror` and installed.
    pub fn record_success(&mut self, mirror: &Mirror, target: &Target) {
        self.backoff.record_success(mirror, target);
        self.fetched.insert(target.clone());
    }

    /// Drop failure records whose reset period has passed.
    pub fn expire_backoff(&mut self, now: i64) {
        self.backoff.expire(now);
    }

    pub fn target_state(&self, target: &Target, cache: &DocumentCache, now: i64) -> TargetState {
        if self.in_flight.contains(target) {
            return TargetState::FetchPending;
        }
        let held = match target {
            Target::Consensus => cache.consensus().map_or(false, |c| c.is_live(now)),
            Target::Certificates => cache.certificates().map_or(false, |c| !c.is_empty()),
            Target::Descriptor(id) => cache.descriptor(id).is_some(),
        };
        match (held, self.fetched.contains(target)) {
            (false, _) => TargetState::Missing,
            (true, true) => TargetState::Fetched,
            (true, false) => TargetState::Cached,
        }
    }

    /// When the held consensus should be replaced; `None` if there is no
    /// live consensus with a complete lifetime (fetch as soon as possible).
    pub fn consensus_refresh_time(&mut self, consensus: Option<&Consensus>, now: i64) -> Option<i64> {
        let consensus = consensus.filter(|c| c.is_live(now))?;
        let lifetime = consensus.lifetime().ok()?;
        match self.consensus_refresh {
            Some((valid_after, at)) if valid_after == lifetime.valid_after => Some(at),
            _ => {
                let at = pick_refresh_time(&lifetime, &mut self.rng);
                debug!(at, "scheduled consensus refresh");
                self.consensus_refresh = Some((lifetime.valid_after, at));
                Some(at)
            }
        }
    }

    /// Every mirror a consensus may come from: the directory caches of a
    /// live consensus, then the authorities.
    pub fn consensus_mirrors(
        consensus: Option<&Consensus>,
        authorities: &[Authority],
        now: i64,
    ) -> Vec<Mirror> {
        let mut mirrors: Vec<Mirror> = consensus
            .filter(|c| c.is_live(now))
            .map(|c| c.directory_caches().map(Mirror::from).collect())
            .unwrap_or_default();
        mirrors.extend(authorities.iter().map(Mirror::from));
        mirrors
    }

    /// True if a consensus fetch should start now: it is time to refresh,
    /// none is in flight, and some source is not backing off.
    pub fn consensus_due(
        &mut self,
        consensus: Option<&Consensus>,
        authorities: &[Authority],
        now: i64,
    ) -> bool {
        let target = Target::Consensus;
        if self.in_flight.contains(&target) {
            return false;
        }
        let due = self
            .consensus_refresh_time(consensus, now)
            .map_or(true, |at| now >= at);
        due && Self::consensus_mirrors(consensus, authorities, now)
            .iter()
            .any(|m| self.backoff.is_ready(m, &target, now))
    }

    /// Choose where to fetch the consensus from: a random directory cache
    /// listed in a live consensus, else a random authority. Sources still
    /// backing off from a consensus failure are skipped.
    pub fn consensus_source(
        &mut self,
        consensus: Option<&Consensus>,
        authorities: &[Authority],
        now: i64,
    ) -> Option<Mirror> {
        let target = Target::Consensus;
        if let Some(c) = consensus.filter(|c| c.is_live(now)) {
            let caches: Vec<Mirror> = c
                .directory_caches()
                .map(Mirror::from)
                .filter(|m| self.backoff.is_ready(m, &target, now))
                .collect();
            if let Some(m) = caches.choose(&mut self.rng) {
                return Some(m.clone());
            }
        }
        self.pick_authority(authorities, &target, now)
    }

    /// A random authority that is not backing off from `target`.
    pub fn pick_authority(
        &mut self,
        authorities: &[Authority],
        target: &Target,
        now: i64,
    ) -> Option<Mirror> {
        let ready: Vec<Mirror> = authorities
            .iter()
            .map(Mirror::from)
            .filter(|m| self.backoff.is_ready(m, target, now))
            .collect();
        ready.choose(&mut self.rng).cloned()
    }

    /// Descriptors worth fetching now, per `consensus`: listed as running
    /// and valid, not held, not in flight, and with at least one of
    /// `mirrors` not backing off from them.
    pub fn downloadable(
        &self,
        consensus: &Consensus,
        cache: &DocumentCache,
        mirrors: &[Mirror],
        now: i64,
    ) -> Vec<DescriptorRequest> {
        let min_age = i64::try_from(self.config.min_publication_age.as_secs()).unwrap_or(i64::MAX);
        consensus
            .relays
            .iter()
            .filter(|(_, r)| now - r.published >= min_age)
            .filter(|(_, r)| r.has_flag(Flag::Running) && r.has_flag(Flag::Valid))
            .filter_map(|(id, r)| {
                let digest = r.descriptor_digest().ok()?;
                if cache.descriptor(id).map_or(false, |d| d.digest == digest) {
                    return None;
                }
                let target = Target::Descriptor(id.clone());
                if self.in_flight.contains(&target)
                    || !mirrors.iter().any(|m| self.backoff.is_ready(m, &target, now))
                {
                    return None;
                }
                Some(DescriptorRequest {
                    identity: id.clone(),
                    digest,
                })
            })
            .collect()
    }

    /// True if a descriptor round should start for `n_downloadable` descriptors.
    pub fn should_launch_round(&self, n_downloadable: usize, now: i64) -> bool {
        if n_downloadable == 0 {
            return false;
        }
        let interval = i64::try_from(self.config.round_interval.as_secs()).unwrap_or(i64::MAX);
        n_downloadable >= self.config.round_threshold
            || self.last_round.map_or(true, |t| now - t >= interval)
    }

    /// Spread `requests` over randomly chosen `mirrors`, and mark them all
    /// in flight. Requests already in flight are dropped. A request is never
    /// dealt to a mirror backing off from it; if every chosen mirror is, it
    /// goes to another ready mirror, or waits for a later round.
    pub fn plan_round(
        &mut self,
        requests: Vec<DescriptorRequest>,
        mirrors: &[Mirror],
        now: i64,
    ) -> Vec<Batch> {
        let mut requests: Vec<DescriptorRequest> = requests
            .into_iter()
            .filter(|r| self.begin(&Target::Descriptor(r.identity.clone())))
            .collect();
        let count = mirror_count(&self.config, requests.len(), mirrors.len());
        if count == 0 {
            for r in &requests {
                self.finish(&Target::Descriptor(r.identity.clone()));
            }
            return Vec::new();
        }
        self.last_round = Some(now);

        requests.shuffle(&mut self.rng);
        let mut dealt: Vec<(Mirror, Vec<DescriptorRequest>)> = mirrors
            .choose_multiple(&mut self.rng, count)
            .map(|m| (m.clone(), Vec::new()))
            .collect();
        for (i, r) in requests.into_iter().enumerate() {
            let target = Target::Descriptor(r.identity.clone());
            let backoff = &self.backoff;
            let slot = (0..count)
                .map(|k| (i + k) % count)
                .find(|&k| backoff.is_ready(&dealt[k].0, &target, now))
                .or_else(|| {
                    let spare = mirrors.iter().find(|m| backoff.is_ready(m, &target, now))?;
                    match dealt.iter().position(|(m, _)| m == spare) {
                        Some(k) => Some(k),
                        None => {
                            dealt.push((spare.clone(), Vec::new()));
                            Some(dealt.len() - 1)
                        }
                    }
                });
            match slot {
                Some(k) => dealt[k].1.push(r),
                None => {
                    trace!(target = %target, "every mirror is backing off");
                    self.finish(&target);
                }
            }
        }

        let max = self.config.max_descriptors_per_mirror.max(1);
        let mut batches = Vec::new();
        for (mirror, assigned) in dealt {
            for chunk in assigned.chunks(max) {
                batches.push(Batch {
                    mirror: mirror.clone(),
                    requests: chunk.to_vec(),
                });
            }
        }
        debug!(batches = batches.len(), mirrors = count, "planned descriptor round");
        batches
    }
}
