//! Phase change filter.
//!
//! Most MODIFIED notifications are status churn (conditions, IPs, restart
//! counters) without a phase change. The filter compares each observation with
//! the last one seen for the same UID and only lets real transitions through.
//!
//! The previous-state cache is owned by a single watch loop and mutated only
//! from its task.

use clusterapi_client::{EventKind, PodPhase};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::normalizer::PodObservation;

/// A notification-worthy phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Kind of the emitted event
    pub kind: EventKind,
    /// Phase before the transition, if known
    pub previous: Option<PodPhase>,
    /// Phase after the transition
    pub new: PodPhase,
}

/// Decides whether `current` is a transition relative to `previous`.
///
/// - ADDED or MODIFIED without a previous entry emits ADDED.
/// - ADDED or MODIFIED with a previous entry emits MODIFIED iff the phase changed.
/// - DELETED always emits `previous -> Terminated`.
pub fn decide(kind: EventKind, previous: Option<&PodObservation>, current: &PodObservation) -> Option<Transition> {
    match (kind, previous) {
        (EventKind::Deleted, previous) => Some(Transition {
            kind: EventKind::Deleted,
            previous: previous.map(|p| p.phase),
            new: PodPhase::Terminated,
        }),
        (_, None) => Some(Transition {
            kind: EventKind::Added,
            previous: None,
            new: current.phase,
        }),
        (_, Some(previous)) if previous.phase != current.phase => Some(Transition {
            kind: EventKind::Modified,
            previous: Some(previous.phase),
            new: current.phase,
        }),
        (_, Some(_)) => None,
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    observation: PodObservation,
    last_seen: Instant,
}

/// Last observation per pod UID, with TTL eviction.
#[derive(Debug)]
pub struct PreviousStateCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
}

impl PreviousStateCache {
    /// Creates an empty cache whose entries expire `ttl` after their last sighting
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Last observation for `uid`
    pub fn get(&self, uid: &str) -> Option<&PodObservation> {
        self.entries.get(uid).map(|entry| &entry.observation)
    }

    /// Records `observation` as the latest sighting of its UID
    pub fn insert(&mut self, observation: PodObservation, now: Instant) {
        self.entries.insert(
            observation.uid.clone(),
            CacheEntry {
                observation,
                last_seen: now,
            },
        );
    }

    /// Forgets `uid`
    pub fn remove(&mut self, uid: &str) -> Option<PodObservation> {
        self.entries.remove(uid).map(|entry| entry.observation)
    }

    /// Number of cached pods
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops entries not seen for longer than the TTL. Returns how many were dropped.
    pub fn evict_expired_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= ttl);
        before - self.entries.len()
    }

    fn uids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Stateful wrapper around [`decide`] that keeps the cache current.
#[derive(Debug)]
pub struct PhaseChangeFilter {
    cache: PreviousStateCache,
}

impl PhaseChangeFilter {
    /// Creates a filter with an empty cache
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            cache: PreviousStateCache::new(cache_ttl),
        }
    }

    /// Feeds one notification through the filter.
    ///
    /// The cache is updated (or the entry removed on DELETED) whether or not a
    /// transition is emitted.
    pub fn observe(&mut self, kind: EventKind, current: PodObservation) -> Option<Transition> {
        self.observe_at(kind, current, Instant::now())
    }

    fn observe_at(&mut self, kind: EventKind, current: PodObservation, now: Instant) -> Option<Transition> {
        let transition = decide(kind, self.cache.get(&current.uid), &current);

        if kind == EventKind::Deleted {
            self.cache.remove(&current.uid);
        } else {
            self.cache.insert(current, now);
        }

        transition
    }

    /// Reconciles a full LIST against the cache.
    ///
    /// Listed pods go through [`PhaseChangeFilter::observe`]. Cached pods missing
    /// from the listing are treated as deleted, using their last observation
    /// re-stamped with `now`.
    pub fn reconcile_listing(
        &mut self,
        pods: Vec<PodObservation>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Vec<(Transition, PodObservation)> {
        let listed: HashSet<String> = pods.iter().map(|p| p.uid.clone()).collect();
        let mut transitions = Vec::new();

        for uid in self.cache.uids() {
            if listed.contains(&uid) {
                continue;
            }
            if let Some(mut vanished) = self.cache.get(&uid).cloned() {
                vanished.observed_at = now;
                if let Some(transition) = self.observe(EventKind::Deleted, vanished.clone()) {
                    transitions.push((transition, vanished));
                }
            }
        }

        for pod in pods {
            if let Some(transition) = self.observe(EventKind::Added, pod.clone()) {
                transitions.push((transition, pod));
            }
        }

        transitions
    }

    /// Drops cache entries past their TTL
    pub fn evict_expired(&mut self) -> usize {
        self.cache.evict_expired_at(Instant::now())
    }

    /// Read access to the cache
    pub fn cache(&self) -> &PreviousStateCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn observation(uid: &str, phase: PodPhase) -> PodObservation {
        PodObservation {
            namespace: "default".to_string(),
            name: format!("pod-{uid}"),
            uid: uid.to_string(),
            phase,
            resource_version: None,
            observed_at: Utc::now(),
            node_name: None,
            containers: Vec::new(),
            conditions: Vec::new(),
            created_at: None,
            deleting_at: None,
        }
    }

    fn filter() -> PhaseChangeFilter {
        PhaseChangeFilter::new(Duration::from_secs(3600))
    }

    #[test]
    fn test_added_always_emits() {
        let transition = decide(EventKind::Added, None, &observation("x", PodPhase::Pending));
        assert_eq!(
            transition,
            Some(Transition {
                kind: EventKind::Added,
                previous: None,
                new: PodPhase::Pending
            })
        );
    }

    #[test]
    fn test_modified_without_phase_change_is_silent() {
        let previous = observation("x", PodPhase::Running);
        assert_eq!(decide(EventKind::Modified, Some(&previous), &observation("x", PodPhase::Running)), None);
    }

    #[test]
    fn test_modified_cache_miss_is_added() {
        let transition = decide(EventKind::Modified, None, &observation("x", PodPhase::Running));
        assert_eq!(transition.map(|t| t.kind), Some(EventKind::Added));
    }

    #[test]
    fn test_deleted_unknown_uid() {
        let transition = decide(EventKind::Deleted, None, &observation("x", PodPhase::Running));
        assert_eq!(
            transition,
            Some(Transition {
                kind: EventKind::Deleted,
                previous: None,
                new: PodPhase::Terminated
            })
        );
    }

    #[test]
    fn test_lifecycle_sequence() {
        let mut filter = filter();

        let emitted: Vec<_> = [
            (EventKind::Added, PodPhase::Pending),
            (EventKind::Modified, PodPhase::Pending),
            (EventKind::Modified, PodPhase::Running),
            (EventKind::Deleted, PodPhase::Running),
        ]
        .into_iter()
        .filter_map(|(kind, phase)| filter.observe(kind, observation("x", phase)))
        .map(|t| (t.previous, t.new))
        .collect();

        assert_eq!(
            emitted,
            vec![
                (None, PodPhase::Pending),
                (Some(PodPhase::Pending), PodPhase::Running),
                (Some(PodPhase::Running), PodPhase::Terminated),
            ]
        );
        assert!(filter.cache().is_empty());
    }

    #[test]
    fn test_cache_tracks_latest_phase_even_without_transition() {
        let mut filter = filter();

        filter.observe(EventKind::Added, observation("x", PodPhase::Running));
        let mut churn = observation("x", PodPhase::Running);
        churn.resource_version = Some("9".to_string());
        assert_eq!(filter.observe(EventKind::Modified, churn), None);

        let cached = filter.cache().get("x").expect("cached");
        assert_eq!(cached.phase, PodPhase::Running);
        assert_eq!(cached.resource_version.as_deref(), Some("9"));
        assert_eq!(filter.cache().len(), 1);
    }

    #[test]
    fn test_reconcile_listing_after_resync() {
        let mut filter = filter();
        filter.observe(EventKind::Added, observation("stays", PodPhase::Running));
        filter.observe(EventKind::Added, observation("changes", PodPhase::Pending));
        filter.observe(EventKind::Added, observation("vanishes", PodPhase::Running));

        let listing = vec![
            observation("stays", PodPhase::Running),
            observation("changes", PodPhase::Failed),
            observation("appears", PodPhase::Pending),
        ];
        let mut transitions: Vec<_> = filter
            .reconcile_listing(listing, Utc::now())
            .into_iter()
            .map(|(t, obs)| (obs.uid, t.kind, t.previous, t.new))
            .collect();
        transitions.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(
            transitions,
            vec![
                ("appears".to_string(), EventKind::Added, None, PodPhase::Pending),
                ("changes".to_string(), EventKind::Modified, Some(PodPhase::Pending), PodPhase::Failed),
                ("vanishes".to_string(), EventKind::Deleted, Some(PodPhase::Running), PodPhase::Terminated),
            ]
        );
        assert!(filter.cache().get("vanishes").is_none());
        assert_eq!(filter.cache().len(), 3);
    }

    #[test]
    fn test_ttl_eviction() {
        let mut cache = PreviousStateCache::new(Duration::from_secs(60));
        let start = Instant::now();

        cache.insert(observation("old", PodPhase::Running), start);
        cache.insert(observation("fresh", PodPhase::Running), start + Duration::from_secs(50));

        assert_eq!(cache.evict_expired_at(start + Duration::from_secs(90)), 1);
        assert!(cache.get("old").is_none());
        assert!(cache.get("fresh").is_some());
    }

    #[test]
    fn test_resighting_refreshes_ttl() {
        let mut filter = PhaseChangeFilter::new(Duration::from_secs(60));
        let start = Instant::now();

        filter.observe_at(EventKind::Added, observation("x", PodPhase::Running), start);
        filter.observe_at(
            EventKind::Modified,
            observation("x", PodPhase::Running),
            start + Duration::from_secs(45),
        );

        assert_eq!(filter.cache.evict_expired_at(start + Duration::from_secs(90)), 0);
    }
}
