use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use super::bus::{Event, EventBus, EventKind};

/// Byte-count threshold (per SSRC, cumulative) distinguishing real audio from the small
/// keep-alive/comfort-noise packets a silent stream still emits (§4.5: "~1 KB of non-zero
/// RTP payload per second"). Sticky: once crossed, an SSRC stays audio-active.
const AUDIO_ACTIVE_BYTE_THRESHOLD: u64 = 1024;

/// A confirmed SSRC→user binding (from `speaking_update`), or one reached by single-unknown
/// deduction from audio activity. Per §4.5's invariants a deduced binding is treated as
/// confirmed for every purpose except one: an explicit `speaking_update` may still overwrite
/// it, publishing [`Event::BindingCorrected`] when it does.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Confirmed(Arc<str>),
    Deduced(Arc<str>),
}

impl Binding {
    fn user_id(&self) -> Arc<str> {
        match self {
            Binding::Confirmed(id) | Binding::Deduced(id) => id.clone(),
        }
    }
}

struct SsrcMeta {
    #[allow(dead_code)] // carried per §4.5's per-SSRC state list; no rule reads it yet
    first_seen: Instant,
    total_bytes: u64,
    audio_active: bool,
}

/// Resolves RTP SSRC values to stable user identities for one channel session (§4.5).
///
/// The voice-channel collaborator confirms identity out of band, in one of two ways: an
/// explicit `speaking_update` (authoritative, always wins), or implicitly, by this resolver
/// noticing that exactly one expected-but-unidentified user must be the source of the one
/// unexplained but clearly-live SSRC (single-unknown deduction). Until either happens,
/// `resolve` returns a synthetic `Unknown-<ssrc>` placeholder rather than blocking.
pub struct SsrcResolver {
    expected_users: RwLock<HashSet<Arc<str>>>,
    /// userId → displayName, seeded by `channel_context`'s expected-user roster.
    expected_display_names: RwLock<HashMap<Arc<str>, Arc<str>>>,
    /// ssrc → displayName, set by `speaking_update` (may differ from the roster's name,
    /// e.g. a nickname change).
    ssrc_display_names: RwLock<HashMap<u32, Arc<str>>>,
    ssrc_meta: RwLock<HashMap<u32, SsrcMeta>>,
    bindings: RwLock<HashMap<u32, Binding>>,
    event_bus: Arc<EventBus>,
}

impl SsrcResolver {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            expected_users: RwLock::new(HashSet::new()),
            expected_display_names: RwLock::new(HashMap::new()),
            ssrc_display_names: RwLock::new(HashMap::new()),
            ssrc_meta: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            event_bus,
        }
    }

    /// `onChannelJoined`: records the roster of users expected to speak in this channel
    /// session but not yet identified by SSRC. Replaces any previous roster — one resolver
    /// instance is scoped to one channel session.
    pub fn channel_context<I, S1, S2>(&self, expected_users: I)
    where
        I: IntoIterator<Item = (S1, S2)>,
        S1: Into<Arc<str>>,
        S2: Into<Arc<str>>,
    {
        let mut expected = self.expected_users.write();
        let mut names = self.expected_display_names.write();
        expected.clear();
        names.clear();
        for (user_id, display_name) in expected_users {
            let user_id = user_id.into();
            names.insert(user_id.clone(), display_name.into());
            expected.insert(user_id);
        }
    }

    /// `speakingUpdate`: the voice-channel collaborator's authoritative identity
    /// announcement for `ssrc`. Always wins over a prior deduction or a different prior
    /// confirmation; removes `user_id` from the expected-but-unidentified roster and drops
    /// any accumulated deduction metadata for `ssrc`, since it no longer needs either.
    pub fn speaking_update(
        &self,
        ssrc: u32,
        user_id: impl Into<Arc<str>>,
        display_name: impl Into<Arc<str>>,
    ) {
        let user_id = user_id.into();
        self.expected_users.write().remove(&user_id);
        self.ssrc_meta.write().remove(&ssrc);
        self.ssrc_display_names
            .write()
            .insert(ssrc, display_name.into());
        self.rebind(ssrc, Binding::Confirmed(user_id));
    }

    /// `registerAudioPacket`: called on every inbound PCM frame, confirmed or not, so the
    /// resolver can track which SSRCs are carrying real audio versus silence keep-alives,
    /// and attempt single-unknown deduction for any that aren't bound yet.
    pub fn register_audio_packet(&self, ssrc: u32, byte_count: usize, now: Instant) {
        let already_bound = self.bindings.read().contains_key(&ssrc);
        {
            let mut meta = self.ssrc_meta.write();
            let entry = meta.entry(ssrc).or_insert_with(|| SsrcMeta {
                first_seen: now,
                total_bytes: 0,
                audio_active: false,
            });
            entry.total_bytes = entry.total_bytes.saturating_add(byte_count as u64);
            if entry.total_bytes >= AUDIO_ACTIVE_BYTE_THRESHOLD {
                entry.audio_active = true;
            }
        }
        if !already_bound {
            self.try_deduce();
        }
    }

    /// Single-unknown deduction (§4.5 step 3): fires only when exactly one unbound SSRC is
    /// audio-active and exactly one expected user remains unidentified. Never fires from a
    /// silence-only SSRC (it never reaches `audio_active`), and never when either count is
    /// not exactly one.
    fn try_deduce(&self) {
        let candidate = {
            let meta = self.ssrc_meta.read();
            let bindings = self.bindings.read();
            let mut active_unbound = meta
                .iter()
                .filter(|(ssrc, m)| m.audio_active && !bindings.contains_key(ssrc))
                .map(|(&ssrc, _)| ssrc);
            match (active_unbound.next(), active_unbound.next()) {
                (Some(only), None) => Some(only),
                _ => None,
            }
        };
        let Some(ssrc) = candidate else { return };

        let user_id = {
            let expected = self.expected_users.read();
            let mut iter = expected.iter();
            match (iter.next(), iter.next()) {
                (Some(only), None) => Some(only.clone()),
                _ => None,
            }
        };
        let Some(user_id) = user_id else { return };

        self.expected_users.write().remove(&user_id);
        self.rebind(ssrc, Binding::Deduced(user_id));
    }

    /// Resolves `ssrc` to the best currently-known identity: a confirmed or deduced
    /// binding, or else a synthetic `Unknown-<ssrc>` placeholder. Never blocks.
    pub fn resolve(&self, ssrc: u32) -> Arc<str> {
        if let Some(binding) = self.bindings.read().get(&ssrc) {
            return binding.user_id();
        }
        Arc::from(format!("Unknown-{ssrc}"))
    }

    /// Resolves `ssrc` to a display name: the name announced for it directly, else the
    /// roster's name for its resolved user id, else the resolved id itself.
    pub fn resolve_display_name(&self, ssrc: u32) -> Arc<str> {
        if let Some(name) = self.ssrc_display_names.read().get(&ssrc) {
            return name.clone();
        }
        let user_id = self.resolve(ssrc);
        if let Some(name) = self.expected_display_names.read().get(&user_id) {
            return name.clone();
        }
        user_id
    }

    /// `onChannelLeft`: clears every piece of session state so the resolver can be reused
    /// for the next channel session without carrying stale bindings forward.
    pub fn reset(&self) {
        self.expected_users.write().clear();
        self.expected_display_names.write().clear();
        self.ssrc_display_names.write().clear();
        self.ssrc_meta.write().clear();
        self.bindings.write().clear();
    }

    /// Rebinds `ssrc` and, if the identity `resolve` would now return for it actually
    /// changed, publishes [`Event::BindingCorrected`] so the host can retroactively fix up
    /// any transcript already appended under the old identity (§7 "late identification").
    fn rebind(&self, ssrc: u32, binding: Binding) {
        let before = self.resolve(ssrc);
        self.bindings.write().insert(ssrc, binding);
        let after = self.resolve(ssrc);
        if before != after {
            self.event_bus.publish(Event::BindingCorrected {
                ssrc,
                from: before,
                to: after,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventBusConfig;

    fn resolver() -> SsrcResolver {
        SsrcResolver::new(EventBus::new(EventBusConfig::default()))
    }

    fn audio_packet(r: &SsrcResolver, ssrc: u32, bytes: usize) {
        r.register_audio_packet(ssrc, bytes, Instant::now());
    }

    #[test]
    fn unresolved_ssrc_falls_back_to_unknown_placeholder() {
        let r = resolver();
        assert_eq!(&*r.resolve(42), "Unknown-42");
    }

    #[test]
    fn speaking_update_confirms_binding() {
        let r = resolver();
        r.speaking_update(42, "alice", "Alice");
        assert_eq!(&*r.resolve(42), "alice");
        assert_eq!(&*r.resolve_display_name(42), "Alice");
    }

    #[test]
    fn single_unknown_is_deduced_from_audio_activity() {
        let r = resolver();
        r.channel_context([("bob", "Bob")]);
        audio_packet(&r, 7, 2000);
        assert_eq!(&*r.resolve(7), "bob");
    }

    #[test]
    fn silence_only_ssrc_is_never_deduced() {
        let r = resolver();
        r.channel_context([("bob", "Bob")]);
        // Below the audio-active threshold: never crosses into real audio.
        for _ in 0..5 {
            audio_packet(&r, 7, 10);
        }
        assert_eq!(&*r.resolve(7), "Unknown-7");
    }

    #[test]
    fn deduction_is_skipped_with_multiple_active_unbound_ssrcs() {
        let r = resolver();
        r.channel_context([("alice", "Alice")]);
        audio_packet(&r, 1, 2000);
        audio_packet(&r, 2, 2000);
        assert_eq!(&*r.resolve(1), "Unknown-1");
        assert_eq!(&*r.resolve(2), "Unknown-2");
    }

    #[test]
    fn deduction_is_skipped_with_multiple_expected_users() {
        let r = resolver();
        r.channel_context([("alice", "Alice"), ("bob", "Bob")]);
        audio_packet(&r, 7, 2000);
        assert_eq!(&*r.resolve(7), "Unknown-7");
    }

    #[test]
    fn a_deduced_user_is_not_deduced_onto_a_second_ssrc() {
        let r = resolver();
        r.channel_context([("bob", "Bob")]);
        audio_packet(&r, 7, 2000);
        assert_eq!(&*r.resolve(7), "bob");

        // A second SSRC now becomes the sole audio-active unbound stream, but "bob" was
        // removed from the expected set when ssrc 7 was deduced: no candidate remains, so
        // ssrc 8 must stay unresolved rather than also binding to "bob".
        audio_packet(&r, 8, 2000);
        assert_eq!(&*r.resolve(8), "Unknown-8");
    }

    #[test]
    fn explicit_speaking_update_overrides_a_deduction() {
        let r = resolver();
        r.channel_context([("bob", "Bob")]);
        audio_packet(&r, 7, 2000);
        assert_eq!(&*r.resolve(7), "bob");
        r.speaking_update(7, "carol", "Carol");
        assert_eq!(&*r.resolve(7), "carol");
    }

    #[test]
    fn deduction_emits_binding_corrected_from_the_unknown_placeholder() {
        let bus = EventBus::new(EventBusConfig::default());
        let corrected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let corrected_clone = corrected.clone();
        bus.subscribe(EventKind::BindingCorrected, move |event| {
            if let Event::BindingCorrected { ssrc, from, to } = event {
                corrected_clone.lock().push((*ssrc, from.clone(), to.clone()));
            }
        });
        let r = SsrcResolver::new(bus);
        let _ = r.resolve(7); // sanity: a placeholder exists before any binding
        r.channel_context([("bob", "Bob")]);
        audio_packet(&r, 7, 2000);

        let deadline = Instant::now() + std::time::Duration::from_secs(1);
        while corrected.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let events = corrected.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 7);
        assert_eq!(&*events[0].1, "Unknown-7");
        assert_eq!(&*events[0].2, "bob");
    }

    #[test]
    fn reannouncing_the_same_binding_is_not_a_correction() {
        let r = resolver();
        r.speaking_update(7, "bob", "Bob");
        r.speaking_update(7, "bob", "Bob");
        assert_eq!(&*r.resolve(7), "bob");
    }
}
