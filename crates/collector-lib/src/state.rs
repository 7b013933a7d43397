//! Overlapping classification of composite node states
//!
//! A Slurm node state is a composite string such as `MIXED+DRAIN` or
//! `IDLE+DRAIN+POWERED_DOWN`. Bucket membership is a set of independent
//! predicates, not an enum: a draining-and-reserved node counts in both
//! buckets, and that is operational intent. The exact precedence and the
//! DRAIN/DOWN exclusions are load-bearing; do not "deduplicate" them.

/// Transient qualifiers that carry no bucket information. Stripping them
/// before matching is the behavior of the newest collector generation and
/// is controlled by [`StateRules::strip_transient_flags`]; with the toggle
/// off, cloud-bursted nodes classify on their raw state.
pub const TRANSIENT_FLAGS: [&str; 4] = [
    "+CLOUD",
    "+NOT_RESPONDING",
    "+POWERING_UP",
    "+POWERING_DOWN",
];

/// One overlapping classification bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Idle,
    Mixed,
    Allocated,
    Planned,
    Reserved,
    Completing,
    Draining,
    Down,
    PoweredDown,
}

impl Bucket {
    pub const ALL: [Bucket; 9] = [
        Bucket::Idle,
        Bucket::Mixed,
        Bucket::Allocated,
        Bucket::Planned,
        Bucket::Reserved,
        Bucket::Completing,
        Bucket::Draining,
        Bucket::Down,
        Bucket::PoweredDown,
    ];

    /// Short field prefix used in metric names (`idletot`, `draincpu`, ...).
    pub fn prefix(self) -> &'static str {
        match self {
            Bucket::Idle => "idle",
            Bucket::Mixed => "mixed",
            Bucket::Allocated => "alloc",
            Bucket::Planned => "planned",
            Bucket::Reserved => "res",
            Bucket::Completing => "comp",
            Bucket::Draining => "drain",
            Bucket::Down => "down",
            Bucket::PoweredDown => "pwd",
        }
    }

    fn bit(self) -> u16 {
        1 << self as u16
    }
}

/// The set of buckets one state string belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketSet {
    bits: u16,
}

impl BucketSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, bucket: Bucket) {
        self.bits |= bucket.bit();
    }

    pub fn contains(&self, bucket: Bucket) -> bool {
        self.bits & bucket.bit() != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Bucket> + '_ {
        Bucket::ALL.into_iter().filter(|b| self.contains(*b))
    }
}

/// Classification rules for composite state strings.
#[derive(Debug, Clone)]
pub struct StateRules {
    /// Strip [`TRANSIENT_FLAGS`] before matching.
    pub strip_transient_flags: bool,
}

impl Default for StateRules {
    fn default() -> Self {
        Self {
            strip_transient_flags: true,
        }
    }
}

impl StateRules {
    /// Classify a composite state string into its (overlapping) buckets.
    pub fn classify(&self, raw: &str) -> BucketSet {
        let stripped;
        let state = if self.strip_transient_flags {
            let mut s = raw.to_string();
            for flag in TRANSIENT_FLAGS {
                s = s.replace(flag, "");
            }
            stripped = s;
            stripped.as_str()
        } else {
            raw
        };

        let mut set = BucketSet::empty();

        if matches!(state, "IDLE" | "IDLE+COMPLETING" | "IDLE+POWER" | "IDLE#") {
            set.insert(Bucket::Idle);
        }
        if matches!(state, "MIXED" | "MIXED+COMPLETING" | "MIXED#") {
            set.insert(Bucket::Mixed);
        }
        if matches!(state, "ALLOCATED" | "ALLOCATED+COMPLETING") {
            set.insert(Bucket::Allocated);
        }
        if matches!(state, "IDLE+PLANNED" | "MIXED+PLANNED") {
            set.insert(Bucket::Planned);
        }
        if state.contains("RESERVED") {
            set.insert(Bucket::Reserved);
        }
        if state.contains("COMPLETING") {
            set.insert(Bucket::Completing);
        }
        // The DRAIN exclusions below are exactly the DOWN inclusions: an
        // idle or down node that is draining is operationally down, not
        // "draining work away".
        if state.contains("DRAIN")
            && !matches!(state, "IDLE+DRAIN" | "DOWN+DRAIN" | "DOWN+DRAIN+POWERED_DOWN")
        {
            set.insert(Bucket::Draining);
        }
        if state.contains("DOWN") || matches!(state, "IDLE+DRAIN" | "IDLE+DRAIN+POWERED_DOWN") {
            set.insert(Bucket::Down);
        }
        if state == "IDLE+POWERED_DOWN" {
            set.insert(Bucket::PoweredDown);
        }
        set
    }
}

/// Per-token flags for the partition rollup, which looks at the `+`-split
/// tokens rather than the composite string.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenFlags {
    pub reserved: bool,
    pub down: bool,
    pub powered_down: bool,
}

/// Flag a state by its individual `+`-separated tokens: `RESERVED`,
/// `DOWN`-or-`DRAIN`, and `POWERED_DOWN`.
pub fn token_flags(raw: &str) -> TokenFlags {
    let mut flags = TokenFlags::default();
    for token in raw.split('+') {
        match token {
            "RESERVED" => flags.reserved = true,
            "DOWN" | "DRAIN" => flags.down = true,
            "POWERED_DOWN" => flags.powered_down = true,
            _ => {}
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(raw: &str) -> BucketSet {
        StateRules::default().classify(raw)
    }

    #[test]
    fn test_idle_exact_matches() {
        for s in ["IDLE", "IDLE+COMPLETING", "IDLE+POWER", "IDLE#"] {
            let set = classify(s);
            assert!(set.contains(Bucket::Idle), "{s} should be idle");
            // Idle-exact states never simultaneously classify as draining.
            assert!(!set.contains(Bucket::Draining), "{s} must not drain");
        }
    }

    #[test]
    fn test_mixed_and_allocated() {
        assert!(classify("MIXED").contains(Bucket::Mixed));
        assert!(classify("MIXED#").contains(Bucket::Mixed));
        assert!(classify("ALLOCATED+COMPLETING").contains(Bucket::Allocated));
        assert!(!classify("ALLOCATED+DRAIN").contains(Bucket::Allocated));
    }

    #[test]
    fn test_planned() {
        assert!(classify("IDLE+PLANNED").contains(Bucket::Planned));
        assert!(classify("MIXED+PLANNED").contains(Bucket::Planned));
        // Planned states are not idle/mixed-exact.
        assert!(!classify("IDLE+PLANNED").contains(Bucket::Idle));
    }

    #[test]
    fn test_reserved_overlaps() {
        let set = classify("MIXED+RESERVED+DRAIN");
        assert!(set.contains(Bucket::Reserved));
        assert!(set.contains(Bucket::Draining));
        assert!(!set.contains(Bucket::Mixed));
    }

    #[test]
    fn test_drain_exclusions_route_to_down() {
        for s in ["IDLE+DRAIN", "DOWN+DRAIN", "DOWN+DRAIN+POWERED_DOWN"] {
            let set = classify(s);
            assert!(!set.contains(Bucket::Draining), "{s} excluded from drain");
            assert!(set.contains(Bucket::Down), "{s} counts as down");
        }
        let set = classify("MIXED+DRAIN");
        assert!(set.contains(Bucket::Draining));
        assert!(!set.contains(Bucket::Down));
    }

    #[test]
    fn test_powered_down() {
        let set = classify("IDLE+POWERED_DOWN");
        assert!(set.contains(Bucket::PoweredDown));
        // POWERED_DOWN contains the substring DOWN, so it also counts down.
        assert!(set.contains(Bucket::Down));
    }

    #[test]
    fn test_completing_overlap() {
        let set = classify("MIXED+COMPLETING");
        assert!(set.contains(Bucket::Mixed));
        assert!(set.contains(Bucket::Completing));
    }

    #[test]
    fn test_transient_flag_stripping_toggle() {
        let stripping = StateRules {
            strip_transient_flags: true,
        };
        let raw = StateRules {
            strip_transient_flags: false,
        };
        // With stripping, a cloud-bursted idle node is idle.
        assert!(stripping.classify("IDLE+CLOUD").contains(Bucket::Idle));
        // Without stripping, the raw composite fails the exact match.
        assert!(!raw.classify("IDLE+CLOUD").contains(Bucket::Idle));
        // POWERING_DOWN is stripped; POWERED_DOWN is not.
        assert!(stripping.classify("IDLE+POWERING_DOWN").contains(Bucket::Idle));
        assert!(!stripping
            .classify("IDLE+POWERED_DOWN")
            .contains(Bucket::Idle));
    }

    #[test]
    fn test_token_flags() {
        let flags = token_flags("MIXED+DRAIN+RESERVED");
        assert!(flags.reserved);
        assert!(flags.down);
        assert!(!flags.powered_down);

        let flags = token_flags("IDLE+POWERED_DOWN");
        assert!(flags.powered_down);
        assert!(!flags.down);
    }
}
