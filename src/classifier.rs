//! # Classifier: Ordered Rule Table for Raw Log Lines
//!
//! Turns one raw line into zero or one [`DomainEvent`]. Rules are evaluated in
//! the order they appear in [`RULES`]; the first rule whose pattern matches and
//! whose extractor succeeds wins. More specific shapes come first:
//!
//! | # | Rule | Produces |
//! |---|------|----------|
//! | 1 | `suicide` | ignored |
//! | 2 | `connection_identity_ip` | `Connection` with identity |
//! | 3 | `connection_ip` | `Connection` |
//! | 4 | `connection_legacy_ip` | `Connection` |
//! | 5 | `connection_from` | `Connection` |
//! | 6 | `pvp_kill_adm` | `Kill` |
//! | 7 | `pvp_kill` | `Kill` |
//! | 8 | `death_animal` | `Death` (animal) |
//! | 9 | `death_environment` | `Death` (environment) |
//! | 10 | `placement_pos` | `Placement` |
//! | 11 | `placement_at` | `Placement` |
//! | 12 | `build_action` | `Placement`, or ignored for dismantling |
//! | 13 | `zombie_kill` | `ZombieKill` |
//! | 14 | `fish_caught` | `FishCaught` |
//!
//! Adding a log format means adding one entry to the table; the worker loop
//! and the dispatcher never change. [`rule_names`] exposes the order so tests
//! can pin it.
//!
//! Player-vs-player kill lines are parsed defensively: both names are
//! required, weapon, distance and position are only taken when present.

use crate::events::{nearest_location, DeathCauseKind, DomainEvent, Position};
use regex::{Captures, Regex};
use std::collections::BTreeMap;

/// Numeric coordinate triple inside `<...>`, captured as `x`, `y`, `z`.
const VEC3: &str = r"(?P<x>-?\d+(?:\.\d+)?),\s*(?P<y>-?\d+(?:\.\d+)?),\s*(?P<z>-?\d+(?:\.\d+)?)";

/// Result of a single rule applied to a line.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Event(DomainEvent),
    /// Recognised but deliberately dropped (suicides, dismantling).
    Ignored,
}

/// Outcome of classifying one line, carrying the rule that decided it.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Event {
        rule: &'static str,
        event: DomainEvent,
    },
    Ignored {
        rule: &'static str,
    },
    Unmatched,
}

type Extractor = fn(&Captures<'_>, &str) -> Option<RuleOutcome>;

struct Rule {
    name: &'static str,
    pattern: Regex,
    extract: Extractor,
}

impl Rule {
    fn new(name: &'static str, pattern: &str, extract: Extractor) -> Self {
        Rule {
            name,
            pattern: Regex::new(pattern).expect("invalid classifier pattern"),
            extract,
        }
    }
}

static RULES: std::sync::LazyLock<Vec<Rule>> = std::sync::LazyLock::new(|| {
    vec![
        Rule::new("suicide", r"(?i)\bcommitted suicide\b", |_, _| {
            Some(RuleOutcome::Ignored)
        }),
        Rule::new(
            "connection_identity_ip",
            r#"Player "(?P<name>[^"]+)".*\bid=(?P<id>[^\s,)]+).*\bip=(?P<ip>\d{1,3}(?:\.\d{1,3}){3})"#,
            |c, _| connection(c, true),
        ),
        Rule::new(
            "connection_ip",
            r#"Player "(?P<name>[^"]+)".*\bip=(?P<ip>\d{1,3}(?:\.\d{1,3}){3})"#,
            |c, _| connection(c, false),
        ),
        Rule::new(
            "connection_legacy_ip",
            r"Connected:\s*(?P<name>[^|]+?)\s*\|\s*IP:\s*(?P<ip>\d{1,3}(?:\.\d{1,3}){3})",
            |c, _| connection(c, false),
        ),
        Rule::new(
            "connection_from",
            r"\]\s*(?P<name>\S+)\s+connected from\s+(?P<ip>\d{1,3}(?:\.\d{1,3}){3})",
            |c, _| connection(c, false),
        ),
        Rule::new(
            "pvp_kill_adm",
            r#"PlayerKill:\s*Killer="(?P<killer>[^"]+)".*Victim="(?P<victim>[^"]+)""#,
            pvp_kill_adm,
        ),
        Rule::new(
            "pvp_kill",
            r#"Player "(?P<victim>[^"]+)".*?killed by Player "(?P<killer>[^"]+)""#,
            pvp_kill,
        ),
        Rule::new(
            "death_animal",
            &format!(
                r#"Player "(?P<victim>[^"]+)".*pos=<{VEC3}>.*killed by (?P<cause>(?i:wolf|bear))\b"#
            ),
            |c, _| death(c, DeathCauseKind::Animal),
        ),
        Rule::new(
            "death_environment",
            &format!(
                r#"Player "(?P<victim>[^"]+)".*pos=<{VEC3}>.*?\b(?P<cause>died|bled out|drowned|froze|starved|fell|killed by [A-Za-z_]+)"#
            ),
            |c, _| death(c, DeathCauseKind::Environment),
        ),
        Rule::new(
            "placement_pos",
            &format!(r#"Player "(?P<player>[^"]+)".*pos=<{VEC3}>.*\bplaced (?P<item>.+)"#),
            placement,
        ),
        Rule::new(
            "placement_at",
            &format!(
                r#"Player "(?P<player>[^"]+)".*\bplaced "?(?P<item>[^"<\[]+?)"? at [<\[]{VEC3}[>\]]"#
            ),
            placement,
        ),
        Rule::new(
            "build_action",
            &format!(
                r#"Player "(?P<player>[^"]+)".*pos=<{VEC3}>.*\b(?P<action>built|dismantled) (?P<item>.+?) with "#
            ),
            build_action,
        ),
        Rule::new(
            "zombie_kill",
            r#"Player "(?P<player>[^"]+)".*\bkilled\s+(?:an?\s+)?(?i:zombie|infected)"#,
            |c, _| {
                Some(RuleOutcome::Event(DomainEvent::ZombieKill {
                    gamertag: name(c, "player")?,
                }))
            },
        ),
        Rule::new(
            "fish_caught",
            r#"Player "(?P<player>[^"]+)".*\bcaught\s+(?:an?\s+)?(?P<species>[A-Za-z0-9_]+)"#,
            |c, _| {
                Some(RuleOutcome::Event(DomainEvent::FishCaught {
                    gamertag: name(c, "player")?,
                    species: c.name("species")?.as_str().to_string(),
                }))
            },
        ),
    ]
});

static WEAPON_ADM: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"Weapon=(?P<w>[^,]+)").expect("invalid weapon pattern"));
static DISTANCE_ADM: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"Distance=(?P<d>\d+(?:\.\d+)?)").expect("invalid distance pattern")
});
static POS_ADM: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(&format!(r"Pos=<{VEC3}>")).expect("invalid position pattern")
});
static WEAPON_WITH: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"\bwith (?P<w>.+?)(?: from \d|\s*$)").expect("invalid weapon pattern")
});
static DISTANCE_FROM: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"\bfrom (?P<d>\d+(?:\.\d+)?) ?m(?:eters)?\b").expect("invalid distance pattern")
});
static VECTORS: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(&format!(r"<{VEC3}>")).expect("invalid vector pattern")
});

fn name(c: &Captures<'_>, group: &str) -> Option<String> {
    let value = c.name(group)?.as_str().trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn vec3(c: &Captures<'_>) -> Option<Position> {
    let x = c.name("x")?.as_str().parse().ok()?;
    let y = c.name("y")?.as_str().parse().ok()?;
    let z = c.name("z")?.as_str().parse().ok()?;
    Some(Position::new(x, y, z))
}

fn connection(c: &Captures<'_>, with_identity: bool) -> Option<RuleOutcome> {
    let identity = if with_identity {
        Some(c.name("id")?.as_str().to_string())
    } else {
        None
    };
    Some(RuleOutcome::Event(DomainEvent::Connection {
        gamertag: name(c, "name")?,
        ip: c.name("ip")?.as_str().to_string(),
        identity,
    }))
}

fn kill_event(
    killer: String,
    victim: String,
    weapon: Option<String>,
    distance: f64,
    position: Option<Position>,
) -> RuleOutcome {
    RuleOutcome::Event(DomainEvent::Kill {
        killer,
        victim,
        weapon: weapon.unwrap_or_else(|| "unknown".to_string()),
        distance,
        location: position.map(|p| nearest_location(p.x, p.z)),
        position,
    })
}

fn pvp_kill_adm(c: &Captures<'_>, line: &str) -> Option<RuleOutcome> {
    let weapon = WEAPON_ADM
        .captures(line)
        .map(|w| w["w"].trim().to_string())
        .filter(|w| !w.is_empty());
    let distance = DISTANCE_ADM
        .captures(line)
        .and_then(|d| d["d"].parse().ok())
        .unwrap_or(0.0);
    let position = POS_ADM.captures(line).and_then(|p| vec3(&p));
    Some(kill_event(
        name(c, "killer")?,
        name(c, "victim")?,
        weapon,
        distance,
        position,
    ))
}

fn pvp_kill(c: &Captures<'_>, line: &str) -> Option<RuleOutcome> {
    let weapon = WEAPON_WITH
        .captures(line)
        .map(|w| w["w"].trim().to_string())
        .filter(|w| !w.is_empty());
    let vectors: Vec<Position> = VECTORS
        .captures_iter(line)
        .filter_map(|v| vec3(&v))
        .collect();
    let distance = DISTANCE_FROM
        .captures(line)
        .and_then(|d| d["d"].parse().ok())
        .or_else(|| match vectors.as_slice() {
            [victim, killer, ..] => Some(victim.distance_to(killer)),
            _ => None,
        })
        .unwrap_or(0.0);
    // the first vector belongs to the victim
    let position = vectors.first().copied();
    Some(kill_event(
        name(c, "killer")?,
        name(c, "victim")?,
        weapon,
        distance,
        position,
    ))
}

fn death(c: &Captures<'_>, cause_kind: DeathCauseKind) -> Option<RuleOutcome> {
    let position = vec3(c)?;
    let raw = c.name("cause")?.as_str().to_lowercase();
    let cause = raw.strip_prefix("killed by ").unwrap_or(&raw).to_string();
    Some(RuleOutcome::Event(DomainEvent::Death {
        victim: name(c, "victim")?,
        cause,
        cause_kind,
        location: nearest_location(position.x, position.z),
        position,
    }))
}

fn placement(c: &Captures<'_>, _line: &str) -> Option<RuleOutcome> {
    let position = vec3(c)?;
    let structure = c
        .name("item")?
        .as_str()
        .trim()
        .trim_matches('"')
        .trim()
        .to_string();
    if structure.is_empty() {
        return None;
    }
    Some(RuleOutcome::Event(DomainEvent::Placement {
        gamertag: name(c, "player")?,
        structure,
        location: nearest_location(position.x, position.z),
        position,
    }))
}

fn build_action(c: &Captures<'_>, line: &str) -> Option<RuleOutcome> {
    match c.name("action")?.as_str() {
        "built" => placement(c, line),
        _ => Some(RuleOutcome::Ignored),
    }
}

/// Rule names in evaluation order.
pub fn rule_names() -> Vec<&'static str> {
    RULES.iter().map(|r| r.name).collect()
}

/// Classify one line, reporting which rule decided it.
pub fn classify_detailed(line: &str) -> Classification {
    let line = line.trim_end_matches(['\r', '\n']);
    for rule in RULES.iter() {
        let Some(caps) = rule.pattern.captures(line) else {
            continue;
        };
        match (rule.extract)(&caps, line) {
            Some(RuleOutcome::Event(event)) => {
                return Classification::Event {
                    rule: rule.name,
                    event,
                }
            }
            Some(RuleOutcome::Ignored) => return Classification::Ignored { rule: rule.name },
            // pattern matched but fields were unusable; let later rules try
            None => continue,
        }
    }
    Classification::Unmatched
}

/// Classify one line into at most one event.
pub fn classify(line: &str) -> Option<DomainEvent> {
    match classify_detailed(line) {
        Classification::Event { event, .. } => Some(event),
        _ => None,
    }
}

/// Per-rule counters for one batch of lines.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize)]
pub struct ClassifyStats {
    pub matched: BTreeMap<&'static str, u64>,
    pub ignored: u64,
    pub unmatched: u64,
}

impl ClassifyStats {
    pub fn record(&mut self, classification: &Classification) {
        match classification {
            Classification::Event { rule, .. } => *self.matched.entry(*rule).or_default() += 1,
            Classification::Ignored { .. } => self.ignored += 1,
            Classification::Unmatched => self.unmatched += 1,
        }
    }

    pub fn events(&self) -> u64 {
        self.matched.values().sum()
    }
}

/// Classify a run of lines, keeping the offset of every produced event.
///
/// `first_offset` is the stream offset of `lines[0]`.
pub fn classify_lines<S: AsRef<str>>(
    lines: &[S],
    first_offset: i64,
) -> (Vec<(i64, DomainEvent)>, ClassifyStats) {
    let mut stats = ClassifyStats::default();
    let mut events = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let classification = classify_detailed(line.as_ref());
        stats.record(&classification);
        if let Classification::Event { event, .. } = classification {
            events.push((first_offset + i as i64, event));
        }
    }
    (events, stats)
}
