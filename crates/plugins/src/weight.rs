//! Quality names to sortable weights.
//!
//! `720p`, `1080p60`, `2500k`, `hd`, `720p_3d`, `720p_alt` all map to a
//! `(weight, group)` pair; the `best`/`worst` synonyms pick the extremes of
//! the weighted names, never an `_alt` fallback.

use std::sync::LazyLock;

use regex::Regex;

/// Weight lost per `_alt` level so fallbacks sort below their primary.
const ALT_WEIGHT_MOD: f64 = 0.01;

const EXTRA_WEIGHTS: &[(&str, f64, &str)] = &[
    ("live", 1080.0, "other"),
    ("hd", 1080.0, "tv"),
    ("sd", 576.0, "tv"),
    ("ehq", 720.0, "quality"),
    ("hq", 576.0, "quality"),
    ("sq", 360.0, "quality"),
];

static QUALITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)(k|p)?(\d+)?(\+)?(?:[a_](\d+)k)?(?:_(alt)(\d)?)?$")
        .expect("quality pattern is valid")
});

pub const BEST: &str = "best";
pub const WORST: &str = "worst";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamWeight {
    pub value: f64,
    pub group: &'static str,
}

impl StreamWeight {
    const NONE: StreamWeight = StreamWeight {
        value: 0.0,
        group: "none",
    };
}

pub fn stream_weight(name: &str) -> StreamWeight {
    if let Some(base) = name.strip_suffix("_3d") {
        let base = stream_weight(base);
        return if base.group == "none" {
            StreamWeight::NONE
        } else {
            StreamWeight {
                value: base.value - 1.0,
                group: "three_d",
            }
        };
    }
    if let Some(base) = name.strip_suffix("_hfr") {
        let base = stream_weight(base);
        return if base.group == "none" {
            StreamWeight::NONE
        } else {
            StreamWeight {
                value: base.value + 1.0,
                group: "hfr",
            }
        };
    }

    if let Some((_, value, group)) = EXTRA_WEIGHTS.iter().find(|(n, _, _)| *n == name) {
        return StreamWeight {
            value: *value,
            group: *group,
        };
    }

    let Some(caps) = QUALITY_RE.captures(name) else {
        return StreamWeight::NONE;
    };
    let number = |i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(0.0)
    };

    let mut value = 0.0;
    if caps.get(6).is_some() {
        value -= match caps.get(7) {
            Some(_) => ALT_WEIGHT_MOD * number(7),
            None => ALT_WEIGHT_MOD,
        };
    }

    match caps.get(2).map(|m| m.as_str()) {
        Some("k") => StreamWeight {
            value: value + number(1),
            group: "bitrate",
        },
        Some("p") => {
            value += number(1) + number(3) + number(5);
            if caps.get(4).is_some() {
                value += 1.0;
            }
            StreamWeight {
                value,
                group: "pixels",
            }
        }
        _ => StreamWeight::NONE,
    }
}

pub fn is_alt(name: &str) -> bool {
    name.contains("_alt")
}

/// Sorts `names` by ascending weight, keeping declaration order for ties.
pub fn sort_by_weight(names: &mut [String]) {
    names.sort_by(|a, b| stream_weight(a).value.total_cmp(&stream_weight(b).value));
}

/// Names eligible for `best`/`worst`, weakest first. A lone stream is always
/// eligible even without a recognised weight.
fn ranked<'a>(names: &[&'a str]) -> Vec<&'a str> {
    let single = names.len() == 1;
    let mut eligible: Vec<&str> = names
        .iter()
        .copied()
        .filter(|name| *name != BEST && *name != WORST && !is_alt(name))
        .filter(|name| single || stream_weight(name).value > 0.0)
        .collect();
    eligible.sort_by(|a, b| stream_weight(a).value.total_cmp(&stream_weight(b).value));
    eligible
}

pub fn best<'a>(names: &[&'a str]) -> Option<&'a str> {
    ranked(names).last().copied()
}

pub fn worst<'a>(names: &[&'a str]) -> Option<&'a str> {
    ranked(names).first().copied()
}

/// Resolves a comma-separated preference list such as `720p,480p,best`.
pub fn select<'a>(names: &[&'a str], preference: &str) -> Option<&'a str> {
    preference
        .split(',')
        .map(str::trim)
        .filter(|choice| !choice.is_empty())
        .find_map(|choice| match choice {
            BEST => best(names),
            WORST => worst(names),
            other => names.iter().copied().find(|name| *name == other),
        })
}
