//! Server selection policies.
//!
//! A selector picks one key from the eligible server set. Eligibility is
//! decided before selection by [`filter_by_state_and_group`]: servers marked
//! `state=inactive` and servers outside the client's group never reach a
//! selector.
//!
//! Server metadata is a flat query string such as `state=inactive&group=g1&weight=10`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::Rng;

use crate::share::Context;

/// Server key (`network@address`) to metadata string. Ordered, so policies that
/// walk the set see the same order on every call.
pub type ServerSet = BTreeMap<String, String>;

/// Chooses one server for a call.
pub trait Selector: Send + Sync {
    /// Returns `None` when `servers` is empty.
    fn select(&self, ctx: &Context, servers: &ServerSet) -> Option<String>;
}

/// Built-in selection policies.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SelectMode {
    #[default]
    RandomSelect,
    /// Visits every server once before repeating.
    RoundRobin,
    /// Smooth weighted round robin over the `weight` metadata field.
    WeightedRoundRobin,
}

/// Creates the selector implementing `mode`.
pub fn new_selector(mode: SelectMode) -> Box<dyn Selector> {
    match mode {
        SelectMode::RandomSelect => Box::new(RandomSelector),
        SelectMode::RoundRobin => Box::new(RoundRobinSelector::default()),
        SelectMode::WeightedRoundRobin => Box::new(WeightedRoundRobinSelector::default()),
    }
}

/// Uniformly random choice.
#[derive(Default)]
pub struct RandomSelector;

impl Selector for RandomSelector {
    fn select(&self, _ctx: &Context, servers: &ServerSet) -> Option<String> {
        if servers.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..servers.len());
        servers.keys().nth(i).cloned()
    }
}

#[derive(Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl Selector for RoundRobinSelector {
    fn select(&self, _ctx: &Context, servers: &ServerSet) -> Option<String> {
        if servers.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % servers.len();
        servers.keys().nth(i).cloned()
    }
}

/// Smooth weighted round robin: over any window of `sum(weights)` picks, each
/// server is chosen `weight` times, and picks are spread rather than bunched.
#[derive(Default)]
pub struct WeightedRoundRobinSelector {
    current: Mutex<HashMap<String, i64>>,
}

impl Selector for WeightedRoundRobinSelector {
    fn select(&self, _ctx: &Context, servers: &ServerSet) -> Option<String> {
        if servers.is_empty() {
            return None;
        }
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        current.retain(|k, _| servers.contains_key(k));

        let mut total = 0_i64;
        let mut best: Option<(&String, i64)> = None;
        for (key, meta) in servers {
            let weight = server_weight(meta);
            total += weight;
            let cw = current.entry(key.clone()).or_insert(0);
            *cw += weight;
            if best.map_or(true, |(_, b)| *cw > b) {
                best = Some((key, *cw));
            }
        }

        let (key, _) = best?;
        if let Some(cw) = current.get_mut(key) {
            *cw -= total;
        }
        Some(key.clone())
    }
}

fn server_weight(meta: &str) -> i64 {
    parse_metadata(meta)
        .get("weight")
        .and_then(|w| w.parse::<i64>().ok())
        .filter(|w| *w > 0)
        .unwrap_or(1)
}

/// Removes inactive servers and, when `group` is not empty, servers of other groups.
pub fn filter_by_state_and_group(group: &str, servers: &mut ServerSet) {
    servers.retain(|_, meta| {
        let fields = parse_metadata(meta);
        if fields.get("state").map(String::as_str) == Some("inactive") {
            return false;
        }
        group.is_empty() || fields.get("group").map(String::as_str) == Some(group)
    });
}

/// Parses `k1=v1&k2=v2` metadata. Later duplicates win; malformed pairs are skipped.
pub fn parse_metadata(meta: &str) -> HashMap<String, String> {
    meta.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            Some((unescape(k)?, unescape(v)?))
        })
        .collect()
}

fn unescape(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = s.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out).ok()
}
