use std::{
    collections::BTreeMap,
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use lazy_static::lazy_static;

pub type StatsNode = Arc<Mutex<Stats>>;

lazy_static! {
    static ref ROOT_STATS: StatsNode = Arc::new(Mutex::new(Stats::new(1)));
}

/// A node in the hierarchical timing tree.
pub struct Stats {
    /// The hierarchical depth of the stats node
    depth: usize,

    /// The node specific timings in nanoseconds
    timings_ns: u128,

    /// The named counters of the node, e.g., the number of visited nodes.
    counters: BTreeMap<String, u64>,

    /// Further children timings
    children: BTreeMap<String, StatsNode>,
}

/// Guard that adds the elapsed time since its creation to the stats node when dropped.
pub struct TimeRecording {
    dst_node: StatsNode,
    t0: Instant,
}

pub trait StatsNodeTrait {
    fn register_timing(&self) -> TimeRecording;

    fn get_child(&self, name: &str) -> StatsNode;

    fn add_count(&self, name: &str, value: u64);
}

impl TimeRecording {
    pub fn new(dst_node: StatsNode) -> Self {
        let t0 = Instant::now();

        Self { dst_node, t0 }
    }
}

impl Drop for TimeRecording {
    #[inline]
    fn drop(&mut self) {
        let ns = self.t0.elapsed().as_nanos();
        lock(&self.dst_node).timings_ns += ns;
    }
}

impl Stats {
    /// Returns the root stats node
    #[inline]
    pub fn root() -> StatsNode {
        ROOT_STATS.clone()
    }

    /// Returns a new stats tree that is not connected to the global root.
    pub fn detached() -> StatsNode {
        Arc::new(Mutex::new(Stats::new(1)))
    }

    /// Returns a children time node for the given identifier.
    ///
    /// # Arguments
    /// * `name` - The name of the children time.
    #[inline]
    pub fn get_child(&mut self, name: String) -> StatsNode {
        let depth = self.depth + 1;
        let node = self
            .children
            .entry(name)
            .or_insert_with(|| Arc::new(Mutex::new(Stats::new(depth))));

        node.clone()
    }

    /// Returns the elapsed time of the node in nano-seconds
    #[inline]
    pub fn as_nanos(&self) -> u128 {
        self.timings_ns
    }

    /// Returns the elapsed time of the node in milli-seconds
    #[inline]
    pub fn as_millis(&self) -> u128 {
        self.timings_ns / 1000000u128
    }

    /// Returns the value of the given counter or 0 if it has never been set.
    #[inline]
    pub fn count(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Internal function for creating a new time node.
    fn new(depth: usize) -> Self {
        Self {
            depth,
            timings_ns: 0u128,
            counters: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }
}

/// Locks the given node. A poisoned node still holds valid timings, so the poison is ignored.
#[inline]
fn lock(node: &StatsNode) -> MutexGuard<'_, Stats> {
    node.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.children.is_empty() && self.counters.is_empty() {
            return writeln!(f, "{} ms,", self.as_millis());
        }

        if self.timings_ns == 0u128 {
            writeln!(f, "{{")?;
        } else {
            writeln!(f, "{} ms {{", self.as_millis())?;
        }

        for (name, value) in self.counters.iter() {
            write!(f, "{:indent$}", "", indent = self.depth * 2)?;
            writeln!(f, "#{}: {},", name, value)?;
        }

        for (name, child) in self.children.iter() {
            write!(f, "{:indent$}", "", indent = self.depth * 2)?;
            write!(f, "{}: ", name)?;
            lock(child).fmt(f)?;
        }

        writeln!(f, "}},")
    }
}

impl StatsNodeTrait for StatsNode {
    #[inline]
    fn register_timing(&self) -> TimeRecording {
        TimeRecording::new(self.clone())
    }

    #[inline]
    fn get_child(&self, name: &str) -> StatsNode {
        lock(self).get_child(name.to_owned())
    }

    #[inline]
    fn add_count(&self, name: &str, value: u64) {
        *lock(self).counters.entry(name.to_owned()).or_insert(0) += value;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_children_and_counters() {
        let s = Stats::detached();

        {
            let _t = s.get_child("build").register_timing();
        }

        s.get_child("query").add_count("visited", 3);
        s.get_child("query").add_count("visited", 4);

        let query = s.get_child("query");
        assert_eq!(lock(&query).count("visited"), 7);
        assert_eq!(lock(&query).count("unknown"), 0);

        let text = format!("{}", lock(&s));
        assert!(text.contains("build: "));
        assert!(text.contains("#visited: 7"));
    }
}
