use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::InvalidationScope;

const STRIPES: usize = 64;
const LOG_CAPACITY: usize = 256;

/// Scope with its glob compiled.
#[derive(Debug, Clone)]
pub(crate) enum ScopeMatcher {
    Exact(String),
    Pattern(Regex),
    Tag(String),
    Global,
}

impl ScopeMatcher {
    pub(crate) fn compile(scope: &InvalidationScope) -> Result<Self, regex::Error> {
        Ok(match scope {
            InvalidationScope::Exact(key) => Self::Exact(key.clone()),
            InvalidationScope::Pattern(glob) => Self::Pattern(glob_to_regex(glob)?),
            InvalidationScope::Table(table) => Self::Tag(format!("table:{}", table.to_lowercase())),
            InvalidationScope::Project(project) => Self::Tag(format!("project:{}", project)),
            InvalidationScope::User(user) => Self::Tag(format!("user:{}", user)),
            InvalidationScope::Tag(tag) => Self::Tag(tag.clone()),
            InvalidationScope::Global => Self::Global,
        })
    }

    pub(crate) fn matches(&self, key: &str, tags: &[String]) -> bool {
        match self {
            Self::Exact(k) => k == key,
            Self::Pattern(re) => re.is_match(key),
            Self::Tag(tag) => tags.iter().any(|t| t == tag),
            Self::Global => true,
        }
    }

    pub(crate) fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

struct Logged {
    generation: u64,
    matcher: ScopeMatcher,
    active: bool,
}

/// Orders cache reads and writes against invalidations.
///
/// Reads share a key's stripe; an exact invalidation takes that stripe and a
/// scoped one takes every stripe in ascending order. Each invalidation is
/// logged with a generation when it starts, so that:
/// - a hit whose entry predates an in-flight invalidation covering it is
///   reported as a miss,
/// - a write whose value was computed before an overlapping invalidation
///   started is dropped.
pub(crate) struct InvalidationBarrier {
    stripes: Vec<RwLock<()>>,
    generation: AtomicU64,
    log: Mutex<Log>,
}

struct Log {
    entries: VecDeque<Logged>,
    /// Generations at or below this have been dropped from the log.
    floor: u64,
}

impl InvalidationBarrier {
    pub(crate) fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| RwLock::new(())).collect(),
            generation: AtomicU64::new(0),
            log: Mutex::new(Log {
                entries: VecDeque::new(),
                floor: 0,
            }),
        }
    }

    pub(crate) fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn stripe(key: &str) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % STRIPES
    }

    pub(crate) async fn read(&self, key: &str) -> RwLockReadGuard<'_, ()> {
        self.stripes[Self::stripe(key)].read().await
    }

    pub(crate) async fn write(&self, key: &str) -> RwLockWriteGuard<'_, ()> {
        self.stripes[Self::stripe(key)].write().await
    }

    /// Every stripe, taken in ascending order.
    pub(crate) async fn write_all(&self) -> Vec<RwLockWriteGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(STRIPES);
        for stripe in &self.stripes {
            guards.push(stripe.write().await);
        }
        guards
    }

    /// Record the start of an invalidation and return its generation.
    pub(crate) fn begin(&self, matcher: ScopeMatcher) -> u64 {
        let mut log = self.log.lock();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        log.entries.push_back(Logged {
            generation,
            matcher,
            active: true,
        });
        while log.entries.len() > LOG_CAPACITY {
            match log.entries.front() {
                Some(front) if !front.active => {
                    let dropped = front.generation;
                    log.entries.pop_front();
                    log.floor = dropped;
                }
                _ => break,
            }
        }
        generation
    }

    pub(crate) fn finish(&self, generation: u64) {
        let mut log = self.log.lock();
        if let Some(entry) = log.entries.iter_mut().find(|e| e.generation == generation) {
            entry.active = false;
        }
    }

    /// Whether a value computed at `ticket` must not be written.
    pub(crate) fn is_stale(&self, ticket: u64, key: &str, tags: &[String]) -> bool {
        let log = self.log.lock();
        if ticket < log.floor {
            return true;
        }
        log.entries
            .iter()
            .any(|e| e.generation > ticket && e.matcher.matches(key, tags))
    }

    /// Whether an in-flight invalidation covers an entry written at `generation`.
    pub(crate) fn is_hidden(&self, generation: u64, key: &str, tags: &[String]) -> bool {
        let log = self.log.lock();
        log.entries
            .iter()
            .any(|e| e.active && e.generation > generation && e.matcher.matches(key, tags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_matching() {
        let m = ScopeMatcher::compile(&InvalidationScope::Pattern("query:*:users?".into())).unwrap();
        assert!(m.matches("query:abc:users1", &[]));
        assert!(!m.matches("query:abc:users", &[]));
        assert!(!m.matches("other:abc:users1", &[]));

        let dots = ScopeMatcher::compile(&InvalidationScope::Pattern("a.b*".into())).unwrap();
        assert!(dots.matches("a.bc", &[]));
        assert!(!dots.matches("axbc", &[]));
    }

    #[test]
    fn test_stale_and_hidden() {
        let barrier = InvalidationBarrier::new();
        let ticket = barrier.current();
        let tags = vec!["table:orders".to_string()];

        let generation =
            barrier.begin(ScopeMatcher::compile(&InvalidationScope::Table("orders".into())).unwrap());
        assert!(barrier.is_stale(ticket, "k", &tags));
        assert!(!barrier.is_stale(ticket, "k", &["table:users".to_string()]));
        assert!(barrier.is_hidden(ticket, "k", &tags));

        barrier.finish(generation);
        assert!(!barrier.is_hidden(ticket, "k", &tags));
        // Still stale: the value was computed before the invalidation.
        assert!(barrier.is_stale(ticket, "k", &tags));
        assert!(!barrier.is_stale(barrier.current(), "k", &tags));
    }
}
