//! Subject-filter listener registry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;

use crate::handle::HeraldHandle;
use crate::message::MessageReceived;

/// Something that wants to be called back when a subject it subscribed to
/// is received.
pub trait MessageListener: Send + Sync {
    fn herald_message(&self, herald: &HeraldHandle, message: &MessageReceived);
}

/// Opaque handle returned by [`ListenerRegistry::bind`], used to `update`
/// or `unbind` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Converts an `fnmatch`-style glob (`*`, `?`, `[...]`) into an anchored,
/// case-insensitive regular expression, the way the source's
/// `fnmatch.translate` + `re.IGNORECASE` combination behaves.
fn translate_glob(pattern: &str) -> String {
    let mut out = String::from("(?i)^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('!')) {
                    chars.next();
                    out.push('^');
                }
                for c in chars.by_ref() {
                    out.push(c);
                    if c == ']' {
                        break;
                    }
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

fn compile_pattern(pattern: &str) -> Regex {
    Regex::new(&translate_glob(pattern))
        .unwrap_or_else(|err| panic!("invalid subject filter {pattern:?}: {err}"))
}

struct PatternEntry {
    regex: Regex,
    subscribers: HashSet<ListenerId>,
}

/// Maps subject glob patterns to subscribers. All mutations hold a
/// registry-wide lock; `matches` takes a snapshot under the same lock so it
/// never observes a half-applied update.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: HashMap<ListenerId, Arc<dyn MessageListener>>,
    filters: HashMap<ListenerId, HashSet<String>>,
    patterns: HashMap<String, PatternEntry>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        ListenerRegistry::default()
    }

    /// Registers `listener` for the given glob filters.
    pub fn bind(&self, filters: HashSet<String>, listener: Arc<dyn MessageListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.write();
        for pattern in &filters {
            inner
                .patterns
                .entry(pattern.clone())
                .or_insert_with(|| PatternEntry {
                    regex: compile_pattern(pattern),
                    subscribers: HashSet::new(),
                })
                .subscribers
                .insert(id);
        }
        inner.subscribers.insert(id, listener);
        inner.filters.insert(id, filters);
        id
    }

    /// Diffs `new_filters` against the filters currently bound to `id` and
    /// applies only the difference.
    pub fn update(&self, id: ListenerId, new_filters: HashSet<String>) {
        let mut inner = self.inner.write();
        let old_filters = inner.filters.get(&id).cloned().unwrap_or_default();

        let added: Vec<String> = new_filters.difference(&old_filters).cloned().collect();
        let removed: Vec<String> = old_filters.difference(&new_filters).cloned().collect();

        for pattern in added {
            inner
                .patterns
                .entry(pattern.clone())
                .or_insert_with(|| PatternEntry {
                    regex: compile_pattern(&pattern),
                    subscribers: HashSet::new(),
                })
                .subscribers
                .insert(id);
        }
        for pattern in removed {
            if let Some(entry) = inner.patterns.get_mut(&pattern) {
                entry.subscribers.remove(&id);
                if entry.subscribers.is_empty() {
                    inner.patterns.remove(&pattern);
                }
            }
        }
        inner.filters.insert(id, new_filters);
    }

    pub fn unbind(&self, id: ListenerId) {
        let mut inner = self.inner.write();
        if let Some(filters) = inner.filters.remove(&id) {
            for pattern in filters {
                if let Some(entry) = inner.patterns.get_mut(&pattern) {
                    entry.subscribers.remove(&id);
                    if entry.subscribers.is_empty() {
                        inner.patterns.remove(&pattern);
                    }
                }
            }
        }
        inner.subscribers.remove(&id);
    }

    /// Union of every subscriber whose pattern matches `subject`. No
    /// ordering guarantee is given across subscribers.
    pub fn matches(&self, subject: &str) -> Vec<Arc<dyn MessageListener>> {
        let inner = self.inner.read();
        let mut ids = HashSet::new();
        for entry in inner.patterns.values() {
            if entry.regex.is_match(subject) {
                ids.extend(entry.subscribers.iter().copied());
            }
        }
        ids.into_iter()
            .filter_map(|id| inner.subscribers.get(&id).cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().subscribers.is_empty()
    }
}
