use rustc_hash::FxHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

type NodeIdx = usize;

struct Node<V> {
    key: String,
    value: V,
    prev: Option<NodeIdx>,
    next: Option<NodeIdx>,
}

struct ShardInner<V> {
    nodes: Vec<Option<Node<V>>>,
    index: HashMap<String, NodeIdx>,
    head: Option<NodeIdx>, // most recently used
    tail: Option<NodeIdx>, // least recently used
    free: Vec<NodeIdx>,
    capacity: usize,
}

impl<V> ShardInner<V> {
    fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            free: Vec::new(),
            capacity,
        }
    }

    fn detach(&mut self, idx: NodeIdx) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: NodeIdx) {
        let old_head = self.head;
        {
            let node = self.nodes[idx].as_mut().unwrap();
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.nodes[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn evict_lru(&mut self) {
        if let Some(tail) = self.tail {
            self.detach(tail);
            let node = self.nodes[tail].take().unwrap();
            self.index.remove(&node.key);
            self.free.push(tail);
        }
    }

    fn alloc(&mut self, key: String, value: V) -> NodeIdx {
        let node = Node {
            key,
            value,
            prev: None,
            next: None,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn get(&mut self, key: &str) -> Option<&V>
    where
        V: Clone,
    {
        let idx = *self.index.get(key)?;
        self.detach(idx);
        self.push_front(idx);
        self.nodes[idx].as_ref().map(|n| &n.value)
    }

    fn insert(&mut self, key: String, value: V) {
        if let Some(&idx) = self.index.get(&key) {
            self.detach(idx);
            self.nodes[idx].as_mut().unwrap().value = value;
            self.push_front(idx);
            return;
        }
        while self.index.len() >= self.capacity {
            self.evict_lru();
        }
        let idx = self.alloc(key.clone(), value);
        self.index.insert(key, idx);
        self.push_front(idx);
    }

    fn clean<F: Fn(&V) -> bool>(&mut self, predicate: &F) -> usize {
        let mut removed = 0;
        let mut cur = self.head;
        let mut to_remove = Vec::new();
        while let Some(idx) = cur {
            let node = self.nodes[idx].as_ref().unwrap();
            if predicate(&node.value) {
                to_remove.push(idx);
            }
            cur = node.next;
        }
        for idx in to_remove {
            self.detach(idx);
            let node = self.nodes[idx].take().unwrap();
            self.index.remove(&node.key);
            self.free.push(idx);
            removed += 1;
        }
        removed
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// Fixed-shard concurrent LRU. Each shard owns an independent
/// mutex-guarded doubly-linked list + hashmap; shard selection is a hash of
/// the key modulo the shard count.
pub struct ShardedLru<V> {
    shards: Vec<Mutex<ShardInner<V>>>,
    shard_count: usize,
}

impl<V: Clone> ShardedLru<V> {
    pub fn new(total_capacity: usize, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard = (total_capacity / shard_count).max(4);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(ShardInner::new(per_shard)))
            .collect();
        Self {
            shards,
            shard_count,
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<ShardInner<V>> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shard_count;
        &self.shards[idx]
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.shard_for(key).lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: String, value: V) {
        let shard = self.shard_for(&key);
        shard.lock().unwrap().insert(key, value);
    }

    /// Removes every entry matching `predicate`, returning the total count
    /// removed across all shards.
    pub fn clean<F: Fn(&V) -> bool>(&self, predicate: F) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().clean(&predicate))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_round_trip() {
        let lru: ShardedLru<u32> = ShardedLru::new(64, 4);
        lru.insert("a".to_string(), 1);
        lru.insert("b".to_string(), 2);
        assert_eq!(lru.get("a"), Some(1));
        assert_eq!(lru.get("missing"), None);
    }

    #[test]
    fn evicts_least_recently_used_per_shard() {
        // Single shard so eviction order is deterministic.
        let lru: ShardedLru<u32> = ShardedLru::new(4, 1);
        lru.insert("a".into(), 1);
        lru.insert("b".into(), 2);
        lru.insert("c".into(), 3);
        lru.insert("d".into(), 4);
        // touch "a" so it becomes MRU, "b" remains LRU
        assert_eq!(lru.get("a"), Some(1));
        lru.insert("e".into(), 5); // forces an eviction
        assert_eq!(lru.get("b"), None);
        assert_eq!(lru.get("a"), Some(1));
        assert_eq!(lru.get("e"), Some(5));
    }

    #[test]
    fn clean_removes_matching_entries() {
        let lru: ShardedLru<u32> = ShardedLru::new(64, 4);
        for i in 0..10u32 {
            lru.insert(format!("k{i}"), i);
        }
        let removed = lru.clean(|v| v % 2 == 0);
        assert_eq!(removed, 5);
        assert_eq!(lru.len(), 5);
    }
}
