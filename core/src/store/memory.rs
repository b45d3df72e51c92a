use super::{Command, KvStore, Reply, Script, StoreResult, Transaction};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Member scores plus an ordered view; iterating `order` ascending yields
/// descending score, ties by descending member.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(Reverse<Score>, Reverse<String>)>,
}

impl SortedSet {
    /// Sets a member's score, returning the one it replaced.
    fn insert(&mut self, member: &str, score: f64) -> Option<f64> {
        let prior = self.scores.insert(member.to_owned(), score);
        if let Some(old) = prior {
            self.order.remove(&(Reverse(Score(old)), Reverse(member.to_owned())));
        }
        self.order.insert((Reverse(Score(score)), Reverse(member.to_owned())));
        prior
    }

    fn remove(&mut self, member: &str) -> Option<f64> {
        let prior = self.scores.remove(member)?;
        self.order.remove(&(Reverse(Score(prior)), Reverse(member.to_owned())));
        Some(prior)
    }

    fn rev_range(&self, start: usize, limit: Option<usize>) -> Vec<(String, f64)> {
        let iter = self
            .order
            .iter()
            .skip(start)
            .map(|(Reverse(Score(score)), Reverse(member))| (member.clone(), *score));
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }
}

/// List whose items carry stable sequence numbers: `items[i]` is `head + i`.
/// Pushing to the front moves `head` down, so a pop never renumbers the rest.
#[derive(Debug, Default)]
struct List {
    items: VecDeque<String>,
    head: i64,
}

impl List {
    fn push_front(&mut self, value: String) -> i64 {
        self.head -= 1;
        self.items.push_front(value);
        self.head
    }

    fn pop_front(&mut self) {
        if self.items.pop_front().is_some() {
            self.head += 1;
        }
    }

    fn pop_back(&mut self) -> Option<(i64, String)> {
        let value = self.items.pop_back()?;
        Some((self.head + self.items.len() as i64, value))
    }

    fn get(&self, seq: i64) -> Option<&String> {
        let offset = usize::try_from(seq.checked_sub(self.head)?).ok()?;
        self.items.get(offset)
    }

    fn with_seq(&self) -> impl Iterator<Item = (i64, &String)> {
        (self.head..).zip(self.items.iter())
    }
}

#[derive(Debug)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    ZSet(SortedSet),
    List(List),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::ZSet(_) => "zset",
            Value::List(_) => "list",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::ZSet(z) => z.scores.is_empty(),
            Value::List(l) => l.items.is_empty(),
        }
    }
}

fn wrong_type(key: &str, found: &Value) -> StoreError {
    StoreError::WrongType { key: key.to_owned(), found: found.kind() }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Value>,
    /// Expiry deadline per key, unix milliseconds.
    expiry: HashMap<String, i64>,
    deadlines: BTreeSet<(i64, String)>,
}

impl Keyspace {
    // Collections that drop to zero members disappear, as in Redis.
    fn prune_empty(&mut self, key: &str) -> bool {
        if self.entries.get(key).map_or(false, Value::is_empty) {
            self.entries.remove(key);
            return true;
        }
        false
    }

    /// Replaces a key's deadline, returning the previous one.
    fn set_expiry(&mut self, key: &str, at: Option<i64>) -> Option<i64> {
        let prior = match at {
            Some(at) => self.expiry.insert(key.to_owned(), at),
            None => self.expiry.remove(key),
        };
        if let Some(old) = prior {
            self.deadlines.remove(&(old, key.to_owned()));
        }
        if let Some(at) = at {
            self.deadlines.insert((at, key.to_owned()));
        }
        prior
    }

    fn due(&self, now_ms: i64) -> Vec<String> {
        self.deadlines
            .iter()
            .take_while(|(at, _)| *at <= now_ms)
            .map(|(_, key)| key.clone())
            .collect()
    }

    fn hash_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, String>> {
        match self.entries.entry(key.to_owned()).or_insert_with(|| Value::Hash(HashMap::new())) {
            Value::Hash(h) => Ok(h),
            other => Err(wrong_type(key, other)),
        }
    }

    fn set_mut(&mut self, key: &str) -> StoreResult<&mut HashSet<String>> {
        match self.entries.entry(key.to_owned()).or_insert_with(|| Value::Set(HashSet::new())) {
            Value::Set(s) => Ok(s),
            other => Err(wrong_type(key, other)),
        }
    }

    fn zset_mut(&mut self, key: &str) -> StoreResult<&mut SortedSet> {
        match self.entries.entry(key.to_owned()).or_insert_with(|| Value::ZSet(SortedSet::default())) {
            Value::ZSet(z) => Ok(z),
            other => Err(wrong_type(key, other)),
        }
    }

    fn list_mut(&mut self, key: &str) -> StoreResult<&mut List> {
        match self.entries.entry(key.to_owned()).or_insert_with(|| Value::List(List::default())) {
            Value::List(l) => Ok(l),
            other => Err(wrong_type(key, other)),
        }
    }

    fn hash_ref(&self, key: &str) -> StoreResult<Option<&HashMap<String, String>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(Some(h)),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    fn zset_ref(&self, key: &str) -> StoreResult<Option<&SortedSet>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::ZSet(z)) => Ok(Some(z)),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    fn list_ref(&self, key: &str) -> StoreResult<Option<&List>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::List(l)) => Ok(Some(l)),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    fn set_ref(&self, key: &str) -> StoreResult<Option<&HashSet<String>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::Set(s)) => Ok(Some(s)),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.hash_ref(key)?.and_then(|h| h.get(field).cloned()))
    }

    fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.set_ref(key)?.map_or(false, |s| s.contains(member)))
    }

    fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut members: Vec<String> = self.set_ref(key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        Ok(self.zset_ref(key)?.and_then(|z| z.scores.get(member).copied()))
    }

    fn zcard(&self, key: &str) -> StoreResult<usize> {
        Ok(self.zset_ref(key)?.map_or(0, |z| z.scores.len()))
    }

    fn zrevrange(&self, key: &str, start: usize, limit: Option<usize>) -> StoreResult<Vec<(String, f64)>> {
        Ok(self.zset_ref(key)?.map(|z| z.rev_range(start, limit)).unwrap_or_default())
    }

    fn llen(&self, key: &str) -> StoreResult<usize> {
        Ok(self.list_ref(key)?.map_or(0, |l| l.items.len()))
    }

    fn lrange(&self, key: &str, start: usize, limit: Option<usize>) -> StoreResult<Vec<String>> {
        let Some(list) = self.list_ref(key)? else {
            return Ok(Vec::new());
        };
        let iter = list.items.iter().skip(start).cloned();
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }
}

// On-disk layout: one sled entry per string, hash field, set member,
// sorted-set member, list item and expiry, keyed `tag | key | 0x00 | sub`.
const STR: u8 = b's';
const HASH: u8 = b'h';
const SET: u8 = b'S';
const ZSET: u8 = b'z';
const LIST: u8 = b'l';
const EXPIRY: u8 = b'e';
const VALUE_TAGS: [u8; 5] = [STR, HASH, SET, ZSET, LIST];
const EMPTY: &[u8] = &[];

fn cell(tag: u8, key: &str, sub: &[u8]) -> Vec<u8> {
    let mut cell = Vec::with_capacity(key.len() + sub.len() + 2);
    cell.push(tag);
    cell.extend_from_slice(key.as_bytes());
    cell.push(0);
    cell.extend_from_slice(sub);
    cell
}

// Sign bit flipped so big-endian bytes sort like the numbers.
fn seq_bytes(seq: i64) -> [u8; 8] {
    ((seq as u64) ^ (1 << 63)).to_be_bytes()
}

fn seq_from_bytes(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
}

fn persistence_error(e: sled::Error) -> StoreError {
    StoreError::Unavailable(format!("keyspace persistence failed: {e}"))
}

fn write_value(batch: &mut sled::Batch, key: &str, value: &Value) {
    match value {
        Value::Str(s) => batch.insert(cell(STR, key, EMPTY), s.as_bytes()),
        Value::Hash(h) => {
            for (field, v) in h {
                batch.insert(cell(HASH, key, field.as_bytes()), v.as_bytes());
            }
        }
        Value::Set(s) => {
            for member in s {
                batch.insert(cell(SET, key, member.as_bytes()), EMPTY);
            }
        }
        Value::ZSet(z) => {
            for (member, score) in &z.scores {
                batch.insert(cell(ZSET, key, member.as_bytes()), &score.to_be_bytes()[..]);
            }
        }
        Value::List(l) => {
            for (seq, item) in l.with_seq() {
                batch.insert(cell(LIST, key, &seq_bytes(seq)), item.as_bytes());
            }
        }
    }
}

impl Keyspace {
    fn load(tree: &sled::Tree) -> StoreResult<Self> {
        let mut keyspace = Keyspace::default();
        for item in tree.iter() {
            let (cell, value) = item.map_err(persistence_error)?;
            keyspace.load_cell(&cell, &value)?;
        }
        Ok(keyspace)
    }

    fn load_cell(&mut self, cell: &[u8], value: &[u8]) -> StoreResult<()> {
        let corrupt =
            || StoreError::Unavailable(format!("corrupt keyspace entry {}", String::from_utf8_lossy(cell)));
        let text = |bytes: &[u8]| String::from_utf8(bytes.to_vec()).map_err(|_| corrupt());

        let (&tag, rest) = cell.split_first().ok_or_else(corrupt)?;
        let split = rest.iter().position(|b| *b == 0).ok_or_else(corrupt)?;
        let key = std::str::from_utf8(&rest[..split]).map_err(|_| corrupt())?;
        let sub = &rest[split + 1..];

        match tag {
            STR => {
                self.entries.insert(key.to_owned(), Value::Str(text(value)?));
            }
            HASH => {
                let (field, value) = (text(sub)?, text(value)?);
                self.hash_mut(key)?.insert(field, value);
            }
            SET => {
                let member = text(sub)?;
                self.set_mut(key)?.insert(member);
            }
            ZSET => {
                let member = text(sub)?;
                let raw: [u8; 8] = value.try_into().map_err(|_| corrupt())?;
                self.zset_mut(key)?.insert(&member, f64::from_be_bytes(raw));
            }
            LIST => {
                let seq = seq_from_bytes(sub).ok_or_else(corrupt)?;
                let item = text(value)?;
                let list = self.list_mut(key)?;
                if list.items.is_empty() {
                    list.head = seq;
                }
                list.items.push_back(item);
            }
            EXPIRY => {
                let raw: [u8; 8] = value.try_into().map_err(|_| corrupt())?;
                self.set_expiry(key, Some(i64::from_be_bytes(raw)));
            }
            _ => return Err(corrupt()),
        }
        Ok(())
    }
}

/// Inverse of one write. Member-level entries keep undo and persistence
/// proportional to what a transaction touched, not to the size of the values.
#[derive(Debug)]
enum Undo {
    /// SET, INCR or DEL replaced the whole value.
    Key { key: String, prior: Option<Value> },
    Expiry { key: String, prior: Option<i64> },
    Field { key: String, field: String, prior: Option<String> },
    /// Set member that was not there before.
    Member { key: String, member: String },
    Score { key: String, member: String, prior: Option<f64> },
    Pushed { key: String, seq: i64 },
    Popped { key: String, seq: i64, value: String },
}

/// Write access for one batch or script, recording an [`Undo`] per change
/// so a failed run can be reverted and a committed one mirrored to disk.
struct Journal<'a> {
    keyspace: &'a mut Keyspace,
    undo: Vec<Undo>,
    now_ms: i64,
    pushed: bool,
}

impl<'a> Journal<'a> {
    fn new(keyspace: &'a mut Keyspace, now_ms: i64) -> Self {
        Self { keyspace, undo: Vec::new(), now_ms, pushed: false }
    }

    fn clear_expiry(&mut self, key: &str) {
        if let Some(prior) = self.keyspace.set_expiry(key, None) {
            self.undo.push(Undo::Expiry { key: key.to_owned(), prior: Some(prior) });
        }
    }

    fn prune(&mut self, key: &str) {
        if self.keyspace.prune_empty(key) {
            self.clear_expiry(key);
        }
    }

    fn rollback(self) {
        let Journal { keyspace, undo, .. } = self;
        let mut touched = HashSet::new();
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Key { key, prior } => {
                    match prior {
                        Some(value) => {
                            keyspace.entries.insert(key.clone(), value);
                        }
                        None => {
                            keyspace.entries.remove(&key);
                        }
                    }
                    touched.insert(key);
                }
                Undo::Expiry { key, prior } => {
                    keyspace.set_expiry(&key, prior);
                }
                Undo::Field { key, field, prior } => {
                    if let Ok(hash) = keyspace.hash_mut(&key) {
                        match prior {
                            Some(value) => {
                                hash.insert(field, value);
                            }
                            None => {
                                hash.remove(&field);
                            }
                        }
                    }
                    touched.insert(key);
                }
                Undo::Member { key, member } => {
                    if let Ok(set) = keyspace.set_mut(&key) {
                        set.remove(&member);
                    }
                    touched.insert(key);
                }
                Undo::Score { key, member, prior } => {
                    if let Ok(zset) = keyspace.zset_mut(&key) {
                        match prior {
                            Some(score) => {
                                zset.insert(&member, score);
                            }
                            None => {
                                zset.remove(&member);
                            }
                        }
                    }
                    touched.insert(key);
                }
                Undo::Pushed { key, .. } => {
                    if let Ok(list) = keyspace.list_mut(&key) {
                        list.pop_front();
                    }
                    touched.insert(key);
                }
                Undo::Popped { key, seq, value } => {
                    if let Ok(list) = keyspace.list_mut(&key) {
                        if list.items.is_empty() {
                            list.head = seq;
                        }
                        list.items.push_back(value);
                    }
                    touched.insert(key);
                }
            }
        }
        for key in touched {
            keyspace.prune_empty(&key);
        }
    }

    /// sled writes bringing every cell this transaction touched to its
    /// committed state.
    fn batch(&self, tree: &sled::Tree) -> StoreResult<sled::Batch> {
        let ks = &*self.keyspace;
        let mut batch = sled::Batch::default();
        for entry in &self.undo {
            match entry {
                Undo::Key { key, .. } => {
                    for tag in VALUE_TAGS {
                        for item in tree.scan_prefix(cell(tag, key, EMPTY)) {
                            let (stale, _) = item.map_err(persistence_error)?;
                            batch.remove(stale);
                        }
                    }
                    if let Some(value) = ks.entries.get(key) {
                        write_value(&mut batch, key, value);
                    }
                }
                Undo::Expiry { key, .. } => {
                    let at = cell(EXPIRY, key, EMPTY);
                    match ks.expiry.get(key) {
                        Some(deadline) => batch.insert(at, &deadline.to_be_bytes()[..]),
                        None => batch.remove(at),
                    }
                }
                Undo::Field { key, field, .. } => {
                    let at = cell(HASH, key, field.as_bytes());
                    match ks.hget(key, field).ok().flatten() {
                        Some(value) => batch.insert(at, value.as_bytes()),
                        None => batch.remove(at),
                    }
                }
                Undo::Member { key, member } => {
                    let at = cell(SET, key, member.as_bytes());
                    if ks.sismember(key, member).unwrap_or(false) {
                        batch.insert(at, EMPTY);
                    } else {
                        batch.remove(at);
                    }
                }
                Undo::Score { key, member, .. } => {
                    let at = cell(ZSET, key, member.as_bytes());
                    match ks.zscore(key, member).ok().flatten() {
                        Some(score) => batch.insert(at, &score.to_be_bytes()[..]),
                        None => batch.remove(at),
                    }
                }
                Undo::Pushed { key, seq } | Undo::Popped { key, seq, .. } => {
                    let at = cell(LIST, key, &seq_bytes(*seq));
                    let item = ks.list_ref(key).ok().flatten().and_then(|l| l.get(*seq));
                    match item {
                        Some(value) => batch.insert(at, value.as_bytes()),
                        None => batch.remove(at),
                    }
                }
            }
        }
        Ok(batch)
    }
}

impl Transaction for Journal<'_> {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.keyspace.get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> StoreResult<()> {
        let prior = self.keyspace.entries.insert(key.to_owned(), Value::Str(value.to_owned()));
        self.undo.push(Undo::Key { key: key.to_owned(), prior });
        self.clear_expiry(key);
        Ok(())
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> StoreResult<i64> {
        let current = match self.keyspace.get(key)? {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| StoreError::NotANumber { key: key.to_owned() })?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::NotANumber { key: key.to_owned() })?;
        let prior = self.keyspace.entries.insert(key.to_owned(), Value::Str(next.to_string()));
        self.undo.push(Undo::Key { key: key.to_owned(), prior });
        Ok(next)
    }

    fn del(&mut self, key: &str) -> StoreResult<bool> {
        let prior = self.keyspace.entries.remove(key);
        let existed = prior.is_some();
        if existed {
            self.undo.push(Undo::Key { key: key.to_owned(), prior });
        }
        self.clear_expiry(key);
        Ok(existed)
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> StoreResult<bool> {
        if !self.keyspace.entries.contains_key(key) {
            return Ok(false);
        }
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let prior = self.keyspace.set_expiry(key, Some(self.now_ms.saturating_add(ttl_ms)));
        self.undo.push(Undo::Expiry { key: key.to_owned(), prior });
        Ok(true)
    }

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.keyspace.hget(key, field)
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let prior = self.keyspace.hash_mut(key)?.insert(field.to_owned(), value.to_owned());
        self.undo.push(Undo::Field { key: key.to_owned(), field: field.to_owned(), prior });
        Ok(())
    }

    fn sadd(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        let added = self.keyspace.set_mut(key)?.insert(member.to_owned());
        if added {
            self.undo.push(Undo::Member { key: key.to_owned(), member: member.to_owned() });
        }
        Ok(added)
    }

    fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.keyspace.sismember(key, member)
    }

    fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.keyspace.smembers(key)
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        let prior = self.keyspace.zset_mut(key)?.insert(member, score);
        self.undo.push(Undo::Score { key: key.to_owned(), member: member.to_owned(), prior });
        Ok(prior.is_none())
    }

    fn zincrby(&mut self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        let zset = self.keyspace.zset_mut(key)?;
        let prior = zset.scores.get(member).copied();
        let score = prior.unwrap_or(0.0) + delta;
        zset.insert(member, score);
        self.undo.push(Undo::Score { key: key.to_owned(), member: member.to_owned(), prior });
        Ok(score)
    }

    fn zrem(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        let removed = match self.keyspace.entries.get_mut(key) {
            None => return Ok(false),
            Some(Value::ZSet(z)) => z.remove(member),
            Some(other) => return Err(wrong_type(key, other)),
        };
        let Some(prior) = removed else {
            return Ok(false);
        };
        self.undo.push(Undo::Score { key: key.to_owned(), member: member.to_owned(), prior: Some(prior) });
        self.prune(key);
        Ok(true)
    }

    fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.keyspace.zscore(key, member)
    }

    fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.keyspace.zcard(key)
    }

    fn zrevrange(&self, key: &str, start: usize, limit: Option<usize>) -> StoreResult<Vec<(String, f64)>> {
        self.keyspace.zrevrange(key, start, limit)
    }

    fn lpush(&mut self, key: &str, value: &str) -> StoreResult<usize> {
        let list = self.keyspace.list_mut(key)?;
        let seq = list.push_front(value.to_owned());
        let len = list.items.len();
        self.undo.push(Undo::Pushed { key: key.to_owned(), seq });
        self.pushed = true;
        Ok(len)
    }

    fn rpop(&mut self, key: &str) -> StoreResult<Option<String>> {
        let popped = match self.keyspace.entries.get_mut(key) {
            None => return Ok(None),
            Some(Value::List(l)) => l.pop_back(),
            Some(other) => return Err(wrong_type(key, other)),
        };
        let Some((seq, value)) = popped else {
            return Ok(None);
        };
        self.undo.push(Undo::Popped { key: key.to_owned(), seq, value: value.clone() });
        self.prune(key);
        Ok(Some(value))
    }

    fn llen(&self, key: &str) -> StoreResult<usize> {
        self.keyspace.llen(key)
    }

    fn lrange(&self, key: &str, start: usize, limit: Option<usize>) -> StoreResult<Vec<String>> {
        self.keyspace.lrange(key, start, limit)
    }
}

/// Single-process [`KvStore`]: one lock around the keyspace, so every batch
/// and script is serialized against all other access.
///
/// A store opened with [`MemoryStore::persistent`] mirrors each committed
/// batch or script into a sled tree as one atomic sled batch and rebuilds
/// the keyspace from that tree on open.
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    list_pushed: Notify,
    clock: Arc<dyn Clock>,
    tree: Option<sled::Tree>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("persistent", &self.tree.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Volatile store whose key expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { keyspace: Mutex::default(), list_pushed: Notify::new(), clock, tree: None }
    }

    pub fn persistent(tree: sled::Tree) -> StoreResult<Self> {
        let keyspace = Keyspace::load(&tree)?;
        tracing::info!(keys = keyspace.entries.len(), "keyspace loaded");
        Ok(Self {
            keyspace: Mutex::new(keyspace),
            list_pushed: Notify::new(),
            clock: Arc::new(SystemClock),
            tree: Some(tree),
        })
    }

    /// Number of live keys.
    pub fn key_count(&self) -> StoreResult<usize> {
        self.read(|ks| Ok(ks.entries.len()))
    }

    fn now_ms(&self) -> i64 {
        (self.clock.now().unix_timestamp_nanos() / 1_000_000) as i64
    }

    fn persist(&self, journal: &Journal<'_>) -> StoreResult<()> {
        let Some(tree) = &self.tree else {
            return Ok(());
        };
        if journal.undo.is_empty() {
            return Ok(());
        }
        let batch = journal.batch(tree)?;
        tree.apply_batch(batch).map_err(persistence_error)
    }

    fn expire_due(&self, keyspace: &mut Keyspace, now_ms: i64) -> StoreResult<()> {
        let due = keyspace.due(now_ms);
        if due.is_empty() {
            return Ok(());
        }
        let mut journal = Journal::new(keyspace, now_ms);
        for key in &due {
            journal.del(key)?;
        }
        if let Err(e) = self.persist(&journal) {
            journal.rollback();
            return Err(e);
        }
        tracing::debug!(keys = due.len(), "expired keys removed");
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Keyspace) -> StoreResult<T>) -> StoreResult<T> {
        let mut keyspace = self.keyspace.lock();
        self.expire_due(&mut *keyspace, self.now_ms())?;
        f(&*keyspace)
    }

    fn atomically<T>(&self, f: impl FnOnce(&mut dyn Transaction) -> StoreResult<T>) -> StoreResult<T> {
        let (result, pushed) = {
            let mut keyspace = self.keyspace.lock();
            let now_ms = self.now_ms();
            self.expire_due(&mut *keyspace, now_ms)?;
            let mut journal = Journal::new(&mut *keyspace, now_ms);
            let result = f(&mut journal).and_then(|value| self.persist(&journal).map(|()| value));
            let pushed = journal.pushed;
            if result.is_err() {
                journal.rollback();
            }
            (result, pushed)
        };
        if result.is_ok() && pushed {
            self.list_pushed.notify_waiters();
        }
        result
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.read(|ks| ks.get(key))
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.read(|ks| ks.sismember(key, member))
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.read(|ks| ks.smembers(key))
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.read(|ks| ks.zscore(key, member))
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.read(|ks| ks.zcard(key))
    }

    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: usize,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.read(|ks| ks.zrevrange(key, start, limit))
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        self.atomically(|tx| tx.zincrby(key, member, delta))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        self.atomically(|tx| tx.zadd(key, member, score))
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.atomically(|tx| tx.lpush(key, value))
    }

    async fn llen(&self, key: &str) -> StoreResult<usize> {
        self.read(|ks| ks.llen(key))
    }

    async fn lrange(&self, key: &str, start: usize, limit: Option<usize>) -> StoreResult<Vec<String>> {
        self.read(|ks| ks.lrange(key, start, limit))
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.list_pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.atomically(|tx| tx.rpop(key))? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn exec(&self, batch: &[Command]) -> StoreResult<Vec<Reply>> {
        self.atomically(|tx| {
            let mut replies = Vec::with_capacity(batch.len());
            for command in batch {
                replies.push(command.apply(tx)?);
            }
            Ok(replies)
        })
    }

    async fn eval(&self, script: &dyn Script) -> StoreResult<Reply> {
        self.atomically(|tx| script.run(tx))
    }
}
