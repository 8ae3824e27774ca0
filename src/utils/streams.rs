// src/utils/streams.rs
//! Typed channels carrying tuples between stages, and the operators that reshape them.
//!
//! A [`Channel`] is the receiving end of a bounded tokio mpsc queue. Every operator
//! consumes its input channel, spawns one task that drains it, and hands back a new
//! channel. A channel is closed when every [`Emitter`] feeding it is dropped; that
//! close signal is what aggregating operators (`collect`, `first`, `if_empty`) wait on.
//!
//! Operators must be called from inside a tokio runtime.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;

use fxhash::{FxHashMap, FxHashSet};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::defs::DEFAULT_CHANNEL_CAPACITY;

/// Producer handle of a channel. Cloning adds a producer; the channel closes after the last drop.
#[derive(Debug)]
pub struct Emitter<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Emitter { tx: self.tx.clone() }
    }
}

impl<T: Send> Emitter<T> {
    /// Sends one tuple. Returns false once the consumer is gone; producers keep
    /// running regardless since a dropped consumer just means nobody wants the data.
    pub async fn emit(&self, item: T) -> bool {
        self.tx.send(item).await.is_ok()
    }
}

#[derive(Debug)]
pub struct Channel<T> {
    rx: mpsc::Receiver<T>,
}

pub fn channel<T>(capacity: usize) -> (Emitter<T>, Channel<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Emitter { tx }, Channel { rx })
}

impl<T: Send + 'static> Channel<T> {
    /// Channel that yields `items` in order, then closes.
    pub fn of(items: Vec<T>) -> Self {
        let (tx, out) = channel(items.len().max(1));
        tokio::spawn(async move {
            for item in items {
                if !tx.emit(item).await {
                    break;
                }
            }
        });
        out
    }

    /// Already-closed channel. This is what an inactive stage hands downstream.
    pub fn empty() -> Self {
        let (_tx, out) = channel(1);
        out
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<T> {
        ReceiverStream::new(self.rx)
    }

    /// Order-preserving per-tuple transform.
    pub fn map<U, F>(self, mut f: F) -> Channel<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let (tx, out) = channel(DEFAULT_CHANNEL_CAPACITY);
        let mut rx = self.rx;
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                if !tx.emit(f(item)).await {
                    break;
                }
            }
        });
        out
    }

    /// Drops tuples failing `pred`; order-preserving.
    pub fn filter<F>(self, mut pred: F) -> Channel<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        let (tx, out) = channel(DEFAULT_CHANNEL_CAPACITY);
        let mut rx = self.rx;
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                if pred(&item) && !tx.emit(item).await {
                    break;
                }
            }
        });
        out
    }

    /// Keeps the first tuple seen for every derived key.
    pub fn unique_by<K, F>(self, mut key: F) -> Channel<T>
    where
        K: Eq + Hash + Send + 'static,
        F: FnMut(&T) -> K + Send + 'static,
    {
        let (tx, out) = channel(DEFAULT_CHANNEL_CAPACITY);
        let mut rx = self.rx;
        tokio::spawn(async move {
            let mut seen: FxHashSet<K> = FxHashSet::default();
            while let Some(item) = rx.recv().await {
                if seen.insert(key(&item)) && !tx.emit(item).await {
                    break;
                }
            }
        });
        out
    }

    /// Expands each tuple into zero or more tuples. The fan-out width is only known at run time.
    pub fn flat_map<U, F>(self, mut f: F) -> Channel<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Vec<U> + Send + 'static,
    {
        let (tx, out) = channel(DEFAULT_CHANNEL_CAPACITY);
        let mut rx = self.rx;
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                for expanded in f(item) {
                    if !tx.emit(expanded).await {
                        return;
                    }
                }
            }
        });
        out
    }

    /// Groups consecutive tuples into chunks of `size`; the last chunk may be short.
    pub fn collate(self, size: usize) -> Channel<Vec<T>> {
        let size = size.max(1);
        let (tx, out) = channel(DEFAULT_CHANNEL_CAPACITY);
        let mut rx = self.rx;
        tokio::spawn(async move {
            let mut chunk = Vec::with_capacity(size);
            while let Some(item) = rx.recv().await {
                chunk.push(item);
                if chunk.len() == size {
                    let full = std::mem::replace(&mut chunk, Vec::with_capacity(size));
                    if !tx.emit(full).await {
                        return;
                    }
                }
            }
            if !chunk.is_empty() {
                tx.emit(chunk).await;
            }
        });
        out
    }

    /// Forwards every tuple; if the upstream closes without producing any, emits `default` instead.
    pub fn if_empty(self, default: T) -> Channel<T> {
        let (tx, out) = channel(DEFAULT_CHANNEL_CAPACITY);
        let mut rx = self.rx;
        tokio::spawn(async move {
            let mut seen = false;
            while let Some(item) = rx.recv().await {
                seen = true;
                if !tx.emit(item).await {
                    return;
                }
            }
            if !seen {
                tx.emit(default).await;
            }
        });
        out
    }

    /// Resolves once the upstream closes, with everything it produced.
    pub async fn collect(self) -> Vec<T> {
        let mut rx = self.rx;
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    /// Resolves with the first tuple, or `None` if the upstream closes empty.
    /// The rest of the channel is discarded.
    pub async fn first(self) -> Option<T> {
        let mut rx = self.rx;
        rx.recv().await
    }

    /// Inner join on a derived key. Tuples are buffered per key until a partner arrives
    /// from the other side; repeated keys pair up in arrival order. Unmatched tuples are
    /// dropped when both sides close. Output order follows match time, not input order.
    pub fn join_by<U, K, FL, FR>(
        self,
        other: Channel<U>,
        label: &'static str,
        mut left_key: FL,
        mut right_key: FR,
    ) -> Channel<(K, T, U)>
    where
        U: Send + 'static,
        K: Eq + Hash + Clone + Debug + Send + 'static,
        FL: FnMut(&T) -> K + Send + 'static,
        FR: FnMut(&U) -> K + Send + 'static,
    {
        let (tx, out) = channel(DEFAULT_CHANNEL_CAPACITY);
        let mut left = self.rx;
        let mut right = other.rx;
        tokio::spawn(async move {
            let mut waiting_left: FxHashMap<K, VecDeque<T>> = FxHashMap::default();
            let mut waiting_right: FxHashMap<K, VecDeque<U>> = FxHashMap::default();
            let (mut left_open, mut right_open) = (true, true);
            let mut matched = 0usize;

            while left_open || right_open {
                let pair = tokio::select! {
                    item = left.recv(), if left_open => match item {
                        Some(l) => {
                            let key = left_key(&l);
                            match take_partner(&mut waiting_right, &key) {
                                Some(r) => Some((key, l, r)),
                                None => {
                                    waiting_left.entry(key).or_default().push_back(l);
                                    None
                                }
                            }
                        }
                        None => {
                            left_open = false;
                            None
                        }
                    },
                    item = right.recv(), if right_open => match item {
                        Some(r) => {
                            let key = right_key(&r);
                            match take_partner(&mut waiting_left, &key) {
                                Some(l) => Some((key, l, r)),
                                None => {
                                    waiting_right.entry(key).or_default().push_back(r);
                                    None
                                }
                            }
                        }
                        None => {
                            right_open = false;
                            None
                        }
                    },
                };
                if let Some(pair) = pair {
                    matched += 1;
                    if !tx.emit(pair).await {
                        return;
                    }
                }
            }

            let unmatched_left: Vec<&K> = waiting_left.iter().filter(|(_, q)| !q.is_empty()).map(|(k, _)| k).collect();
            let unmatched_right: Vec<&K> = waiting_right.iter().filter(|(_, q)| !q.is_empty()).map(|(k, _)| k).collect();
            if matched == 0 && unmatched_left.is_empty() && unmatched_right.is_empty() {
                debug!("{}: nothing to join", label);
            } else if matched == 0 {
                warn!("{}: join produced no matches (unmatched keys left {:?}, right {:?})", label, unmatched_left, unmatched_right);
            } else if !unmatched_left.is_empty() || !unmatched_right.is_empty() {
                warn!("{}: dropped unmatched keys left {:?}, right {:?}", label, unmatched_left, unmatched_right);
            } else {
                debug!("{}: joined {} tuples", label, matched);
            }
        });
        out
    }

    /// Pairs every tuple with every tuple of `other` sharing its key (broadcast join).
    /// Both sides are buffered so each matching pair is emitted exactly once whatever
    /// the arrival interleaving.
    pub fn cross_by<U, K, FL, FR>(self, other: Channel<U>, mut left_key: FL, mut right_key: FR) -> Channel<(T, U)>
    where
        T: Clone,
        U: Clone + Send + 'static,
        K: Eq + Hash + Send + 'static,
        FL: FnMut(&T) -> K + Send + 'static,
        FR: FnMut(&U) -> K + Send + 'static,
    {
        let (tx, out) = channel(DEFAULT_CHANNEL_CAPACITY);
        let mut left = self.rx;
        let mut right = other.rx;
        tokio::spawn(async move {
            let mut seen_left: FxHashMap<K, Vec<T>> = FxHashMap::default();
            let mut seen_right: FxHashMap<K, Vec<U>> = FxHashMap::default();
            let (mut left_open, mut right_open) = (true, true);

            while left_open || right_open {
                let pairs: Vec<(T, U)> = tokio::select! {
                    item = left.recv(), if left_open => match item {
                        Some(l) => {
                            let key = left_key(&l);
                            let pairs = seen_right
                                .get(&key)
                                .map(|rs| rs.iter().map(|r| (l.clone(), r.clone())).collect())
                                .unwrap_or_default();
                            seen_left.entry(key).or_default().push(l);
                            pairs
                        }
                        None => {
                            left_open = false;
                            Vec::new()
                        }
                    },
                    item = right.recv(), if right_open => match item {
                        Some(r) => {
                            let key = right_key(&r);
                            let pairs = seen_left
                                .get(&key)
                                .map(|ls| ls.iter().map(|l| (l.clone(), r.clone())).collect())
                                .unwrap_or_default();
                            seen_right.entry(key).or_default().push(r);
                            pairs
                        }
                        None => {
                            right_open = false;
                            Vec::new()
                        }
                    },
                };
                for pair in pairs {
                    if !tx.emit(pair).await {
                        return;
                    }
                }
            }
        });
        out
    }

    /// Merges channels into one. Order holds within each source, not across them;
    /// the result closes once every source has closed.
    pub fn mix(channels: Vec<Channel<T>>) -> Channel<T> {
        let (tx, out) = channel(DEFAULT_CHANNEL_CAPACITY);
        for source in channels {
            let tx = tx.clone();
            let mut rx = source.rx;
            tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    if !tx.emit(item).await {
                        break;
                    }
                }
            });
        }
        out
    }

    /// Broadcasts the channel to `n` consumers, each receiving every tuple in order.
    pub fn split(self, n: usize) -> Vec<Channel<T>>
    where
        T: Clone,
    {
        let mut emitters = Vec::with_capacity(n);
        let mut outputs = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, out) = channel(DEFAULT_CHANNEL_CAPACITY);
            emitters.push(tx);
            outputs.push(out);
        }
        let mut rx = self.rx;
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                for tx in &emitters {
                    tx.emit(item.clone()).await;
                }
            }
        });
        outputs
    }
}

impl<T: Clone + Send + 'static> Channel<T> {
    /// [`Channel::split`] into a fixed number of consumers.
    pub fn fork<const N: usize>(self) -> [Channel<T>; N] {
        let mut outputs = self.split(N).into_iter();
        std::array::from_fn(|_| outputs.next().unwrap_or_else(Channel::empty))
    }
}

impl<T: Send + 'static> Channel<Vec<T>> {
    /// Emits the elements of every collection tuple individually.
    pub fn flatten(self) -> Channel<T> {
        self.flat_map(|items| items)
    }
}

fn take_partner<K: Eq + Hash, V>(waiting: &mut FxHashMap<K, VecDeque<V>>, key: &K) -> Option<V> {
    let queue = waiting.get_mut(key)?;
    let partner = queue.pop_front();
    if queue.is_empty() {
        waiting.remove(key);
    }
    partner
}
