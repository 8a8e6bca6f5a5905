//! Routing between one orchestrator and many independent instances.
//!
//! Inbound messages carry an explicit destination key (a PU index inside a
//! rack, a rack id inside the data center). The routing table is fixed at
//! construction; messages are forwarded verbatim.

use std::collections::BTreeMap;
use std::fmt::Display;

use edc_core::{Error, Result};

#[derive(Debug, Clone)]
pub struct Multiplexer<K> {
    routes: BTreeMap<K, usize>,
    keys: Vec<K>,
}

impl<K: Ord + Clone + Display> Multiplexer<K> {
    /// One dedicated channel per key, numbered in the given order
    pub fn new(keys: impl IntoIterator<Item = K>) -> Result<Self> {
        let mut routes = BTreeMap::new();
        let mut ordered = Vec::new();
        for key in keys {
            if routes.insert(key.clone(), ordered.len()).is_some() {
                return Err(Error::config(format!("Duplicate routing key: {}", key)));
            }
            ordered.push(key);
        }
        Ok(Self { routes, keys: ordered })
    }

    /// Number of output channels
    pub fn channels(&self) -> usize {
        self.keys.len()
    }

    /// Key served by a channel
    pub fn key(&self, channel: usize) -> Option<&K> {
        self.keys.get(channel)
    }

    /// Channel dedicated to `key`
    pub fn route(&self, key: &K) -> Result<usize> {
        self.routes
            .get(key)
            .copied()
            .ok_or_else(|| Error::routing(format!("No channel mapped to {}", key)))
    }

    /// Split a tagged stream into one bag per channel, preserving arrival order
    pub fn demux<T>(&self, messages: impl IntoIterator<Item = (K, T)>) -> Result<Vec<Vec<T>>> {
        let mut bags: Vec<Vec<T>> = (0..self.keys.len()).map(|_| Vec::new()).collect();
        for (key, message) in messages {
            let channel = self.route(&key)?;
            bags[channel].push(message);
        }
        Ok(bags)
    }

    /// Merge per-channel outputs into one stream tagged with the source key
    pub fn fan_in<T>(&self, per_channel: Vec<Vec<T>>) -> Vec<(K, T)> {
        per_channel
            .into_iter()
            .zip(self.keys.iter())
            .flat_map(|(messages, key)| messages.into_iter().map(move |m| (key.clone(), m)))
            .collect()
    }
}
