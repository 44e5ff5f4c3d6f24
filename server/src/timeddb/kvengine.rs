/*
 * This file is part of ktd, a networked, expiration-aware key-value
 * cache server with master/slave replication.
 *
 * Copyright (c) 2024, ktd contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The underlying ordered key-value engine is, by design, an external
//! collaborator (§1 Non-goals): hash/tree files, B-tree pages and
//! compression codecs are out of scope. This module gives TimedDB a
//! concrete type to wrap — an in-process ordered store behind the same
//! interface boundary a real page-backed engine would expose — so the
//! rest of the stack (visitor protocol, reaper, snapshot codec) has
//! something real to drive.

use std::collections::BTreeMap;

/// A minimal ordered byte-string store. Keys are kept in `BTreeMap` order
/// so prefix scans, cursors and match operations all have a stable,
/// well-defined iteration order without needing a real B-tree/hash
/// backend.
#[derive(Debug, Default)]
pub struct MemEngine {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    size_bytes: usize,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.map.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    /// Inserts/overwrites `key`, returning the previous value if any.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Option<Vec<u8>> {
        self.size_bytes += key.len() + value.len();
        let prev = self.map.insert(key.clone(), value);
        if let Some(prev) = &prev {
            self.size_bytes -= key.len() + prev.len();
        }
        prev
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let prev = self.map.remove(key);
        if let Some(prev) = &prev {
            self.size_bytes -= key.len() + prev.len();
        }
        prev
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.size_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total bytes held across all keys and values, used by capacity-size
    /// eviction.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// The smallest key strictly greater than `after` (or the first key if
    /// `after` is `None`). Used to drive the expiration cursor and
    /// forward-direction record cursors.
    pub fn next_key_after(&self, after: Option<&[u8]>) -> Option<Vec<u8>> {
        match after {
            None => self.map.keys().next().cloned(),
            Some(k) => self
                .map
                .range::<[u8], _>((
                    std::ops::Bound::Excluded(k),
                    std::ops::Bound::Unbounded,
                ))
                .next()
                .map(|(k, _)| k.clone()),
        }
    }

    /// The largest key strictly less than `before` (or the last key if
    /// `before` is `None`). Used to drive reverse-direction cursors.
    pub fn prev_key_before(&self, before: Option<&[u8]>) -> Option<Vec<u8>> {
        match before {
            None => self.map.keys().next_back().cloned(),
            Some(k) => self
                .map
                .range::<[u8], _>((std::ops::Bound::Unbounded, std::ops::Bound::Excluded(k)))
                .next_back()
                .map(|(k, _)| k.clone()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.map.iter()
    }

    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = &'a Vec<u8>> {
        self.map
            .range(prefix.to_vec()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_helpers_walk_in_key_order() {
        let mut e = MemEngine::new();
        e.set(b"a".to_vec(), b"1".to_vec());
        e.set(b"c".to_vec(), b"2".to_vec());
        e.set(b"b".to_vec(), b"3".to_vec());
        assert_eq!(e.next_key_after(None), Some(b"a".to_vec()));
        assert_eq!(e.next_key_after(Some(b"a")), Some(b"b".to_vec()));
        assert_eq!(e.next_key_after(Some(b"c")), None);
        assert_eq!(e.prev_key_before(None), Some(b"c".to_vec()));
        assert_eq!(e.prev_key_before(Some(b"b")), Some(b"a".to_vec()));
    }

    #[test]
    fn size_bytes_tracks_overwrite_correctly() {
        let mut e = MemEngine::new();
        e.set(b"k".to_vec(), b"aaaa".to_vec());
        assert_eq!(e.size_bytes(), 5);
        e.set(b"k".to_vec(), b"bb".to_vec());
        assert_eq!(e.size_bytes(), 3);
        e.remove(b"k");
        assert_eq!(e.size_bytes(), 0);
    }

    #[test]
    fn prefix_scan_stops_at_boundary() {
        let mut e = MemEngine::new();
        for k in ["app", "apple", "apricot", "banana"] {
            e.set(k.as_bytes().to_vec(), b"v".to_vec());
        }
        let got: Vec<_> = e.keys_with_prefix(b"ap").collect();
        assert_eq!(got.len(), 3);
    }
}
