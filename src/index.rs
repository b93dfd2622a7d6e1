//! Inverted index from k-mer/hash keys to the ids of the sets containing them.
//!
//! ## File format
//! All integers little-endian.
//! - header: `u64` number of distinct keys `n`, `u64` total id occurrences;
//! - `n` × `u32` id count per key;
//! - `n` × `u64` keys, ascending, parallel to the counts;
//! - the id lists, concatenated in key order, each id a `u32`.
//!
//! [`IndexReader`] decodes the header, counts and keys up front and then
//! yields one id list at a time.

use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use itertools::Itertools;
use log::debug;

use crate::{
    distance::read_exact_or_truncated,
    error::{Result, format_error},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdIndex {
    map: HashMap<u64, Vec<u32>>,
}

impl IdIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that set `id` contains every key in `keys`.
    pub fn insert_set(&mut self, id: u32, keys: impl IntoIterator<Item = u64>) {
        for key in keys {
            let ids = self.map.entry(key).or_default();
            // Ids usually arrive in increasing order, making this a push.
            if let Err(pos) = ids.binary_search(&id) {
                ids.insert(pos, id);
            }
        }
    }

    pub fn merge(&mut self, other: &IdIndex) {
        for (&key, ids) in &other.map {
            let mine = self.map.entry(key).or_default();
            mine.extend_from_slice(ids);
            mine.sort_unstable();
            mine.dedup();
        }
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn total_ids(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    pub fn get(&self, key: u64) -> Option<&[u32]> {
        self.map.get(&key).map(Vec::as_slice)
    }

    /// Sets sharing at least one of `keys`, with the number of shared keys,
    /// most shared first (ties by id).
    pub fn query(&self, keys: impl IntoIterator<Item = u64>) -> Vec<(u32, u32)> {
        let mut shared: HashMap<u32, u32> = HashMap::new();
        for key in keys {
            for &id in self.get(key).unwrap_or_default() {
                *shared.entry(id).or_default() += 1;
            }
        }
        shared
            .into_iter()
            .sorted_unstable_by_key(|&(id, count)| (std::cmp::Reverse(count), id))
            .collect()
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        let keys = self.map.keys().copied().sorted_unstable().collect_vec();
        out.write_all(&(keys.len() as u64).to_le_bytes())?;
        out.write_all(&(self.total_ids() as u64).to_le_bytes())?;
        for key in &keys {
            out.write_all(&(self.map[key].len() as u32).to_le_bytes())?;
        }
        for key in &keys {
            out.write_all(&key.to_le_bytes())?;
        }
        for key in &keys {
            for id in &self.map[key] {
                out.write_all(&id.to_le_bytes())?;
            }
        }
        debug!(
            "Wrote index with {} keys and {} ids",
            keys.len(),
            self.total_ids()
        );
        Ok(())
    }

    pub fn read<R: Read>(input: R) -> Result<Self> {
        let mut reader = IndexReader::new(input)?;
        let mut map = HashMap::with_capacity(reader.num_keys());
        for entry in &mut reader {
            let (key, ids) = entry?;
            map.insert(key, ids);
        }
        reader.finish()?;
        Ok(Self { map })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::read(BufReader::new(File::open(path)?))
    }
}

/// Streaming decoder for the index file format.
pub struct IndexReader<R> {
    input: R,
    counts: Vec<u32>,
    keys: Vec<u64>,
    total_ids: u64,
    next: usize,
}

impl<R: Read> IndexReader<R> {
    pub fn new(mut input: R) -> Result<Self> {
        let mut word = [0u8; 8];
        read_exact_or_truncated(&mut input, &mut word, "index header")?;
        let num_keys = u64::from_le_bytes(word);
        read_exact_or_truncated(&mut input, &mut word, "index header")?;
        let total_ids = u64::from_le_bytes(word);
        let num_keys = usize::try_from(num_keys)
            .map_err(|_| format_error!("index with {num_keys} keys is too large"))?;

        let mut half = [0u8; 4];
        let mut counts = Vec::with_capacity(num_keys.min(1 << 20));
        for _ in 0..num_keys {
            read_exact_or_truncated(&mut input, &mut half, "index counts")?;
            counts.push(u32::from_le_bytes(half));
        }
        let sum: u64 = counts.iter().map(|&c| c as u64).sum();
        if sum != total_ids {
            return Err(format_error!(
                "index header promises {total_ids} ids but counts add up to {sum}"
            ));
        }

        let mut keys = Vec::with_capacity(num_keys.min(1 << 20));
        for _ in 0..num_keys {
            read_exact_or_truncated(&mut input, &mut word, "index keys")?;
            keys.push(u64::from_le_bytes(word));
        }
        if !keys.is_sorted_by(|a, b| a < b) {
            return Err(format_error!("index keys are not strictly ascending"));
        }

        Ok(Self {
            input,
            counts,
            keys,
            total_ids,
            next: 0,
        })
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn total_ids(&self) -> u64 {
        self.total_ids
    }

    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    /// Length of each id list, parallel to [`keys`](Self::keys).
    pub fn list_lengths(&self) -> &[u32] {
        &self.counts
    }

    /// Check that every list was consumed and nothing follows.
    pub fn finish(mut self) -> Result<()> {
        if self.next != self.keys.len() {
            return Err(format_error!(
                "index reader stopped after {} of {} keys",
                self.next,
                self.keys.len()
            ));
        }
        let mut byte = [0u8; 1];
        if self.input.read(&mut byte)? != 0 {
            return Err(format_error!("trailing bytes after index"));
        }
        Ok(())
    }

    fn read_list(&mut self, count: u32) -> Result<Vec<u32>> {
        let mut half = [0u8; 4];
        let mut ids = Vec::with_capacity((count as usize).min(1 << 16));
        for _ in 0..count {
            read_exact_or_truncated(&mut self.input, &mut half, "index id list")?;
            ids.push(u32::from_le_bytes(half));
        }
        Ok(ids)
    }
}

impl<R: Read> Iterator for IndexReader<R> {
    type Item = Result<(u64, Vec<u32>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let key = *self.keys.get(self.next)?;
        let count = self.counts[self.next];
        self.next += 1;
        Some(self.read_list(count).map(|ids| (key, ids)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;

    fn example() -> IdIndex {
        let mut index = IdIndex::new();
        index.insert_set(0, [10, 20, 30]);
        index.insert_set(1, [20, 30, 40]);
        index.insert_set(2, [30]);
        index
    }

    #[test]
    fn insert_and_query() {
        let index = example();
        assert_eq!(index.len(), 4);
        assert_eq!(index.total_ids(), 7);
        assert_eq!(index.get(30), Some(&[0, 1, 2][..]));
        assert_eq!(index.get(99), None);
        assert_eq!(index.query([20, 30, 40]), vec![(1, 3), (0, 2), (2, 1)]);
        assert!(index.query([5]).is_empty());
    }

    #[test]
    fn ids_stay_sorted() {
        let mut index = IdIndex::new();
        index.insert_set(5, [1]);
        index.insert_set(2, [1]);
        index.insert_set(5, [1]);
        index.insert_set(9, [1]);
        assert_eq!(index.get(1), Some(&[2, 5, 9][..]));
    }

    #[test]
    fn merge_shards() {
        let mut a = IdIndex::new();
        a.insert_set(0, [10, 20, 30]);
        a.insert_set(2, [30]);
        let mut b = IdIndex::new();
        b.insert_set(1, [20, 30, 40]);
        a.merge(&b);
        assert_eq!(a, example());
    }

    #[test]
    fn file_layout() {
        let mut index = IdIndex::new();
        index.insert_set(7, [5, 3]);
        index.insert_set(8, [3]);
        let mut buf = vec![];
        index.write(&mut buf).unwrap();

        let mut expected = vec![];
        expected.extend(2u64.to_le_bytes());
        expected.extend(3u64.to_le_bytes());
        expected.extend(2u32.to_le_bytes());
        expected.extend(1u32.to_le_bytes());
        expected.extend(3u64.to_le_bytes());
        expected.extend(5u64.to_le_bytes());
        for id in [7u32, 8, 7] {
            expected.extend(id.to_le_bytes());
        }
        assert_eq!(buf, expected);
        assert_eq!(IdIndex::read(buf.as_slice()).unwrap(), index);
    }

    #[test]
    fn streaming_reader() {
        let index = example();
        let mut buf = vec![];
        index.write(&mut buf).unwrap();
        let reader = IndexReader::new(buf.as_slice()).unwrap();
        assert_eq!(reader.keys(), &[10, 20, 30, 40]);
        assert_eq!(reader.list_lengths(), &[1, 2, 3, 1]);
        assert_eq!(reader.total_ids(), 7);
        let lists: Vec<_> = reader.map(|e| e.unwrap()).collect();
        assert_eq!(
            lists,
            vec![
                (10, vec![0]),
                (20, vec![0, 1]),
                (30, vec![0, 1, 2]),
                (40, vec![1])
            ]
        );
    }

    #[test]
    fn malformed_files() {
        let mut buf = vec![];
        example().write(&mut buf).unwrap();

        // Total does not match the counts.
        let mut bad = buf.clone();
        bad[8] = 8;
        assert!(matches!(
            IndexReader::new(bad.as_slice()),
            Err(Error::Format(_))
        ));

        // A list length far beyond the file.
        let mut long_list = buf.clone();
        long_list[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        long_list[8..16].copy_from_slice(&(u32::MAX as u64 + 6).to_le_bytes());
        assert!(matches!(
            IdIndex::read(long_list.as_slice()),
            Err(Error::Format(_))
        ));

        let truncated = &buf[..buf.len() - 2];
        assert!(matches!(IdIndex::read(truncated), Err(Error::Format(_))));
        assert!(matches!(IdIndex::read(&buf[..10]), Err(Error::Format(_))));

        let mut trailing = buf.clone();
        trailing.extend([0, 0, 0, 0]);
        assert!(matches!(
            IdIndex::read(trailing.as_slice()),
            Err(Error::Format(_))
        ));

        let empty = IdIndex::new();
        let mut buf = vec![];
        empty.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 16);
        assert!(IdIndex::read(buf.as_slice()).unwrap().is_empty());
    }
}
