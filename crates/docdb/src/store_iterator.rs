//! Seekable forward cursor over a point-in-time view of one store.
//!
//! Fjall exposes range iterators rather than a repositionable cursor, so the
//! cursor buffers a window of entries from the snapshot and opens a new range
//! whenever it is seeked or runs off the end of the window.

use crate::error::Result;
use std::collections::VecDeque;
use std::ops::Bound;

const WINDOW: usize = 64;

type Entry = (Vec<u8>, Vec<u8>);

pub struct StoreIterator {
    snapshot: fjall::Snapshot,
    window: VecDeque<Entry>,
    /// The last range read reached the end of the snapshot.
    exhausted: bool,
}

impl StoreIterator {
    pub(crate) fn new(snapshot: fjall::Snapshot) -> Self {
        Self {
            snapshot,
            window: VecDeque::new(),
            exhausted: true,
        }
    }

    /// Position at the first entry with key `>= target`.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.fill(Bound::Included(target.to_vec()))
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.fill(Bound::Unbounded)
    }

    /// Seek only if `target` is ahead of the current position.
    pub fn seek_forward(&mut self, target: &[u8]) -> Result<()> {
        if self.valid() && self.key() >= target {
            return Ok(());
        }
        // Cheap path: the target is inside the buffered window.
        while let Some((key, _)) = self.window.front() {
            if key.as_slice() >= target {
                return Ok(());
            }
            if self.window.len() == 1 {
                break;
            }
            self.window.pop_front();
        }
        self.seek(target)
    }

    pub fn next(&mut self) -> Result<()> {
        if let Some((key, _)) = self.window.pop_front()
            && self.window.is_empty()
            && !self.exhausted
        {
            self.fill(Bound::Excluded(key))?;
        }
        Ok(())
    }

    pub fn valid(&self) -> bool {
        !self.window.is_empty()
    }

    /// Current key. Empty when not valid.
    pub fn key(&self) -> &[u8] {
        self.window.front().map(|(k, _)| k.as_slice()).unwrap_or_default()
    }

    /// Current value. Empty when not valid.
    pub fn value(&self) -> &[u8] {
        self.window.front().map(|(_, v)| v.as_slice()).unwrap_or_default()
    }

    fn fill(&mut self, from: Bound<Vec<u8>>) -> Result<()> {
        self.window.clear();
        for item in self
            .snapshot
            .range::<Vec<u8>, _>((from, Bound::Unbounded))
            .take(WINDOW)
        {
            let (key, value) = item.map_err(fjall::Error::from)?;
            self.window.push_back((key.to_vec(), value.to_vec()));
        }
        self.exhausted = self.window.len() < WINDOW;
        Ok(())
    }
}
