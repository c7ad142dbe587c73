//! Table variables.
//!
//! A table is a sparse array of rows. Each row is an independent byte
//! buffer of at most 255 bytes; absent rows are holes, distinct from
//! present-but-empty storage (which the protocol cannot express, so writing
//! an empty row creates a hole).
//!
//! The server side computes a 16-bit version from all row contents on every
//! request and serves pages; the client side reassembles pages and restarts
//! when the version changes mid-fetch (see `Client::get_var`).

use bytes::Bytes;

use crate::error::Status;
use crate::wire::TablePage;

/// Rows of a table variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    rows: Vec<Option<Bytes>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of row slots, holes included.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of present rows.
    pub fn present(&self) -> usize {
        self.rows.iter().filter(|row| row.is_some()).count()
    }

    pub fn row(&self, index: u16) -> Option<&Bytes> {
        self.rows.get(index as usize).and_then(Option::as_ref)
    }

    /// Present rows in ascending index order.
    pub fn rows(&self) -> impl Iterator<Item = (u16, &Bytes)> {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(index, row)| row.as_ref().map(|data| (index as u16, data)))
    }

    /// Set, replace or (with empty data) clear one row.
    ///
    /// The table grows to fit `index`.
    pub fn update_row(&mut self, index: u16, data: impl Into<Bytes>) -> Result<(), Status> {
        let data = data.into();
        if data.len() > u8::MAX as usize {
            return Err(Status::BadBufferSize);
        }
        let index = index as usize;
        if data.is_empty() {
            if let Some(slot) = self.rows.get_mut(index) {
                *slot = None;
            }
            return Ok(());
        }
        if index >= self.rows.len() {
            self.rows.resize(index + 1, None);
        }
        self.rows[index] = Some(data);
        Ok(())
    }

    /// Drop every row.
    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// 16-bit content version.
    ///
    /// Every present row XORs its big-endian 32-bit words, then its trailing
    /// bytes, into a 32-bit accumulator. The accumulator rotates right by one
    /// after every slot, holes included, so moving a row changes the result.
    pub fn version(&self) -> u16 {
        let mut hash: u32 = 0;
        for row in &self.rows {
            if let Some(data) = row {
                let words = data.chunks_exact(4);
                let tail = words.remainder();
                for word in words {
                    hash ^= u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
                }
                for byte in tail {
                    hash ^= u32::from(*byte);
                }
            }
            hash = hash.rotate_right(1);
        }
        hash as u16
    }

    /// Serve up to `count` present rows starting at slot `first`.
    ///
    /// Stops early if the next row would push the page past `budget` bytes.
    /// `remaining` counts the present rows from the first slot not examined.
    pub fn page(&self, first: u16, count: u8, budget: usize) -> TablePage {
        let mut entries = Vec::new();
        let mut used = TablePage::HEADER_LEN;
        let mut index = first as usize;
        while index < self.rows.len() && entries.len() < count as usize {
            if let Some(data) = &self.rows[index] {
                let size = TablePage::entry_len(data.len());
                if used + size > budget && !entries.is_empty() {
                    break;
                }
                used += size;
                entries.push((index as u16, data.clone()));
            }
            index += 1;
        }
        let remaining = self.rows[index.min(self.rows.len())..]
            .iter()
            .filter(|row| row.is_some())
            .count();
        TablePage {
            remaining: remaining.min(u16::MAX as usize) as u16,
            version: self.version(),
            entries,
        }
    }
}
