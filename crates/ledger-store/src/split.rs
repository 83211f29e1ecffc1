//! Content-defined splitting of values into pieces.
//!
//! Data is cut where a rolling hash of the last [`WINDOW_SIZE`] bytes, passed
//! through the encryption layer's chunking permutation, ends in at least
//! [`CHUNK_BITS`] one bits. Cuts with more one bits close index levels, so the
//! shape of the index tree is also content-defined: an edit only rewrites the
//! chunks and index pieces around it.

use std::ops::Range;

use bytes::Bytes;
use ledger_crypto::{compute_object_digest, ChunkingPermutation};
use ledger_types::{ObjectDigest, ObjectIdentifier, ObjectType, PieceType};

use crate::error::{StorageError, StorageResult};
use crate::object::{FileIndex, FileIndexChild, Piece};

pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;
/// Minimum number of trailing one bits of the permuted hash at a cut.
pub const CHUNK_BITS: u32 = 13;
/// Extra trailing one bits needed to close one more index level.
pub const BITS_PER_LEVEL: u32 = 4;
/// Bound on the children of one index piece, so indexes stay chunk-sized.
pub const MAX_IDENTIFIERS_PER_INDEX: usize = MAX_CHUNK_SIZE / 77;

const WINDOW_SIZE: usize = 64;
const CHAR_OFFSET: u32 = 31;
const CHUNK_MASK: u64 = (1 << CHUNK_BITS) - 1;

/// Adler-style rolling checksum over a fixed window.
struct RollSum {
    s1: u32,
    s2: u32,
    window: [u8; WINDOW_SIZE],
    offset: usize,
}

impl RollSum {
    fn new() -> Self {
        Self {
            s1: WINDOW_SIZE as u32 * CHAR_OFFSET,
            s2: (WINDOW_SIZE * (WINDOW_SIZE - 1)) as u32 * CHAR_OFFSET,
            window: [0; WINDOW_SIZE],
            offset: 0,
        }
    }

    fn roll(&mut self, add: u8) {
        let dropped = u32::from(self.window[self.offset]);
        self.s1 = self.s1.wrapping_add(u32::from(add)).wrapping_sub(dropped);
        self.s2 = self
            .s2
            .wrapping_add(self.s1)
            .wrapping_sub((WINDOW_SIZE as u32).wrapping_mul(dropped + CHAR_OFFSET));
        self.window[self.offset] = add;
        self.offset = (self.offset + 1) % WINDOW_SIZE;
    }

    fn digest(&self) -> u32 {
        (self.s1 << 16) | (self.s2 & 0xffff)
    }
}

/// Output of [`split_data`].
#[derive(Clone, Debug)]
pub struct SplitResult {
    /// Identifier of the whole value, typed with the requested object type.
    pub root: ObjectIdentifier,
    /// Size of the value.
    pub size: u64,
    /// Every non-inlined piece, children before the index pieces listing them.
    pub pieces: Vec<Piece>,
}

/// Chunk ranges of `data`, each with the number of trailing one bits of the
/// permuted hash at its cut (0 for forced cuts).
fn chunk_ranges(data: &[u8], permutation: &ChunkingPermutation) -> Vec<(Range<usize>, u32)> {
    let mut ranges = Vec::new();
    let mut rollsum = RollSum::new();
    let mut start = 0;
    for (i, &byte) in data.iter().enumerate() {
        rollsum.roll(byte);
        let len = i + 1 - start;
        if len >= MAX_CHUNK_SIZE {
            ranges.push((start..i + 1, 0));
            start = i + 1;
            continue;
        }
        if len < MIN_CHUNK_SIZE {
            continue;
        }
        let hash = permutation.apply(u64::from(rollsum.digest()));
        if hash & CHUNK_MASK == CHUNK_MASK {
            ranges.push((start..i + 1, hash.trailing_ones()));
            start = i + 1;
        }
    }
    if start < data.len() || ranges.is_empty() {
        ranges.push((start..data.len(), 0));
    }
    ranges
}

struct IndexBuilder<'a, F> {
    levels: Vec<Vec<FileIndexChild>>,
    pieces: Vec<Piece>,
    make_identifier: &'a F,
}

impl<F> IndexBuilder<'_, F>
where
    F: Fn(ObjectDigest) -> ObjectIdentifier,
{
    fn push(&mut self, level: usize, child: FileIndexChild) -> StorageResult<()> {
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        self.levels[level].push(child);
        if self.levels[level].len() >= MAX_IDENTIFIERS_PER_INDEX {
            self.close(level)?;
        }
        Ok(())
    }

    /// Fold the open children of `level` into one child of `level + 1`.
    fn close(&mut self, level: usize) -> StorageResult<()> {
        let Some(open) = self.levels.get_mut(level) else {
            return Ok(());
        };
        let children = std::mem::take(open);
        match children.len() {
            0 => Ok(()),
            1 => {
                let only = children.into_iter().next().ok_or_else(|| {
                    StorageError::Internal("index level lost its only child".to_string())
                })?;
                self.push(level + 1, only)
            }
            _ => {
                let index = FileIndex { children };
                let size = index.size();
                let content = index.encode()?;
                let digest = compute_object_digest(PieceType::Index, ObjectType::Blob, &content);
                let identifier = (self.make_identifier)(digest);
                self.pieces.push(Piece::new(identifier.clone(), Bytes::from(content)));
                self.push(level + 1, FileIndexChild::from_identifier(&identifier, size))
            }
        }
    }
}

/// Split `data` into pieces.
///
/// A value that fits in one chunk is a single chunk piece (inlined when small
/// enough). Larger values become chunk pieces typed [`ObjectType::Blob`]
/// under a tree of index pieces whose root carries `object_type`.
pub fn split_data<F>(
    data: &[u8],
    object_type: ObjectType,
    permutation: &ChunkingPermutation,
    make_identifier: F,
) -> StorageResult<SplitResult>
where
    F: Fn(ObjectDigest) -> ObjectIdentifier,
{
    let ranges = chunk_ranges(data, permutation);
    if ranges.len() == 1 {
        let digest = compute_object_digest(PieceType::Chunk, object_type, data);
        let root = make_identifier(digest);
        let pieces = if root.digest().is_inlined() {
            Vec::new()
        } else {
            vec![Piece::new(root.clone(), Bytes::copy_from_slice(data))]
        };
        return Ok(SplitResult {
            root,
            size: data.len() as u64,
            pieces,
        });
    }

    let mut builder = IndexBuilder {
        levels: vec![Vec::new()],
        pieces: Vec::new(),
        make_identifier: &make_identifier,
    };
    for (range, bits) in ranges {
        let content = &data[range];
        let digest = compute_object_digest(PieceType::Chunk, ObjectType::Blob, content);
        let identifier = make_identifier(digest);
        if !identifier.digest().is_inlined() {
            builder
                .pieces
                .push(Piece::new(identifier.clone(), Bytes::copy_from_slice(content)));
        }
        builder.push(0, FileIndexChild::from_identifier(&identifier, content.len() as u64))?;
        let closed_levels = bits.saturating_sub(CHUNK_BITS) / BITS_PER_LEVEL;
        for level in 0..closed_levels as usize {
            builder.close(level)?;
        }
    }

    let mut level = 0;
    while level + 1 < builder.levels.len() || builder.levels[level].len() > 1 {
        builder.close(level)?;
        level += 1;
    }

    // The last piece written is the top index; retype it as the requested
    // object type.
    let top = builder
        .pieces
        .pop()
        .filter(|piece| piece.is_index())
        .ok_or_else(|| StorageError::Internal("split produced no root index".to_string()))?;
    let digest = compute_object_digest(PieceType::Index, object_type, top.data());
    let root = make_identifier(digest);
    builder.pieces.push(Piece::new(root.clone(), top.data().clone()));

    Ok(SplitResult {
        root,
        size: data.len() as u64,
        pieces: builder.pieces,
    })
}
