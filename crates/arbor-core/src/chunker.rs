//! Splitting file contents into a chunk/bigfile tree.
//!
//! Contents up to `MAX_CHUNK` bytes become a single chunk. Anything larger
//! is cut into `clamp(len / 1024, 2, 32)` shares whose sizes differ by at
//! most one byte. Shares hold at least 1024 bytes unless there are fewer
//! than 2048 in total. Each share is chunked again. Every bigfile has between 2 and 32 children and
//! every leaf holds at most 1024 bytes.

use bytes::Bytes;

use crate::tree::{File, Name, MAX_CHUNK, MAX_FANOUT, MIN_FANOUT};

/// Build the tree for one file's contents. Only the returned root carries
/// `name`; inner nodes are unnamed.
pub fn chunk_bytes(name: Name, data: Bytes) -> File {
    let mut node = split(data);
    node.set_name(name);
    node
}

fn split(data: Bytes) -> File {
    if data.len() <= MAX_CHUNK {
        return File::chunk(Name::default(), data);
    }

    let count = (data.len() / MAX_CHUNK).clamp(MIN_FANOUT, MAX_FANOUT);
    let base = data.len() / count;
    let extra = data.len() % count;

    // The first `extra` shares take one byte more.
    let mut start = 0;
    let children = (0..count)
        .map(|i| {
            let end = start + base + usize::from(i < extra);
            let share = data.slice(start..end);
            start = end;
            split(share)
        })
        .collect();
    File::bigfile(Name::default(), children)
}
