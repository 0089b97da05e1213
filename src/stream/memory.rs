//! In-memory stream backend: a FIFO list of bucket-sized chunks. Reads
//! consume from the head, writes append to the tail, nothing ever blocks
//! and `eof` is only raised by an explicit close.

use std::collections::VecDeque;
use std::time::Instant;

use super::StreamInner;

pub(crate) const DEFAULT_BUCKET_SIZE: usize = 64 * 1024;

struct Chunk {
    data: Box<[u8]>,
    read: usize,
    write: usize,
}

pub(crate) struct Chunks {
    list: VecDeque<Chunk>,
    bucket_size: usize,
    length: u64,
}

impl Chunks {
    pub(crate) fn new(bucket_size: usize) -> Chunks {
        Chunks {
            list: VecDeque::new(),
            bucket_size: bucket_size.max(64),
            length: 0,
        }
    }

    /// Bytes buffered and not yet read.
    pub(crate) fn len(&self) -> u64 {
        self.length
    }

    pub(crate) fn clear(&mut self) {
        self.list.clear();
        self.length = 0;
    }
}

pub(crate) unsafe fn read(stream: *mut StreamInner, buffer: &mut [u8]) -> usize {
    let started = Instant::now();
    let mut done = 0;

    {
        let Some(chunks) = (*stream).memory.as_mut() else {
            return 0;
        };

        while done < buffer.len() {
            let Some(chunk) = chunks.list.front_mut() else {
                break;
            };

            let available = chunk.write - chunk.read;
            if available == 0 {
                chunks.list.pop_front();
                continue;
            }

            let count = available.min(buffer.len() - done);
            buffer[done..done + count]
                .copy_from_slice(&chunk.data[chunk.read..chunk.read + count]);
            chunk.read += count;
            done += count;
        }

        chunks.length -= done as u64;
    }

    (*stream).info.read.bytes += done as u64;
    (*stream).info.read.position += done as u64;
    (*stream).info.read.period += started.elapsed().as_nanos() as u64;

    done
}

pub(crate) unsafe fn write(stream: *mut StreamInner, buffer: &[u8]) -> usize {
    let started = Instant::now();
    let mut remaining = buffer;

    {
        let Some(chunks) = (*stream).memory.as_mut() else {
            return 0;
        };

        if let Some(tail) = chunks.list.back_mut() {
            let free = tail.data.len() - tail.write;
            let count = free.min(remaining.len());
            if count > 0 {
                tail.data[tail.write..tail.write + count].copy_from_slice(&remaining[..count]);
                tail.write += count;
                remaining = &remaining[count..];
            }
        }

        if !remaining.is_empty() {
            // One new chunk, rounded up to a multiple of the bucket size.
            let buckets = remaining.len().div_ceil(chunks.bucket_size);
            let mut data = vec![0u8; buckets * chunks.bucket_size].into_boxed_slice();
            data[..remaining.len()].copy_from_slice(remaining);
            chunks.list.push_back(Chunk {
                data,
                read: 0,
                write: remaining.len(),
            });
        }

        chunks.length += buffer.len() as u64;
    }

    (*stream).info.write.bytes += buffer.len() as u64;
    (*stream).info.write.position += buffer.len() as u64;
    (*stream).info.write.period += started.elapsed().as_nanos() as u64;

    buffer.len()
}
