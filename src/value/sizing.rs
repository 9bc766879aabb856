//! Chunk sizing for streaming LOB content.

/// I/O unit used when reading uncompressed LOB content.
pub const IO_BUFFER_SIZE: usize = 4 * 1024;

/// I/O unit used when the LOB will be compressed.
pub const IO_BUFFER_SIZE_COMPRESS: usize = 2 * 1024;

/// Largest chunk ever requested in one read.
pub const MAX_CHUNK_SIZE: usize = i32::MAX as usize;

/// Number of bytes (or characters) to read in the next chunk.
///
/// `remaining` is the number of units still allowed to be read; a negative
/// value means "unbounded". When the I/O unit is within the inline threshold
/// the chunk is stretched to `inline_threshold + 1` so that a single read
/// decides whether the value fits inline.
pub fn buffer_size(inline_threshold: usize, compress: bool, remaining: i64) -> usize {
    let remaining = if remaining < 0 || remaining as u64 > MAX_CHUNK_SIZE as u64 {
        MAX_CHUNK_SIZE
    } else {
        remaining as usize
    };

    let unit = if compress {
        IO_BUFFER_SIZE_COMPRESS
    } else {
        IO_BUFFER_SIZE
    };

    let mut target = unit;
    if unit < remaining && unit <= inline_threshold {
        target = remaining.min(inline_threshold.saturating_add(1));
        target = round_up(target, unit).min(MAX_CHUNK_SIZE);
    }

    let size = remaining.min(target);
    if remaining > 0 {
        size.max(1)
    } else {
        size
    }
}

fn round_up(x: usize, unit: usize) -> usize {
    x.div_ceil(unit).saturating_mul(unit)
}
