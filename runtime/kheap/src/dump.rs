//! Human-readable heap dump
//!
//! Written to any `core::fmt::Write` sink so the kernel can point it at the
//! UART console and tests can capture it into a `String`.

use core::fmt::{self, Write};

use crate::bins::{BinTable, ListId, ListKind};
use crate::config::GRANULE;
use crate::heap::Heap;
use crate::tag::Owner;

/// Bitmap words per dump row
const WORDS_PER_ROW: usize = 4;

impl Heap<'_> {
    /// Print region bounds, usage, every chunk, the non-empty lists and the
    /// allocation bitmap.
    pub fn dump<W: Write>(&self, out: &mut W) -> fmt::Result {
        let stats = self.stats();
        writeln!(
            out,
            "kheap: {:#x} - {:#x} ({} bytes)",
            self.arena.base_addr(),
            self.arena.end_addr(),
            stats.region_bytes
        )?;
        writeln!(
            out,
            "  in use {} / free {} / peak {}  allocs {} frees {} failed {}",
            stats.in_use,
            stats.free_bytes,
            stats.high_water,
            stats.allocations,
            stats.frees,
            stats.failed
        )?;

        writeln!(out, "chunks:")?;
        for item in self.chunks() {
            match item {
                Ok((chunk, tag)) => {
                    let state = if tag.free { "free" } else { "used" };
                    write!(
                        out,
                        "  {:#x} {:>8} {}",
                        self.arena.base_addr() + chunk.offset(),
                        tag.size,
                        state
                    )?;
                    if !tag.free {
                        write_owner(out, tag.owner)?;
                    }
                    writeln!(out)?;
                }
                Err(e) => writeln!(out, "  !! {}", e)?,
            }
        }

        writeln!(out, "lists:")?;
        for list in BinTable::lists() {
            let count = self.bins.len(&self.arena, list);
            if count == 0 {
                continue;
            }
            writeln!(out, "  {:<10} {}", ListName(list), count)?;
        }

        writeln!(out, "bitmap:")?;
        let words = self.bitmap.words(self.arena.len() / GRANULE);
        for (row, chunk) in words.chunks(WORDS_PER_ROW).enumerate() {
            let row_addr = self.arena.base_addr() + row * WORDS_PER_ROW * 64 * GRANULE;
            write!(out, "  {:#x} ", row_addr)?;
            for word in chunk {
                for bit in 0..64 {
                    out.write_char(if *word & (1u64 << bit) != 0 { '#' } else { '.' })?;
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

fn write_owner<W: Write>(out: &mut W, owner: Owner) -> fmt::Result {
    if owner == Owner::KERNEL {
        write!(out, " kernel")
    } else {
        write!(out, " task {}", owner.0)
    }
}

struct ListName(ListId);

impl fmt::Display for ListName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = self.0;
        if list == ListId::RECENT {
            return f.pad("recent");
        }
        if list == ListId::REMAINDER {
            return f.pad("remainder");
        }
        let kind = match list.kind() {
            ListKind::Clean => 'c',
            ListKind::Dirty => 'd',
        };
        let mut buf = label::Label::new();
        write!(buf, "bin {}{}", list.bin(), kind)?;
        f.pad(buf.as_str())
    }
}

mod label {
    use core::fmt;

    /// Fixed-capacity label so `ListName` can honour width flags without
    /// an allocator.
    pub struct Label {
        buf: [u8; 16],
        len: usize,
    }

    impl Label {
        pub fn new() -> Self {
            Self {
                buf: [0; 16],
                len: 0,
            }
        }

        pub fn as_str(&self) -> &str {
            core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
        }
    }

    impl fmt::Write for Label {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let end = self.len + s.len();
            if end > self.buf.len() {
                return Err(fmt::Error);
            }
            self.buf[self.len..end].copy_from_slice(s.as_bytes());
            self.len = end;
            Ok(())
        }
    }
}
