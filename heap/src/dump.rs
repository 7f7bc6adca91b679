//! Heap dump.
//!
//! A stream of records, every field an unsigned LEB128 varint:
//!
//! ```text
//! magic "rtheapdump1\n"
//! PARAMS       word_size page_size heap_start heap_end nprocs
//! SPAN         base npages spanclass elemsize nelems alloc_count
//! OBJECT       addr size noscan nedges (word_offset target)*
//! ROOT         kind task value
//! FINALIZER    obj arg
//! QUEUED       obj arg
//! MEMSTATS     n (name_len name_bytes value)*
//! END
//! ```
//!
//! Objects list only their non-zero pointer words as edges. The world is
//! stopped and sweeping finished while the dump is written.

use std::io::{self, BufWriter, Read, Write};

use crate::{
    error::DumpError,
    gc::{RootKind, World, barrier::load_ptr},
    heap::HeapInner,
    sizeclass::{PAGE_SIZE, WORD},
    span::SpanState,
};

const MAGIC: &[u8] = b"rtheapdump1\n";

const TAG_END: u64 = 0;
const TAG_PARAMS: u64 = 1;
const TAG_SPAN: u64 = 2;
const TAG_OBJECT: u64 = 3;
const TAG_ROOT: u64 = 4;
const TAG_FINALIZER: u64 = 5;
const TAG_QUEUED: u64 = 6;
const TAG_MEMSTATS: u64 = 7;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpParams {
    pub word_size: u64,
    pub page_size: u64,
    pub heap_start: u64,
    pub heap_end: u64,
    pub nprocs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSpan {
    pub base: u64,
    pub npages: u64,
    pub spanclass: u8,
    pub elemsize: u64,
    pub nelems: u64,
    pub alloc_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpObject {
    pub addr: u64,
    pub size: u64,
    pub noscan: bool,
    /// `(word offset, target)` for each non-zero pointer word.
    pub edges: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRoot {
    pub kind: RootKind,
    pub value: u64,
}

#[derive(Debug, Clone, Default)]
pub struct HeapDump {
    pub params: DumpParams,
    pub spans: Vec<DumpSpan>,
    pub objects: Vec<DumpObject>,
    pub roots: Vec<DumpRoot>,
    pub finalizers: Vec<(u64, u64)>,
    pub queued_finalizers: Vec<(u64, u64)>,
    pub memstats: Vec<(String, u64)>,
}

impl HeapDump {
    pub fn object(&self, addr: u64) -> Option<&DumpObject> {
        self.objects
            .binary_search_by_key(&addr, |o| o.addr)
            .ok()
            .map(|i| &self.objects[i])
    }

    pub fn memstat(&self, name: &str) -> Option<u64> {
        self.memstats
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, v)| v)
    }
}

// ── Writing ───────────────────────────────────────────────────────────

struct Encoder<W: Write> {
    out: W,
}

impl<W: Write> Encoder<W> {
    fn uvarint(&mut self, mut v: u64) -> io::Result<()> {
        let mut buf = [0u8; 10];
        let mut n = 0;
        while v >= 0x80 {
            buf[n] = (v as u8) | 0x80;
            v >>= 7;
            n += 1;
        }
        buf[n] = v as u8;
        self.out.write_all(&buf[..=n])
    }

    fn fields(&mut self, fields: &[u64]) -> io::Result<()> {
        for &f in fields {
            self.uvarint(f)?;
        }
        Ok(())
    }

    fn bytes(&mut self, b: &[u8]) -> io::Result<()> {
        self.uvarint(b.len() as u64)?;
        self.out.write_all(b)
    }
}

impl HeapInner {
    /// Write a heap dump to `out`. Finishes a running mark phase first.
    pub fn write_dump(&self, world: &dyn World, out: impl Write) -> Result<(), DumpError> {
        if self.gc.phase().barrier_enabled() {
            self.finish_cycle(world, self.gc.cycle());
        }
        world.stop_the_world("heap dump");
        self.finish_sweep();
        world.handshake(&|cache| cache.flush_stats());
        let result = self.write_dump_stopped(world, out);
        world.start_the_world();
        if result.is_ok() {
            log::info!("heap dump written");
        }
        result
    }

    fn write_dump_stopped(&self, world: &dyn World, out: impl Write) -> Result<(), DumpError> {
        let mut enc = Encoder {
            out: BufWriter::new(out),
        };
        enc.out.write_all(MAGIC)?;
        enc.fields(&[
            TAG_PARAMS,
            WORD as u64,
            PAGE_SIZE as u64,
            self.pages.start() as u64,
            self.pages.committed_end() as u64,
            world.nprocs() as u64,
        ])?;

        for span in self.pages.spans() {
            if span.state() != SpanState::InUse {
                continue;
            }
            enc.fields(&[
                TAG_SPAN,
                span.base() as u64,
                span.npages() as u64,
                span.spanclass().raw() as u64,
                span.elemsize() as u64,
                span.nelems() as u64,
                span.alloc_count() as u64,
            ])?;
            let noscan = span.spanclass().noscan();
            let mut objects = Vec::new();
            self.objects_in(span, |obj| objects.push(obj));
            for obj in objects {
                let edges = if noscan {
                    Vec::new()
                } else {
                    self.pointer_words(obj, span.elemsize())
                };
                enc.fields(&[
                    TAG_OBJECT,
                    obj as u64,
                    span.elemsize() as u64,
                    noscan as u64,
                    edges.len() as u64,
                ])?;
                for (off, target) in edges {
                    enc.fields(&[off, target])?;
                }
            }
        }

        let mut roots = Vec::new();
        world.visit_roots(&mut |kind, _, value| roots.push((kind, value)));
        for (kind, value) in roots {
            let (code, task) = kind.code();
            enc.fields(&[TAG_ROOT, code, task, value as u64])?;
        }

        let mut specials = Vec::new();
        self.specials
            .for_each(|obj, c| specials.push((obj as u64, c.arg as u64)));
        for (obj, arg) in specials {
            enc.fields(&[TAG_FINALIZER, obj, arg])?;
        }
        for item in self.finq.pending() {
            enc.fields(&[TAG_QUEUED, item.obj as u64, item.arg as u64])?;
        }

        let metrics = self.metrics();
        enc.fields(&[TAG_MEMSTATS, metrics.len() as u64])?;
        for (name, value) in metrics {
            enc.bytes(name.as_bytes())?;
            enc.uvarint(value)?;
        }
        enc.uvarint(TAG_END)?;
        enc.out.flush()?;
        Ok(())
    }

    fn pointer_words(&self, obj: usize, size: usize) -> Vec<(u64, u64)> {
        let mut edges = Vec::new();
        for word in 0..size / WORD {
            let addr = obj + word * WORD;
            let Some(arena) = self.pages.arena_of(addr) else {
                break;
            };
            if !arena.is_pointer(addr) {
                continue;
            }
            // SAFETY: world stopped, `addr` is a word of an allocated object
            let value = unsafe { load_ptr(addr) };
            if value != 0 {
                edges.push((word as u64, value as u64));
            }
        }
        edges
    }
}

// ── Reading ───────────────────────────────────────────────────────────

struct Decoder<R: Read> {
    input: R,
}

impl<R: Read> Decoder<R> {
    fn uvarint(&mut self) -> Result<u64, DumpError> {
        let mut v = 0u64;
        let mut shift = 0;
        loop {
            let mut b = [0u8];
            match self.input.read_exact(&mut b) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(DumpError::Truncated);
                }
                Err(e) => return Err(e.into()),
            }
            if shift >= 64 {
                return Err(DumpError::BadHeader);
            }
            v |= u64::from(b[0] & 0x7f) << shift;
            if b[0] & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
        }
    }

    fn string(&mut self) -> Result<String, DumpError> {
        let len = self.uvarint()? as usize;
        let mut buf = vec![0u8; len];
        self.input
            .read_exact(&mut buf)
            .map_err(|_| DumpError::Truncated)?;
        String::from_utf8(buf).map_err(|_| DumpError::BadHeader)
    }
}

/// Parse a dump written by [`HeapInner::write_dump`].
pub fn read_dump(input: impl Read) -> Result<HeapDump, DumpError> {
    let mut dec = Decoder { input };
    let mut magic = [0u8; MAGIC.len()];
    dec.input
        .read_exact(&mut magic)
        .map_err(|_| DumpError::BadHeader)?;
    if magic != MAGIC {
        return Err(DumpError::BadHeader);
    }

    let mut dump = HeapDump::default();
    loop {
        match dec.uvarint()? {
            TAG_END => break,
            TAG_PARAMS => {
                dump.params = DumpParams {
                    word_size: dec.uvarint()?,
                    page_size: dec.uvarint()?,
                    heap_start: dec.uvarint()?,
                    heap_end: dec.uvarint()?,
                    nprocs: dec.uvarint()?,
                };
            }
            TAG_SPAN => dump.spans.push(DumpSpan {
                base: dec.uvarint()?,
                npages: dec.uvarint()?,
                spanclass: dec.uvarint()? as u8,
                elemsize: dec.uvarint()?,
                nelems: dec.uvarint()?,
                alloc_count: dec.uvarint()?,
            }),
            TAG_OBJECT => {
                let addr = dec.uvarint()?;
                let size = dec.uvarint()?;
                let noscan = dec.uvarint()? != 0;
                let n = dec.uvarint()?;
                let mut edges = Vec::new();
                for _ in 0..n {
                    edges.push((dec.uvarint()?, dec.uvarint()?));
                }
                dump.objects.push(DumpObject {
                    addr,
                    size,
                    noscan,
                    edges,
                });
            }
            TAG_ROOT => {
                let code = dec.uvarint()?;
                let task = dec.uvarint()?;
                dump.roots.push(DumpRoot {
                    kind: RootKind::from_code(code, task),
                    value: dec.uvarint()?,
                });
            }
            TAG_FINALIZER => dump.finalizers.push((dec.uvarint()?, dec.uvarint()?)),
            TAG_QUEUED => dump
                .queued_finalizers
                .push((dec.uvarint()?, dec.uvarint()?)),
            TAG_MEMSTATS => {
                let n = dec.uvarint()?;
                for _ in 0..n {
                    let name = dec.string()?;
                    dump.memstats.push((name, dec.uvarint()?));
                }
            }
            tag => return Err(DumpError::UnknownTag(tag)),
        }
    }
    dump.objects.sort_by_key(|o| o.addr);
    Ok(dump)
}
