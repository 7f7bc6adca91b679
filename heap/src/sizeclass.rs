//! Size classes.
//!
//! Small objects are rounded up to one of 67 classes chosen so that tail
//! waste per span stays below 12.5%. Class 0 stands for large objects,
//! which get a dedicated span. Lookup tables are built at compile time.

/// Heap page size. Spans are whole pages.
pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Largest size served from a size class.
pub const MAX_SMALL_SIZE: usize = 32768;

/// Pointer-free allocations below this size share a tiny block.
pub const TINY_SIZE: usize = 16;

pub const NUM_SIZE_CLASSES: usize = 68;
pub const NUM_SPAN_CLASSES: usize = NUM_SIZE_CLASSES << 1;

pub const WORD: usize = size_of::<usize>();

const SMALL_SIZE_DIV: usize = 8;
const SMALL_SIZE_MAX: usize = 1024;
const LARGE_SIZE_DIV: usize = 128;

#[rustfmt::skip]
pub const CLASS_TO_SIZE: [u32; NUM_SIZE_CLASSES] = [
    0, 8, 16, 24, 32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224,
    240, 256, 288, 320, 352, 384, 416, 448, 480, 512, 576, 640, 704, 768, 896,
    1024, 1152, 1280, 1408, 1536, 1792, 2048, 2304, 2688, 3072, 3200, 3456,
    4096, 4864, 5376, 6144, 6528, 6784, 6912, 8192, 9472, 9728, 10240, 10880,
    12288, 13568, 14336, 16384, 18432, 19072, 20480, 21760, 24576, 27264,
    28672, 32768,
];

#[rustfmt::skip]
pub const CLASS_TO_NPAGES: [u8; NUM_SIZE_CLASSES] = [
    0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 1, 2, 1, 2, 1, 3, 2, 3, 1, 3, 2, 3, 4, 5,
    6, 1, 7, 6, 5, 4, 3, 5, 7, 2, 9, 7, 5, 8, 3, 10, 7, 4,
];

const fn build_small() -> [u8; SMALL_SIZE_MAX / SMALL_SIZE_DIV + 1] {
    let mut table = [0u8; SMALL_SIZE_MAX / SMALL_SIZE_DIV + 1];
    let mut i = 0;
    while i < table.len() {
        let size = (i * SMALL_SIZE_DIV) as u32;
        let mut class = 1;
        while CLASS_TO_SIZE[class] < size {
            class += 1;
        }
        table[i] = class as u8;
        i += 1;
    }
    table
}

const fn build_large() -> [u8; (MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV + 1] {
    let mut table = [0u8; (MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV + 1];
    let mut i = 0;
    while i < table.len() {
        let size = (SMALL_SIZE_MAX + i * LARGE_SIZE_DIV) as u32;
        let mut class = 1;
        while CLASS_TO_SIZE[class] < size {
            class += 1;
        }
        table[i] = class as u8;
        i += 1;
    }
    table
}

static SIZE_TO_CLASS8: [u8; SMALL_SIZE_MAX / SMALL_SIZE_DIV + 1] = build_small();
static SIZE_TO_CLASS128: [u8; (MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV + 1] =
    build_large();

/// Size class for a small allocation of `size` bytes.
#[inline]
#[must_use]
pub fn size_to_class(size: usize) -> u8 {
    debug_assert!(size <= MAX_SMALL_SIZE);
    if size <= SMALL_SIZE_MAX {
        SIZE_TO_CLASS8[size.div_ceil(SMALL_SIZE_DIV)]
    } else {
        SIZE_TO_CLASS128[(size - SMALL_SIZE_MAX).div_ceil(LARGE_SIZE_DIV)]
    }
}

#[inline]
#[must_use]
pub fn class_size(class: u8) -> usize {
    CLASS_TO_SIZE[class as usize] as usize
}

#[inline]
#[must_use]
pub fn class_npages(class: u8) -> usize {
    CLASS_TO_NPAGES[class as usize] as usize
}

/// Objects that fit in one span of `class`.
#[inline]
#[must_use]
pub fn class_nelems(class: u8) -> usize {
    class_npages(class) * PAGE_SIZE / class_size(class)
}

/// Size an allocation of `size` bytes actually occupies.
#[must_use]
pub fn round_up_size(size: usize) -> usize {
    if size <= MAX_SMALL_SIZE {
        class_size(size_to_class(size))
    } else {
        size.div_ceil(PAGE_SIZE) * PAGE_SIZE
    }
}

/// Size class combined with the no-scan bit. Objects of a no-scan class
/// contain no pointers and are never scanned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpanClass(u8);

impl SpanClass {
    #[inline]
    #[must_use]
    pub const fn new(sizeclass: u8, noscan: bool) -> Self {
        Self((sizeclass << 1) | noscan as u8)
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn sizeclass(self) -> u8 {
        self.0 >> 1
    }

    #[inline]
    #[must_use]
    pub const fn noscan(self) -> bool {
        self.0 & 1 != 0
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for SpanClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SpanClass({}{})",
            self.sizeclass(),
            if self.noscan() { ",noscan" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_monotone_and_word_aligned() {
        for c in 2..NUM_SIZE_CLASSES {
            assert!(CLASS_TO_SIZE[c] > CLASS_TO_SIZE[c - 1]);
            assert_eq!(CLASS_TO_SIZE[c] as usize % WORD, 0);
        }
        assert_eq!(CLASS_TO_SIZE[NUM_SIZE_CLASSES - 1] as usize, MAX_SMALL_SIZE);
    }

    #[test]
    fn every_class_fills_its_span() {
        for c in 1..NUM_SIZE_CLASSES as u8 {
            let span_bytes = class_npages(c) * PAGE_SIZE;
            let n = class_nelems(c);
            assert!(n >= 1, "class {c}");
            let waste = span_bytes - n * class_size(c);
            assert!(waste * 8 <= span_bytes, "class {c} wastes {waste} bytes");
        }
    }

    #[test]
    fn lookup_picks_smallest_fitting_class() {
        for size in 1..=MAX_SMALL_SIZE {
            let c = size_to_class(size);
            assert!(class_size(c) >= size, "size {size}");
            assert!(class_size(c - 1) < size || c == 1, "size {size}");
        }
    }

    #[test]
    fn known_sizes() {
        assert_eq!(size_to_class(0), 1);
        assert_eq!(size_to_class(8), 1);
        assert_eq!(size_to_class(9), 2);
        assert_eq!(size_to_class(1024), 32);
        assert_eq!(size_to_class(1025), 33);
        assert_eq!(round_up_size(33), 48);
        assert_eq!(round_up_size(40_000), 5 * PAGE_SIZE);
    }

    #[test]
    fn span_class_packs_noscan_bit() {
        let sc = SpanClass::new(5, true);
        assert_eq!(sc.sizeclass(), 5);
        assert!(sc.noscan());
        assert_eq!(sc.raw(), 11);
        assert!(!SpanClass::new(5, false).noscan());
        assert_eq!(SpanClass::new(67, true).index(), NUM_SPAN_CLASSES - 1);
    }
}
