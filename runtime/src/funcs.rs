//! Function table.
//!
//! Every function that pushes frames registers its local count and, per
//! range of pc values, which locals hold pointers. Stack scans and stack
//! copies look frames up here by the function id stored in the frame.

use std::{fmt, ops::Range, sync::Arc};

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub(crate) u32);

impl FuncId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone)]
pub struct FuncInfo {
    pub name: String,
    pub nlocals: usize,
    maps: Vec<(Range<u32>, Vec<u64>)>,
}

impl FuncInfo {
    /// A function whose locals never hold pointers until maps are added.
    pub fn new(name: impl Into<String>, nlocals: usize) -> Self {
        Self {
            name: name.into(),
            nlocals,
            maps: Vec::new(),
        }
    }

    /// Locals selected by `bits` hold pointers while the pc is in `pcs`.
    #[must_use]
    pub fn map(mut self, pcs: Range<u32>, bits: &[u64]) -> Self {
        self.maps.push((pcs, bits.to_vec()));
        self
    }

    /// Same map for every pc.
    #[must_use]
    pub fn pointers(self, bits: &[u64]) -> Self {
        self.map(0..u32::MAX, bits)
    }

    /// Pointer bits at `pc`. A function without any map has none anywhere.
    pub fn pointers_at(&self, pc: u32) -> Option<&[u64]> {
        if self.maps.is_empty() {
            return Some(&[]);
        }
        self.maps
            .iter()
            .find(|(pcs, _)| pcs.contains(&pc))
            .map(|(_, bits)| bits.as_slice())
    }
}

impl fmt::Debug for FuncInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncInfo")
            .field("name", &self.name)
            .field("nlocals", &self.nlocals)
            .field("maps", &self.maps.len())
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct FuncTable {
    funcs: RwLock<Vec<Arc<FuncInfo>>>,
}

impl FuncTable {
    pub(crate) fn register(&self, info: FuncInfo) -> FuncId {
        let mut funcs = self.funcs.write();
        funcs.push(Arc::new(info));
        FuncId(funcs.len() as u32 - 1)
    }

    pub(crate) fn get(&self, id: FuncId) -> Option<Arc<FuncInfo>> {
        self.funcs.read().get(id.index()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_by_pc() {
        let table = FuncTable::default();
        let plain = table.register(FuncInfo::new("plain", 2));
        let mapped = table.register(
            FuncInfo::new("mapped", 4)
                .map(0..10, &[0b0001])
                .map(10..20, &[0b1010]),
        );
        assert_eq!(table.get(plain).unwrap().pointers_at(99), Some(&[][..]));
        let f = table.get(mapped).unwrap();
        assert_eq!(f.pointers_at(3), Some(&[0b0001][..]));
        assert_eq!(f.pointers_at(15), Some(&[0b1010][..]));
        assert_eq!(f.pointers_at(20), None);
        assert!(table.get(FuncId(7)).is_none());
    }
}
