//! Memory simulator: a sorted page table mirroring the guest mappings held by
//! the CPU engine. The [`crate::task::Task`] keeps it in sync with every
//! map/unmap/protect it issues, so the core can answer mapping queries
//! without calling into the engine.

mod pages;

pub use pages::{FileBacking, Page, Pages};

use crate::cpu::Prot;

#[derive(Debug, Default)]
pub struct MemSim {
    mem: Pages,
}

impl MemSim {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mem(&self) -> &Pages {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut Pages {
        &mut self.mem
    }

    pub fn add(&mut self, page: Page) {
        self.mem.insert(page);
    }

    /// Removes `[addr, addr+size)` from the table. Pages partially covered
    /// are split; the pieces outside the range survive.
    pub fn unmap(&mut self, addr: u64, size: u64) {
        let mut kept = Vec::with_capacity(self.mem.0.len());
        for mut page in self.mem.0.drain(..) {
            match page.intersect(addr, size) {
                None => kept.push(page),
                Some((start, len)) => {
                    let (left, right) = page.split(start, len);
                    if let Some(l) = left {
                        kept.push(l);
                    }
                    if let Some(r) = right {
                        kept.push(r);
                    }
                    // the middle piece is the unmapped range, drop it
                }
            }
        }
        kept.sort_by_key(|p| p.addr);
        self.mem.0 = kept;
    }

    /// Changes the protection of `[addr, addr+size)`, splitting boundary
    /// pages so that every resulting page has a single protection.
    pub fn prot(&mut self, addr: u64, size: u64, prot: Prot) {
        let mut result = Vec::with_capacity(self.mem.0.len());
        for mut page in self.mem.0.drain(..) {
            match page.intersect(addr, size) {
                None => result.push(page),
                Some((start, len)) => {
                    let (left, right) = page.split(start, len);
                    if let Some(l) = left {
                        result.push(l);
                    }
                    page.prot = prot;
                    result.push(page);
                    if let Some(r) = right {
                        result.push(r);
                    }
                }
            }
        }
        result.sort_by_key(|p| p.addr);
        self.mem.0 = result;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_with(addr: u64, size: u64) -> MemSim {
        let mut sim = MemSim::new();
        sim.add(Page::new(addr, size, Prot::READ | Prot::WRITE));
        sim
    }

    fn ranges(sim: &MemSim) -> Vec<(u64, u64, Prot)> {
        sim.mem().iter().map(|p| (p.addr, p.size, p.prot)).collect()
    }

    #[test]
    fn test_unmap_middle_splits() {
        let mut sim = sim_with(0x1000, 0x3000);
        sim.unmap(0x2000, 0x1000);
        assert_eq!(
            ranges(&sim),
            vec![
                (0x1000, 0x1000, Prot::READ | Prot::WRITE),
                (0x3000, 0x1000, Prot::READ | Prot::WRITE),
            ]
        );
    }

    #[test]
    fn test_unmap_whole_range_restores_prior_state() {
        let mut sim = sim_with(0x1000, 0x2000);
        let before = ranges(&sim);
        sim.add(Page::new(0x8000, 0x1000, Prot::READ));
        sim.unmap(0x8000, 0x1000);
        assert_eq!(ranges(&sim), before, "map then unmap must revert exactly");
    }

    #[test]
    fn test_unmap_spanning_multiple_pages() {
        let mut sim = MemSim::new();
        sim.add(Page::new(0x1000, 0x1000, Prot::READ));
        sim.add(Page::new(0x2000, 0x1000, Prot::READ));
        sim.add(Page::new(0x3000, 0x1000, Prot::READ));
        sim.unmap(0x1800, 0x2000);
        assert_eq!(
            ranges(&sim),
            vec![(0x1000, 0x800, Prot::READ), (0x3800, 0x800, Prot::READ)]
        );
    }

    #[test]
    fn test_prot_splits_boundary_pages() {
        let mut sim = sim_with(0x1000, 0x3000);
        sim.prot(0x2000, 0x1000, Prot::READ);
        assert_eq!(
            ranges(&sim),
            vec![
                (0x1000, 0x1000, Prot::READ | Prot::WRITE),
                (0x2000, 0x1000, Prot::READ),
                (0x3000, 0x1000, Prot::READ | Prot::WRITE),
            ]
        );
    }

    #[test]
    fn test_pages_stay_sorted_and_disjoint() {
        let mut sim = MemSim::new();
        sim.add(Page::new(0x4000, 0x1000, Prot::ALL));
        sim.add(Page::new(0x1000, 0x2000, Prot::READ));
        sim.prot(0x1000, 0x1000, Prot::ALL);
        sim.unmap(0x4800, 0x100);
        let mut last_end = 0;
        for page in sim.mem().iter() {
            assert!(page.addr >= last_end, "pages must be sorted and disjoint");
            last_end = page.addr + page.size;
        }
    }
}
