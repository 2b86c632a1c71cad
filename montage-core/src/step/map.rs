//! Position maps produced by steps, and mappings through sequences of them.
//!
//! A [`StepMap`] lists the ranges a step replaced as `(start, old_size,
//! new_size)`. A [`Mapping`] chains maps and records mirror pairs: when a
//! step's inverse and its rebased copy both appear in a mapping, positions
//! inside the content that step inserted are recovered exactly instead of
//! collapsing onto the range boundary.

/// Which side a position sticks to when content is inserted exactly at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRange {
    pub start: usize,
    pub old_size: usize,
    pub new_size: usize,
}

const DEL_BEFORE: u8 = 1;
const DEL_AFTER: u8 = 2;
const DEL_ACROSS: u8 = 4;
const DEL_SIDE: u8 = 8;

/// Where a position inside a replaced range sat, for mirror recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recover {
    index: usize,
    offset: usize,
}

/// A mapped position plus what happened around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResult {
    pub pos: usize,
    del_info: u8,
    recover: Option<Recover>,
}

impl MapResult {
    /// The position's own side was deleted.
    pub fn deleted(&self) -> bool {
        self.del_info & DEL_SIDE > 0
    }

    pub fn deleted_before(&self) -> bool {
        self.del_info & (DEL_BEFORE | DEL_ACROSS) > 0
    }

    pub fn deleted_after(&self) -> bool {
        self.del_info & (DEL_AFTER | DEL_ACROSS) > 0
    }

    pub fn deleted_across(&self) -> bool {
        self.del_info & DEL_ACROSS > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepMap {
    ranges: Vec<MapRange>,
}

impl StepMap {
    /// `ranges` must be sorted by start and non-overlapping.
    pub fn new(ranges: Vec<MapRange>) -> Self {
        Self { ranges }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[MapRange] {
        &self.ranges
    }

    pub fn map(&self, pos: usize, assoc: Assoc) -> usize {
        self.map_result(pos, assoc).pos
    }

    pub fn map_result(&self, pos: usize, assoc: Assoc) -> MapResult {
        let mut diff: isize = 0;
        for (index, range) in self.ranges.iter().enumerate() {
            let start = range.start;
            if start > pos {
                break;
            }
            let end = start + range.old_size;
            if pos <= end {
                let left = if range.old_size == 0 {
                    assoc == Assoc::Before
                } else if pos == start {
                    true
                } else if pos == end {
                    false
                } else {
                    assoc == Assoc::Before
                };
                let shifted = start as isize + diff + if left { 0 } else { range.new_size as isize };
                let boundary = if assoc == Assoc::Before { start } else { end };
                let recover = (pos != boundary).then_some(Recover {
                    index,
                    offset: pos - start,
                });
                let mut del_info = 0;
                if range.old_size > 0 {
                    del_info = if pos == start {
                        DEL_AFTER
                    } else if pos == end {
                        DEL_BEFORE
                    } else {
                        DEL_ACROSS
                    };
                    if pos != boundary {
                        del_info |= DEL_SIDE;
                    }
                }
                return MapResult {
                    pos: shifted.max(0) as usize,
                    del_info,
                    recover,
                };
            }
            diff += range.new_size as isize - range.old_size as isize;
        }
        MapResult {
            pos: (pos as isize + diff).max(0) as usize,
            del_info: 0,
            recover: None,
        }
    }

    /// Position inside range `value.index` in this map's output.
    fn recover(&self, value: Recover) -> usize {
        let diff: isize = self.ranges[..value.index]
            .iter()
            .map(|r| r.new_size as isize - r.old_size as isize)
            .sum();
        (self.ranges[value.index].start as isize + diff) as usize + value.offset
    }

    /// The map of the inverse step, with starts in this map's output space.
    pub fn invert(&self) -> StepMap {
        let mut diff: isize = 0;
        let ranges = self
            .ranges
            .iter()
            .map(|r| {
                let start = (r.start as isize + diff) as usize;
                diff += r.new_size as isize - r.old_size as isize;
                MapRange {
                    start,
                    old_size: r.new_size,
                    new_size: r.old_size,
                }
            })
            .collect();
        StepMap { ranges }
    }
}

/// A chain of step maps with mirror pairs.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    maps: Vec<StepMap>,
    mirrors: Vec<(usize, usize)>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn maps(&self) -> &[StepMap] {
        &self.maps
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn append_map(&mut self, map: StepMap, mirror: Option<usize>) {
        self.maps.push(map);
        if let Some(m) = mirror {
            let n = self.maps.len() - 1;
            self.set_mirror(n, m);
        }
    }

    /// Declare maps `n` and `m` inverses of each other.
    pub fn set_mirror(&mut self, n: usize, m: usize) {
        self.mirrors.push((n, m));
    }

    pub fn get_mirror(&self, n: usize) -> Option<usize> {
        self.mirrors.iter().find_map(|&(a, b)| {
            if a == n {
                Some(b)
            } else if b == n {
                Some(a)
            } else {
                None
            }
        })
    }

    /// The maps from index `from` onward, keeping mirrors inside the window.
    pub fn slice(&self, from: usize) -> Mapping {
        let from = from.min(self.maps.len());
        Mapping {
            maps: self.maps[from..].to_vec(),
            mirrors: self
                .mirrors
                .iter()
                .filter(|&&(a, b)| a >= from && b >= from)
                .map(|&(a, b)| (a - from, b - from))
                .collect(),
        }
    }

    pub fn map(&self, pos: usize, assoc: Assoc) -> usize {
        self.map_result(pos, assoc).pos
    }

    pub fn map_result(&self, mut pos: usize, assoc: Assoc) -> MapResult {
        let mut del_info = 0;
        let mut i = 0;
        while i < self.maps.len() {
            let result = self.maps[i].map_result(pos, assoc);
            if let Some(rec) = result.recover {
                if let Some(corr) = self.get_mirror(i).filter(|&c| c > i) {
                    pos = self.maps[corr].recover(rec);
                    i = corr + 1;
                    continue;
                }
            }
            del_info |= result.del_info;
            pos = result.pos;
            i += 1;
        }
        MapResult {
            pos,
            del_info,
            recover: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(start: usize, old_size: usize, new_size: usize) -> StepMap {
        StepMap::new(vec![MapRange {
            start,
            old_size,
            new_size,
        }])
    }

    #[test]
    fn test_insertion_shifts_following_positions() {
        let m = map(4, 0, 3);
        assert_eq!(m.map(2, Assoc::After), 2);
        assert_eq!(m.map(4, Assoc::Before), 4);
        assert_eq!(m.map(4, Assoc::After), 7);
        assert_eq!(m.map(9, Assoc::After), 12);
        assert!(!m.map_result(4, Assoc::After).deleted_after());
    }

    #[test]
    fn test_deletion_collapses_and_flags() {
        let m = map(2, 4, 0);
        let inside = m.map_result(4, Assoc::After);
        assert_eq!(inside.pos, 2);
        assert!(inside.deleted());
        assert!(inside.deleted_across());

        let at_start = m.map_result(2, Assoc::After);
        assert!(at_start.deleted_after());
        assert!(!at_start.deleted_before());

        let at_end = m.map_result(6, Assoc::Before);
        assert!(at_end.deleted_before());
        assert_eq!(m.map(10, Assoc::After), 6);
    }

    #[test]
    fn test_invert_round_trips_outside_positions() {
        let m = StepMap::new(vec![
            MapRange { start: 1, old_size: 2, new_size: 5 },
            MapRange { start: 10, old_size: 0, new_size: 1 },
        ]);
        let inv = m.invert();
        for pos in [0usize, 5, 9, 20] {
            assert_eq!(inv.map(m.map(pos, Assoc::After), Assoc::After), pos);
        }
        assert_eq!(inv.ranges()[1].start, 13);
    }

    #[test]
    fn test_mirror_recovers_inserted_positions() {
        // a step inserted 3 tokens at 5; its inverse then a rebased copy at 8
        let original = map(5, 0, 3);
        let mut mapping = Mapping::new();
        mapping.append_map(original.invert(), None);
        mapping.append_map(map(0, 0, 3), None);
        mapping.append_map(map(8, 0, 3), Some(0));
        // position 6 sat inside the inserted content; it follows the copy
        assert_eq!(mapping.map(6, Assoc::After), 9);
        // positions outside behave as a plain chain
        assert_eq!(mapping.map(2, Assoc::After), 5);
    }

    #[test]
    fn test_slice_keeps_inner_mirrors() {
        let mut mapping = Mapping::new();
        mapping.append_map(map(0, 0, 1), None);
        mapping.append_map(map(3, 2, 0), None);
        mapping.append_map(map(3, 0, 2), Some(1));
        let sliced = mapping.slice(1);
        assert_eq!(sliced.len(), 2);
        assert_eq!(sliced.get_mirror(0), Some(1));
        assert_eq!(mapping.slice(2).get_mirror(0), None);
    }
}
