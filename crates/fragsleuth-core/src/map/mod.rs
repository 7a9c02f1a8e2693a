/// Compressed, colour-coded occupancy grid of the volume.
///
/// A volume with a billion clusters cannot afford a colour per cluster, so
/// the map is split into a fixed number of cells. In the usual layout each
/// cell covers many clusters and keeps a count per colour; the colour with
/// the largest count wins when the map is rendered. When the volume has
/// fewer clusters than the map has cells, each cluster covers several
/// cells instead and a cell holds exactly one colour.
pub mod color;

pub use color::{file_color, is_mft, SpaceColor};

type CellCounts = [u64; SpaceColor::COUNT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// Map size zero: painting is a no-op.
    Disabled,
    /// Many clusters per cell.
    Normal {
        clusters_per_cell: u64,
        clusters_per_last_cell: u64,
        used_cells: usize,
    },
    /// Many cells per cluster.
    Opposite { cells_per_cluster: u64 },
}

#[derive(Debug, Clone)]
pub struct ClusterMap {
    cells: Vec<CellCounts>,
    layout: Layout,
    unused_cells: usize,
    total_clusters: u64,
}

impl ClusterMap {
    pub fn disabled() -> Self {
        Self {
            cells: Vec::new(),
            layout: Layout::Disabled,
            unused_cells: 0,
            total_clusters: 0,
        }
    }

    /// Allocate a map of `map_size` cells covering `total_clusters`.
    pub fn new(map_size: usize, total_clusters: u64) -> Self {
        if map_size == 0 || total_clusters == 0 {
            return Self::disabled();
        }

        let size = map_size as u64;
        let mut clusters_per_cell = total_clusters / size;
        let (layout, unused_cells) = if clusters_per_cell != 0 {
            if clusters_per_cell * size != total_clusters {
                clusters_per_cell += 1;
            }
            let used = total_clusters.div_ceil(clusters_per_cell);
            let layout = Layout::Normal {
                clusters_per_cell,
                clusters_per_last_cell: total_clusters - clusters_per_cell * (used - 1),
                used_cells: used as usize,
            };
            (layout, (size - used) as usize)
        } else {
            let cells_per_cluster = size / total_clusters;
            let unused = size - cells_per_cluster * total_clusters;
            (Layout::Opposite { cells_per_cluster }, unused as usize)
        };
        tracing::debug!(
            "cluster map: {map_size} cells for {total_clusters} clusters, {unused_cells} unused, {layout:?}"
        );

        let mut map = Self {
            cells: vec![[0; SpaceColor::COUNT]; map_size],
            layout,
            unused_cells,
            total_clusters,
        };
        map.reset();
        map
    }

    pub fn is_enabled(&self) -> bool {
        self.layout != Layout::Disabled
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Paint every used cell with the default colour and the tail with
    /// `Unused`.
    pub fn reset(&mut self) {
        let default = SpaceColor::DEFAULT.index();
        let unused = SpaceColor::Unused.index();
        let used = self.cells.len() - self.unused_cells;
        for cell in self.cells.iter_mut() {
            *cell = [0; SpaceColor::COUNT];
        }
        match self.layout {
            Layout::Disabled => {}
            Layout::Normal {
                clusters_per_cell,
                clusters_per_last_cell,
                ..
            } => {
                for (i, cell) in self.cells.iter_mut().enumerate() {
                    if i + 1 < used {
                        cell[default] = clusters_per_cell;
                    } else if i + 1 == used {
                        cell[default] = clusters_per_last_cell;
                    } else {
                        cell[unused] = clusters_per_cell;
                    }
                }
            }
            Layout::Opposite { .. } => {
                for (i, cell) in self.cells.iter_mut().enumerate() {
                    cell[if i < used { default } else { unused }] = 1;
                }
            }
        }
    }

    /// Move `length` clusters starting at `lcn` from `old` to `new`.
    ///
    /// Regions outside the volume are ignored. Painting `MftZone` adds to
    /// the cell without taking anything away.
    pub fn colorize(&mut self, lcn: u64, length: u64, new: SpaceColor, old: SpaceColor) {
        if length == 0 || new == old || lcn >= self.total_clusters {
            return;
        }
        if lcn + length > self.total_clusters {
            return;
        }
        let keep_old = new == SpaceColor::MftZone;
        let (new, old) = (new.index(), old.index());

        match self.layout {
            Layout::Disabled => {}
            Layout::Normal {
                clusters_per_cell,
                clusters_per_last_cell,
                used_cells,
            } => {
                let mut cell = (lcn / clusters_per_cell) as usize;
                let mut offset = lcn % clusters_per_cell;
                let mut remaining = length;
                while remaining > 0 && cell < used_cells {
                    let capacity = if cell + 1 == used_cells {
                        clusters_per_last_cell
                    } else {
                        clusters_per_cell
                    };
                    let n = remaining.min(capacity.saturating_sub(offset));
                    if n == 0 {
                        break;
                    }
                    let counts = &mut self.cells[cell];
                    counts[new] += n;
                    if !keep_old {
                        counts[old] = counts[old].saturating_sub(n);
                    }
                    remaining -= n;
                    cell += 1;
                    offset = 0;
                }
            }
            Layout::Opposite { cells_per_cluster } => {
                let first = (lcn * cells_per_cluster) as usize;
                let count = (length * cells_per_cluster) as usize;
                for counts in &mut self.cells[first..first + count] {
                    if !keep_old {
                        *counts = [0; SpaceColor::COUNT];
                    }
                    counts[new] = 1;
                }
            }
        }
    }

    /// Resolve every cell to a single colour.
    ///
    /// A cell that is entirely MFT zone and entirely free renders as MFT
    /// zone; otherwise the largest count wins, later colours winning ties,
    /// and free / MFT zone counts are ignored inside a full MFT zone cell.
    pub fn render(&self) -> Vec<SpaceColor> {
        let used = self.cells.len() - self.unused_cells;
        let zone = SpaceColor::MftZone.index();
        let free = SpaceColor::Free.index();

        self.cells
            .iter()
            .enumerate()
            .map(|(i, counts)| {
                let full = match self.layout {
                    Layout::Normal {
                        clusters_per_cell,
                        clusters_per_last_cell,
                        ..
                    } => {
                        if i + 1 == used {
                            clusters_per_last_cell
                        } else {
                            clusters_per_cell
                        }
                    }
                    _ => 1,
                };
                let zone_detected = counts[zone] >= full;
                let free_detected = counts[free] >= full;
                if zone_detected && free_detected {
                    return SpaceColor::MftZone;
                }

                let mut maximum = counts[0];
                let mut index = 0;
                for (k, &n) in counts.iter().enumerate().skip(1) {
                    if n >= maximum && ((k != zone && k != free) || !zone_detected) {
                        maximum = n;
                        index = k;
                    }
                }
                if maximum == 0 {
                    SpaceColor::DEFAULT
                } else {
                    SpaceColor::from_index(index)
                }
            })
            .collect()
    }

    #[cfg(test)]
    fn count(&self, cell: usize, color: SpaceColor) -> u64 {
        self.cells[cell][color.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_layout_allocation() {
        // 10 clusters over 4 cells: 3 per cell, 4 cells used, last holds 1.
        let map = ClusterMap::new(4, 10);
        assert_eq!(map.count(0, SpaceColor::System), 3);
        assert_eq!(map.count(3, SpaceColor::System), 1);
        // 9 clusters over 4 cells: 3 per cell, only 3 cells used.
        let map = ClusterMap::new(4, 9);
        assert_eq!(map.count(2, SpaceColor::System), 3);
        assert_eq!(map.count(3, SpaceColor::Unused), 3);
        assert_eq!(map.render()[3], SpaceColor::Unused);
    }

    #[test]
    fn test_opposite_layout() {
        // 3 clusters over 8 cells: 2 cells per cluster, 2 unused.
        let mut map = ClusterMap::new(8, 3);
        map.colorize(1, 1, SpaceColor::Free, SpaceColor::System);
        let rendered = map.render();
        assert_eq!(
            rendered,
            vec![
                SpaceColor::System,
                SpaceColor::System,
                SpaceColor::Free,
                SpaceColor::Free,
                SpaceColor::System,
                SpaceColor::System,
                SpaceColor::Unused,
                SpaceColor::Unused,
            ]
        );
    }

    #[test]
    fn test_colorize_spans_cells() {
        let mut map = ClusterMap::new(10, 100);
        map.colorize(5, 20, SpaceColor::Free, SpaceColor::System);
        assert_eq!(map.count(0, SpaceColor::Free), 5);
        assert_eq!(map.count(0, SpaceColor::System), 5);
        assert_eq!(map.count(1, SpaceColor::Free), 10);
        assert_eq!(map.count(2, SpaceColor::Free), 5);
        let rendered = map.render();
        // equal counts: the later colour wins
        assert_eq!(rendered[0], SpaceColor::System);
        assert_eq!(rendered[1], SpaceColor::Free);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut map = ClusterMap::new(10, 100);
        map.colorize(95, 10, SpaceColor::Free, SpaceColor::System);
        map.colorize(0, 0, SpaceColor::Free, SpaceColor::System);
        map.colorize(0, 10, SpaceColor::System, SpaceColor::System);
        assert!(map.render().iter().all(|&c| c == SpaceColor::System));
    }

    #[test]
    fn test_mft_zone_rendering() {
        let mut map = ClusterMap::new(10, 100);
        map.colorize(0, 20, SpaceColor::Free, SpaceColor::System);
        map.colorize(0, 10, SpaceColor::MftZone, SpaceColor::Unused);
        map.colorize(10, 10, SpaceColor::MftZone, SpaceColor::Unused);
        map.colorize(15, 5, SpaceColor::Unfragmented, SpaceColor::Free);
        let rendered = map.render();
        // free MFT zone
        assert_eq!(rendered[0], SpaceColor::MftZone);
        // MFT zone holding file data shows the data
        assert_eq!(rendered[1], SpaceColor::Unfragmented);
        assert_eq!(map.count(0, SpaceColor::Free), 10);
    }

    #[test]
    fn test_disabled_map() {
        let mut map = ClusterMap::new(0, 100);
        assert!(!map.is_enabled());
        map.colorize(0, 10, SpaceColor::Free, SpaceColor::System);
        assert!(map.render().is_empty());
    }
}
