use crate::vehicles::vehicle::VehicleId;
use std::collections::HashMap;

/// Default cell size, meters.
pub const DEFAULT_CELL_SIZE: f64 = 100.0;

/// Where a vehicle currently sits in the grid. Refreshed on every
/// `update`, so the longitudinal position is at most one tick stale.
#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexedPosition {
    lane: usize,
    cell: usize,
    pos: f64,
}

/// Grid index over the road, keyed by `(lane, cell)`.
///
/// Each cell holds the ids of the vehicles inside it; a reverse map
/// gives O(1) removal and makes mid-tick lane changes cheap to reflect.
/// Queries walk only the cells within `k` of the focal cell, so the cost
/// per query is bounded by the vehicles in those cells.
#[derive(Debug)]
pub struct SpatialIndex {
    cell_size: f64,
    num_cells: usize,
    num_lanes: usize,
    grid: HashMap<(usize, usize), Vec<VehicleId>>,
    reverse: HashMap<VehicleId, IndexedPosition>,
}

impl SpatialIndex {
    /// Creates an empty index covering `road_length_m` meters of
    /// `num_lanes` lanes.
    pub fn new(road_length_m: f64, num_lanes: usize, cell_size: f64) -> Self {
        let num_cells = (road_length_m / cell_size) as usize + 1;
        SpatialIndex {
            cell_size,
            num_cells,
            num_lanes,
            grid: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Cell index for a longitudinal position, clamped to the road.
    pub fn cell_of(&self, pos: f64) -> usize {
        if pos <= 0.0 {
            return 0;
        }
        ((pos / self.cell_size) as usize).min(self.num_cells - 1)
    }

    /// Number of vehicles currently indexed.
    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }

    /// Removes everything.
    pub fn clear(&mut self) {
        self.grid.clear();
        self.reverse.clear();
    }

    /// Adds a vehicle. A second add of the same id degenerates to an
    /// update.
    pub fn add(&mut self, id: VehicleId, lane: usize, pos: f64) {
        if self.reverse.contains_key(&id) {
            self.update(id, lane, pos);
            return;
        }
        let cell = self.cell_of(pos);
        self.grid.entry((lane, cell)).or_default().push(id);
        self.reverse.insert(id, IndexedPosition { lane, cell, pos });
    }

    /// Removes a vehicle via the reverse map. Unknown ids are a no-op.
    pub fn remove(&mut self, id: VehicleId) {
        let Some(indexed) = self.reverse.remove(&id) else {
            return;
        };
        if let Some(members) = self.grid.get_mut(&(indexed.lane, indexed.cell)) {
            members.retain(|&member| member != id);
        }
    }

    /// Reflects a vehicle's new lane/position. No-op on the grid when
    /// the cell is unchanged; the cached position is always refreshed.
    pub fn update(&mut self, id: VehicleId, lane: usize, pos: f64) {
        let new_cell = self.cell_of(pos);
        match self.reverse.get_mut(&id) {
            Some(indexed) => {
                let old_key = (indexed.lane, indexed.cell);
                indexed.pos = pos;
                if indexed.lane == lane && indexed.cell == new_cell {
                    return;
                }
                indexed.lane = lane;
                indexed.cell = new_cell;
                if let Some(members) = self.grid.get_mut(&old_key) {
                    members.retain(|&member| member != id);
                }
                self.grid.entry((lane, new_cell)).or_default().push(id);
            }
            None => self.add(id, lane, pos),
        }
    }

    /// Clears and re-adds the given vehicles. Used when the active set
    /// changes size significantly between ticks.
    pub fn rebuild(&mut self, vehicles: impl Iterator<Item = (VehicleId, usize, f64)>) {
        self.clear();
        for (id, lane, pos) in vehicles {
            self.add(id, lane, pos);
        }
    }

    /// Ids of all vehicles within `k` cells of the focal position, on
    /// any lane, excluding the focal id itself.
    pub fn neighbors(&self, focal: VehicleId, pos: f64, k: usize) -> Vec<VehicleId> {
        let center = self.cell_of(pos) as i64;
        let mut found = Vec::new();
        for lane in 0..self.num_lanes {
            for delta in -(k as i64)..=(k as i64) {
                let cell = center + delta;
                if cell < 0 || cell as usize >= self.num_cells {
                    continue;
                }
                if let Some(members) = self.grid.get(&(lane, cell as usize)) {
                    found.extend(members.iter().copied().filter(|&id| id != focal));
                }
            }
        }
        found
    }

    /// Nearest vehicle ahead of the focal position in the given lane,
    /// scanning forward cells only.
    pub fn leader(&self, focal: VehicleId, lane: usize, pos: f64, k: usize) -> Option<VehicleId> {
        let center = self.cell_of(pos);
        let mut best: Option<(VehicleId, f64)> = None;
        for cell in center..=(center + k).min(self.num_cells - 1) {
            if let Some(members) = self.grid.get(&(lane, cell)) {
                for &id in members {
                    if id == focal {
                        continue;
                    }
                    let Some(indexed) = self.reverse.get(&id) else { continue };
                    let dist = indexed.pos - pos;
                    if dist > 0.0 && best.is_none_or(|(_, d)| dist < d) {
                        best = Some((id, dist));
                    }
                }
            }
        }
        best.map(|(id, _)| id)
    }

    /// Nearest vehicle behind the focal position in the target lane,
    /// scanning backward cells only.
    pub fn follower(
        &self,
        focal: VehicleId,
        target_lane: usize,
        pos: f64,
        k: usize,
    ) -> Option<VehicleId> {
        let center = self.cell_of(pos);
        let mut best: Option<(VehicleId, f64)> = None;
        for cell in center.saturating_sub(k)..=center {
            if let Some(members) = self.grid.get(&(target_lane, cell)) {
                for &id in members {
                    if id == focal {
                        continue;
                    }
                    let Some(indexed) = self.reverse.get(&id) else { continue };
                    let dist = pos - indexed.pos;
                    if dist > 0.0 && best.is_none_or(|(_, d)| dist < d) {
                        best = Some((id, dist));
                    }
                }
            }
        }
        best.map(|(id, _)| id)
    }

    /// Cells holding at least `threshold` vehicles, for seeding the
    /// phantom-jam scan. Sorted so callers iterate deterministically.
    pub fn cells_with_density(&self, threshold: usize) -> Vec<(usize, usize)> {
        let mut cells: Vec<(usize, usize)> = self
            .grid
            .iter()
            .filter(|(_, members)| members.len() >= threshold)
            .map(|(&key, _)| key)
            .collect();
        cells.sort_unstable();
        cells
    }

    /// Number of vehicles in one cell.
    pub fn cell_count(&self, lane: usize, cell: usize) -> usize {
        self.grid.get(&(lane, cell)).map_or(0, |members| members.len())
    }
}
