use crate::vehicles::vehicle::{Vehicle, VehicleId};
use indexmap::IndexMap;
use std::ops::{Deref, DerefMut};

/// Storage for the vehicles owned by the engine.
///
/// Wraps an `IndexMap<VehicleId, Vehicle>` so iteration order is the
/// insertion (spawn) order, a requirement for bit-reproducible runs,
/// while keeping the concrete map type out of the public API.
/// Deref/DerefMut expose the full map API where needed.
#[derive(Debug, Default)]
pub struct VehiclesStorage(IndexMap<VehicleId, Vehicle>);

impl VehiclesStorage {
    /// Create empty vehicles storage
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Insert a vehicle by its id (vehicle.id is used as the key)
    pub fn insert_vehicle(&mut self, vehicle: Vehicle) {
        let id = vehicle.id;
        self.0.insert(id, vehicle);
    }

    /// Ids of all active vehicles sorted by position ascending. This is
    /// the per-tick update order, which is part of the engine contract.
    pub fn ids_by_position(&self) -> Vec<VehicleId> {
        let mut ids: Vec<(VehicleId, f64)> =
            self.0.values().filter(|v| !v.finished).map(|v| (v.id, v.pos)).collect();
        ids.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        ids.into_iter().map(|(id, _)| id).collect()
    }

    /// Removes and returns every finished vehicle, preserving order.
    pub fn drain_finished(&mut self) -> Vec<Vehicle> {
        let finished_ids: Vec<VehicleId> =
            self.0.values().filter(|v| v.finished).map(|v| v.id).collect();
        let mut finished = Vec::with_capacity(finished_ids.len());
        for id in finished_ids {
            // shift_remove keeps the insertion order of the remainder,
            // which swap_remove would not.
            if let Some(v) = self.0.shift_remove(&id) {
                finished.push(v);
            }
        }
        finished
    }
}

impl Deref for VehiclesStorage {
    type Target = IndexMap<VehicleId, Vehicle>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl DerefMut for VehiclesStorage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<'a> IntoIterator for &'a VehiclesStorage {
    type Item = (&'a VehicleId, &'a Vehicle);
    type IntoIter = indexmap::map::Iter<'a, VehicleId, Vehicle>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a mut VehiclesStorage {
    type Item = (&'a VehicleId, &'a mut Vehicle);
    type IntoIter = indexmap::map::IterMut<'a, VehicleId, Vehicle>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter_mut()
    }
}
