use crate::alerts::context::AlertContext;
use crate::alerts::rules::{AlertRuleEngine, default_rules};
use crate::config::{ConfigError, SimulationConfig};
use crate::engine::states::{
    EngineCommand, ProgressUpdate, SimulationState, SnapshotFrame, StepOutput, VehicleSnapshot,
};
use crate::engine::trace::{
    EtcDetectionOutput, PhantomJamEvent, QueueEvent, RuleEngineOutput, RunArtifact, RunStatistics,
    SafetyRecord, SegmentFlowRecord, TrajectoryPoint, VehicleRecord,
};
use crate::etc::detector::EtcDetector;
use crate::etc::noise::{NoiseEvent, NoiseStage};
use crate::etc::transaction::{EtcTransaction, TransactionStatus};
use crate::lane_change::mobil::BlockedLanes;
use crate::road::{GantryId, Road};
use crate::spatial::spatial_index::{DEFAULT_CELL_SIZE, SpatialIndex};
use crate::spawner::spawner::VehicleSpawner;
use crate::utils::units::{kmh_to_ms, ms_to_kmh};
use crate::vehicles::anomaly::{AnomalyLogEntry, AnomalyPhase, AnomalyType};
use crate::vehicles::storage::VehiclesStorage;
use crate::vehicles::vehicle::{NeighborView, Vehicle, VehicleId};
use crate::verbose::{
    EVENT_ANOMALY_TRIGGER, EVENT_RUN_COMPLETE, EVENT_RUN_START, EVENT_SPAWN_DEFERRED, EVENT_STEP,
};
use crate::{log_additional, log_main};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Neighbor query range, in cells, around the focal vehicle.
const NEIGHBOR_RANGE_CELLS: usize = 3;
/// Length of road that must be clear to admit a spawn, meters.
const SPAWN_CLEARANCE_M: f64 = 50.0;
/// Trailing transaction window handed to the rule engine.
const CONTEXT_TRANSACTION_WINDOW: usize = 100;
/// Trailing event window handed to the rule engine, seconds.
const CONTEXT_ALERT_HISTORY_S: f64 = 300.0;

/// Programmer errors detected by the engine's assertions. These abort
/// the run with a diagnostic; the partial trace up to the last completed
/// tick stays readable through [`SimulationEngine::artifact`].
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Speed or position stopped being finite
    NonFinite { vehicle_id: VehicleId, tick: u64, pos: f64, speed: f64 },
    /// Lane index escaped `[0, num_lanes)`
    LaneOutOfRange { vehicle_id: VehicleId, tick: u64, lane: usize, num_lanes: usize },
    /// A vehicle was finalized twice
    DoubleFinish { vehicle_id: VehicleId, tick: u64 },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NonFinite { vehicle_id, tick, pos, speed } => write!(
                f,
                "Vehicle {} has non-finite state at tick {}: pos={}, speed={}",
                vehicle_id, tick, pos, speed
            ),
            EngineError::LaneOutOfRange { vehicle_id, tick, lane, num_lanes } => write!(
                f,
                "Vehicle {} left the lane range at tick {}: lane={} of {}",
                vehicle_id, tick, lane, num_lanes
            ),
            EngineError::DoubleFinish { vehicle_id, tick } => {
                write!(f, "Vehicle {} finalized twice, second time at tick {}", vehicle_id, tick)
            }
        }
    }
}

impl std::error::Error for EngineError {}

/// The simulation engine: owns all world state, advances it one fixed
/// time step per [`step`](Self::step) call.
///
/// Single-threaded cooperative: the tick is the only unit of progress,
/// every mutation happens inside it, and per-vehicle updates run in
/// position-ascending order (observable, part of the contract). All
/// stochastic choices draw from one `StdRng` seeded from the
/// configuration, so identical configurations produce identical traces.
///
/// # Example
/// ```rust
/// use etc_traffic_sim_core::config::SimulationConfig;
/// use etc_traffic_sim_core::engine::SimulationEngine;
///
/// let mut config = SimulationConfig::default();
/// config.total_vehicles = 5;
/// config.max_simulation_time = 60.0;
/// let mut engine = SimulationEngine::new(config).unwrap();
/// let out = engine.step().unwrap();
/// assert_eq!(out.tick, 0);
/// ```
#[derive(Debug)]
pub struct SimulationEngine {
    config: SimulationConfig,
    road: Road,
    rng: StdRng,

    spawn_schedule: Vec<f64>,
    spawn_idx: usize,

    vehicles: VehiclesStorage,
    finished: Vec<Vehicle>,
    finalized_ids: HashSet<VehicleId>,
    index: SpatialIndex,

    detector: EtcDetector,
    noise: NoiseStage,
    rule_engine: AlertRuleEngine,

    clock: f64,
    tick: u64,
    next_vehicle_id: VehicleId,
    state: SimulationState,
    stop_requested: bool,
    run_id: String,

    // Accumulating trace buffers
    anomaly_logs: Vec<AnomalyLogEntry>,
    trajectory_data: Vec<TrajectoryPoint>,
    segment_speed_history: Vec<SegmentFlowRecord>,
    queue_events: Vec<QueueEvent>,
    phantom_jam_events: Vec<PhantomJamEvent>,
    safety_data: Vec<SafetyRecord>,
    noise_events: Vec<NoiseEvent>,
}

impl SimulationEngine {
    /// Builds an engine for the given configuration. Fails loudly on a
    /// structurally invalid record; a run never starts from one.
    pub fn new(config: SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(config.random_seed);
        let road = Road::from_config(&config);
        // Admission window sized from the target count (~5 vehicles per
        // 10 s), leaving the rest of the horizon for traversal.
        let spawn_span = ((config.total_vehicles as f64 / 5.0) * 10.0).max(60.0);
        let spawner = VehicleSpawner::new(config.total_vehicles, config.num_lanes)
            .with_custom_profile(vec![(0.0, 1.0), (spawn_span, 1.0)])
            .build(&mut rng);
        let spawn_schedule = spawner.spawn_times().to_vec();

        let mut detector = EtcDetector::new();
        for gantry in road.gantries() {
            detector.register_gantry(&gantry.id, gantry.position_km);
        }

        let mut rule_engine = AlertRuleEngine::new();
        for rule in default_rules() {
            rule_engine.add_rule(rule).expect("default rule set is valid");
        }

        let index = SpatialIndex::new(road.length_m(), config.num_lanes, DEFAULT_CELL_SIZE);
        let noise = NoiseStage::new(config.noise.clone());

        log_main!(
            EVENT_RUN_START,
            "engine constructed",
            total_vehicles = config.total_vehicles,
            seed = config.random_seed
        );

        Ok(SimulationEngine {
            config,
            road,
            rng,
            spawn_schedule,
            spawn_idx: 0,
            vehicles: VehiclesStorage::new(),
            finished: Vec::new(),
            finalized_ids: HashSet::new(),
            index,
            detector,
            noise,
            rule_engine,
            clock: 0.0,
            tick: 0,
            next_vehicle_id: 0,
            state: SimulationState::Created,
            stop_requested: false,
            run_id: Uuid::new_v4().to_string(),
            anomaly_logs: Vec::new(),
            trajectory_data: Vec::new(),
            segment_speed_history: Vec::new(),
            queue_events: Vec::new(),
            phantom_jam_events: Vec::new(),
            safety_data: Vec::new(),
            noise_events: Vec::new(),
        })
    }

    /// Current simulation clock, seconds.
    pub fn clock(&self) -> f64 {
        self.clock
    }

    /// Ticks completed so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Engine lifecycle state.
    pub fn state(&self) -> SimulationState {
        self.state
    }

    /// Number of vehicles currently on the road.
    pub fn active_count(&self) -> usize {
        self.vehicles.len()
    }

    /// Number of vehicles that completed the road.
    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    /// Requests a stop; honored at the top of the next tick, which
    /// completes before the engine returns.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Applies a shell control message.
    pub fn handle_command(&mut self, command: EngineCommand) -> Result<(), ConfigError> {
        match command {
            EngineCommand::Init(config) => {
                *self = SimulationEngine::new(*config)?;
            }
            EngineCommand::Start | EngineCommand::Resume => {
                if self.state == SimulationState::Created
                    || self.state == SimulationState::Paused
                {
                    self.state = SimulationState::Running;
                }
            }
            EngineCommand::Pause => {
                if self.state == SimulationState::Running {
                    self.state = SimulationState::Paused;
                }
            }
            EngineCommand::Stop => self.request_stop(),
            EngineCommand::Reset => {
                *self = SimulationEngine::new(self.config.clone())?;
            }
        }
        Ok(())
    }

    /// Forces an anomaly of the given kind onto a live vehicle. Used to
    /// script incidents into otherwise clean runs.
    pub fn inject_anomaly(&mut self, vehicle_id: VehicleId, kind: AnomalyType) -> bool {
        let clock = self.clock;
        let Some(vehicle) = self.vehicles.get_mut(&vehicle_id) else {
            return false;
        };
        let segment = self.road.segment_index(vehicle.pos);
        let pos = vehicle.pos;
        if let Some(log) =
            vehicle.anomaly.force_activate(vehicle_id, kind, clock, pos, segment, &mut self.rng)
        {
            self.anomaly_logs.push(log);
            true
        } else {
            false
        }
    }

    /// Whether the run has consumed its schedule and emptied the road,
    /// or exhausted the time horizon.
    fn run_complete(&self) -> bool {
        self.clock > self.config.max_simulation_time
            || (self.spawn_idx >= self.spawn_schedule.len() && self.vehicles.is_empty())
    }

    /// Executes one tick. Never fails for traffic reasons; an `Err` is a
    /// programmer error caught by the engine's assertions.
    pub fn step(&mut self) -> Result<StepOutput, EngineError> {
        let mut out = StepOutput { time: self.clock, tick: self.tick, ..StepOutput::default() };

        if self.state == SimulationState::Finished || self.state == SimulationState::Stopped {
            out.done = true;
            return Ok(out);
        }
        if self.state == SimulationState::Paused {
            return Ok(out);
        }
        if self.stop_requested {
            self.state = SimulationState::Stopped;
            out.done = true;
            return Ok(out);
        }
        if self.run_complete() {
            self.state = SimulationState::Finished;
            out.done = true;
            return Ok(out);
        }
        if self.state == SimulationState::Created {
            self.state = SimulationState::Running;
        }

        // 1. Admit spawns.
        self.admit_spawns(&mut out);

        // 2. Materialize the active set and rebuild the index.
        let active_ids = self.vehicles.ids_by_position();
        self.index.rebuild(self.vehicles.values().map(|v| (v.id, v.lane, v.pos)));

        // 3. Blocked lanes from active full stops.
        let blocked = self.collect_blocked_lanes();

        // 4. Per-vehicle update, position-ascending.
        self.update_vehicles(&active_ids, &blocked, &mut out)?;

        // 5. Gantry crossings through noise into the detector.
        self.process_gantries(&active_ids, &mut out);

        // 6. Trajectory points and segment flow records.
        let (segment_speeds, segment_densities) = self.append_traces(&active_ids);

        // 7. Queue and phantom-jam detection.
        let queue_lengths = self.detect_queues(&active_ids);
        self.detect_phantom_jams(&active_ids);

        // 8. Alert context and rule evaluation.
        let context =
            self.build_context(&active_ids, segment_speeds, segment_densities, queue_lengths);
        out.rule_events = self.rule_engine.evaluate_all(&context);

        // 9. Finalize finished vehicles.
        self.finalize(&mut out)?;

        // 10. Advance the clock.
        self.clock += self.config.simulation_dt;
        self.tick += 1;

        log_additional!(
            EVENT_STEP,
            "tick complete",
            tick = self.tick,
            active = self.vehicles.len(),
            finished = self.finished.len()
        );

        if self.run_complete() {
            self.state = SimulationState::Finished;
            out.done = true;
            log_main!(
                EVENT_RUN_COMPLETE,
                "run complete",
                ticks = self.tick,
                finished = self.finished.len()
            );
        }
        Ok(out)
    }

    /// Drives the engine until the run completes or a stop is honored.
    pub fn run(&mut self) -> Result<(), EngineError> {
        self.state = SimulationState::Running;
        loop {
            let out = self.step()?;
            if out.done {
                return Ok(());
            }
        }
    }

    fn admit_spawns(&mut self, out: &mut StepOutput) {
        while self.spawn_idx < self.spawn_schedule.len()
            && self.spawn_schedule[self.spawn_idx] <= self.clock
        {
            let mut lanes: Vec<usize> = (0..self.config.num_lanes).collect();
            lanes.shuffle(&mut self.rng);

            let mut placed = false;
            for lane in lanes {
                let clear = self
                    .vehicles
                    .values()
                    .all(|v| v.lane != lane || v.pos >= SPAWN_CLEARANCE_M);
                if clear {
                    let vehicle = Vehicle::spawn(
                        self.next_vehicle_id,
                        self.clock,
                        lane,
                        &self.config,
                        &mut self.rng,
                    );
                    out.spawned.push(vehicle.id);
                    self.index.add(vehicle.id, vehicle.lane, vehicle.pos);
                    self.vehicles.insert_vehicle(vehicle);
                    self.next_vehicle_id += 1;
                    placed = true;
                    break;
                }
            }

            if placed {
                self.spawn_idx += 1;
            } else {
                // Every lane entrance occupied: push this spawn one
                // second out and retry next tick.
                self.spawn_schedule[self.spawn_idx] += 1.0;
                log_additional!(
                    EVENT_SPAWN_DEFERRED,
                    "entrance blocked",
                    spawn_idx = self.spawn_idx,
                    clock = self.clock
                );
                break;
            }
        }
    }

    fn collect_blocked_lanes(&self) -> BlockedLanes {
        let mut blocked = BlockedLanes::new();
        for vehicle in self.vehicles.values() {
            if vehicle.anomaly.is_full_stop_active() {
                blocked.entry(vehicle.lane).or_default().push(vehicle.pos);
            }
        }
        blocked
    }

    fn update_vehicles(
        &mut self,
        active_ids: &[VehicleId],
        blocked: &BlockedLanes,
        out: &mut StepOutput,
    ) -> Result<(), EngineError> {
        let num_segments = self.road.num_segments();
        let dt = self.config.simulation_dt;

        for &id in active_ids {
            let pos = {
                let Some(vehicle) = self.vehicles.get_mut(&id) else { continue };
                let segment = self.road.segment_index(vehicle.pos);
                vehicle.record_time(self.clock, segment, num_segments);
                if vehicle.finished {
                    continue;
                }
                if let Some(log) =
                    vehicle.trigger_anomaly(self.clock, segment, &self.config, &mut self.rng)
                {
                    log_additional!(
                        EVENT_ANOMALY_TRIGGER,
                        "anomaly activated",
                        vehicle_id = log.vehicle_id,
                        kind = log.anomaly_type
                    );
                    out.anomaly_logs.push(log.clone());
                    self.anomaly_logs.push(log);
                }
                vehicle.pos
            };

            let neighbor_ids = self.index.neighbors(id, pos, NEIGHBOR_RANGE_CELLS);
            let neighbors: Vec<NeighborView> = neighbor_ids
                .iter()
                .filter_map(|nid| self.vehicles.get(nid).map(|n| n.view()))
                .collect();

            let Some(vehicle) = self.vehicles.get_mut(&id) else { continue };
            vehicle.update(dt, &neighbors, blocked, self.clock, &self.config);

            if !vehicle.pos.is_finite() || !vehicle.speed.is_finite() {
                return Err(EngineError::NonFinite {
                    vehicle_id: id,
                    tick: self.tick,
                    pos: vehicle.pos,
                    speed: vehicle.speed,
                });
            }
            if vehicle.lane >= self.config.num_lanes {
                return Err(EngineError::LaneOutOfRange {
                    vehicle_id: id,
                    tick: self.tick,
                    lane: vehicle.lane,
                    num_lanes: self.config.num_lanes,
                });
            }

            let (lane, new_pos) = (vehicle.lane, vehicle.pos);
            self.index.update(id, lane, new_pos);
        }
        Ok(())
    }

    fn process_gantries(&mut self, active_ids: &[VehicleId], out: &mut StepOutput) {
        let mut crossings: Vec<EtcTransaction> = Vec::new();

        for &id in active_ids {
            let Some(vehicle) = self.vehicles.get_mut(&id) else { continue };
            if vehicle.finished {
                continue;
            }
            let pos_km = vehicle.pos / 1000.0;
            for gantry in self.road.gantries() {
                if !gantry.in_crossing_window(pos_km) {
                    continue;
                }
                if !vehicle.mark_gantry_crossed(&gantry.id) {
                    continue;
                }
                let status = if vehicle.anomaly.is_active() {
                    TransactionStatus::Anomaly
                } else {
                    TransactionStatus::Normal
                };
                crossings.push(EtcTransaction::raw(
                    vehicle.id,
                    gantry.id.clone(),
                    gantry.position_km,
                    self.clock,
                    vehicle.lane,
                    vehicle.speed,
                    status,
                ));
                if vehicle.anomaly.is_active() && !vehicle.detected_by_etc {
                    vehicle.detected_by_etc = true;
                    if let Some(trigger) = vehicle.anomaly.trigger_time {
                        vehicle.etc_detection_delay = Some(self.clock - trigger);
                    }
                }
            }
        }

        for raw in crossings {
            let (transactions, events) = self.noise.process(raw, &mut self.rng);
            for event in events {
                out.noise_events.push(event.clone());
                self.noise_events.push(event);
            }
            for tx in transactions {
                out.transactions.push(tx.clone());
                if let Some(alert) = self.detector.record_transaction(tx) {
                    out.detector_alerts.push(alert);
                }
            }
        }
    }

    /// Appends trajectory, safety and segment-flow records. Returns the
    /// per-segment average speeds and densities for the alert context.
    fn append_traces(
        &mut self,
        active_ids: &[VehicleId],
    ) -> (BTreeMap<usize, f64>, BTreeMap<usize, f64>) {
        let num_segments = self.road.num_segments();
        let mut segment_speeds: BTreeMap<usize, Vec<f64>> = BTreeMap::new();

        for &id in active_ids {
            let Some(vehicle) = self.vehicles.get(&id) else { continue };
            if vehicle.finished {
                continue;
            }
            self.trajectory_data.push(TrajectoryPoint {
                id: vehicle.id,
                pos: vehicle.pos,
                time: self.clock,
                lane: vehicle.lane,
                speed: vehicle.speed,
                anomaly_state: vehicle.anomaly.phase.to_string(),
                anomaly_type: vehicle.anomaly.kind.code(),
                vehicle_type: vehicle.class.to_string(),
                driver_style: vehicle.style.to_string(),
                is_affected: vehicle.is_affected,
            });
            self.safety_data.push(SafetyRecord {
                time: self.clock,
                vehicle_id: vehicle.id,
                vehicle_type: vehicle.class.to_string(),
                driver_style: vehicle.style.to_string(),
                speed_kmh: ms_to_kmh(vehicle.speed),
                pos: vehicle.pos,
                min_ttc: vehicle.safety.min_ttc,
                max_decel: vehicle.safety.max_decel,
                brake_count: vehicle.safety.brake_count,
                emergency_brake_count: vehicle.safety.emergency_brake_count,
            });

            let segment = self.road.segment_index(vehicle.pos);
            if segment < num_segments {
                segment_speeds.entry(segment).or_default().push(vehicle.speed);
            }
        }

        let mut avg_speeds = BTreeMap::new();
        let mut densities = BTreeMap::new();
        for (segment, speeds) in segment_speeds {
            let avg = speeds.iter().sum::<f64>() / speeds.len() as f64;
            let density = speeds.len() as f64 / self.config.segment_length_km;
            self.segment_speed_history.push(SegmentFlowRecord {
                time: self.clock,
                segment,
                avg_speed: avg,
                density,
                flow: avg * density,
            });
            avg_speeds.insert(segment, avg);
            densities.insert(segment, density);
        }
        (avg_speeds, densities)
    }

    /// Queue detection: a segment with enough sub-threshold vehicles is
    /// a queue. Returns queue lengths keyed by the nearest downstream
    /// gantry for the alert context.
    fn detect_queues(&mut self, active_ids: &[VehicleId]) -> BTreeMap<GantryId, f64> {
        let threshold = kmh_to_ms(self.config.queue_speed_threshold);
        let mut slow_by_segment: BTreeMap<usize, Vec<f64>> = BTreeMap::new();

        for &id in active_ids {
            let Some(vehicle) = self.vehicles.get(&id) else { continue };
            if vehicle.finished || vehicle.speed >= threshold {
                continue;
            }
            let segment = self.road.segment_index(vehicle.pos);
            if segment < self.road.num_segments() {
                slow_by_segment.entry(segment).or_default().push(vehicle.pos);
            }
        }

        let mut queue_lengths = BTreeMap::new();
        for (segment, mut positions) in slow_by_segment {
            if positions.len() < self.config.queue_min_vehicles {
                continue;
            }
            positions.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let queue_start = positions[0];
            let queue_end = positions[positions.len() - 1];
            let queue_length = queue_end - queue_start;
            self.queue_events.push(QueueEvent {
                time: self.clock,
                segment,
                queue_start,
                queue_end,
                queue_length,
                vehicle_count: positions.len(),
            });
            if let Some(gantry) = self
                .road
                .gantries()
                .iter()
                .find(|g| g.position_km * 1000.0 >= queue_end)
            {
                let entry = queue_lengths.entry(gantry.id.clone()).or_insert(0.0);
                if queue_length > *entry {
                    *entry = queue_length;
                }
            }
        }
        queue_lengths
    }

    /// Phantom-jam witnesses: slow vehicles whose nearest leader is
    /// either absent or neither near nor slow.
    fn detect_phantom_jams(&mut self, active_ids: &[VehicleId]) {
        let speed_threshold = kmh_to_ms(self.config.phantom_jam_speed);
        let detect_dist = self.config.phantom_jam_dist;
        let range_cells = (detect_dist / DEFAULT_CELL_SIZE).ceil() as usize;

        for &id in active_ids {
            let Some(vehicle) = self.vehicles.get(&id) else { continue };
            if vehicle.finished || vehicle.speed >= speed_threshold {
                continue;
            }
            let slow_obstacle_ahead = self
                .index
                .leader(id, vehicle.lane, vehicle.pos, range_cells)
                .and_then(|lid| self.vehicles.get(&lid))
                .is_some_and(|leader| {
                    leader.pos - vehicle.pos < detect_dist && leader.speed < speed_threshold
                });
            if !slow_obstacle_ahead {
                self.phantom_jam_events.push(PhantomJamEvent {
                    time: self.clock,
                    vehicle_id: vehicle.id,
                    position_km: vehicle.pos / 1000.0,
                    speed_kmh: ms_to_kmh(vehicle.speed),
                    lane: vehicle.lane,
                });
            }
        }
    }

    fn build_context(
        &self,
        active_ids: &[VehicleId],
        segment_avg_speeds: BTreeMap<usize, f64>,
        segment_densities: BTreeMap<usize, f64>,
        queue_lengths: BTreeMap<GantryId, f64>,
    ) -> AlertContext {
        let mut context = AlertContext {
            current_time: self.clock,
            gantry_stats: self.detector.stats_snapshots(),
            recent_transactions: self
                .detector
                .transactions()
                .iter()
                .rev()
                .take(CONTEXT_TRANSACTION_WINDOW)
                .rev()
                .cloned()
                .collect(),
            noise_stats: self.noise.statistics(),
            weather: self.config.weather,
            queue_lengths,
            segment_avg_speeds,
            segment_densities,
            recent_alert_events: self
                .rule_engine
                .recent_events(CONTEXT_ALERT_HISTORY_S, self.clock),
            ..AlertContext::default()
        };
        for &id in active_ids {
            let Some(vehicle) = self.vehicles.get(&id) else { continue };
            if vehicle.finished {
                continue;
            }
            context.vehicle_speeds.insert(id, vehicle.speed);
            context.vehicle_positions.insert(id, vehicle.pos);
            context.vehicle_lanes.insert(id, vehicle.lane);
            context.vehicle_anomaly_phases.insert(id, vehicle.anomaly.phase);
        }
        context
    }

    fn finalize(&mut self, out: &mut StepOutput) -> Result<(), EngineError> {
        for vehicle in self.vehicles.drain_finished() {
            if !self.finalized_ids.insert(vehicle.id) {
                return Err(EngineError::DoubleFinish { vehicle_id: vehicle.id, tick: self.tick });
            }
            self.index.remove(vehicle.id);
            out.finished.push(vehicle.id);
            self.finished.push(vehicle);
        }
        Ok(())
    }

    /// PROGRESS frame for the live viewer.
    pub fn progress(&self) -> ProgressUpdate {
        let total = self.config.max_simulation_time;
        let active_anomalies = self
            .vehicles
            .values()
            .filter(|v| v.anomaly.phase == AnomalyPhase::Active)
            .count();
        ProgressUpdate {
            current_time: self.clock,
            total_time: total,
            progress: (self.clock / total).min(1.0),
            active_vehicles: self.vehicles.len(),
            completed_vehicles: self.finished.len(),
            active_anomalies,
            eta: (total - self.clock).max(0.0),
        }
    }

    /// SNAPSHOT frame at the current tick boundary.
    pub fn snapshot(&self) -> SnapshotFrame {
        SnapshotFrame {
            time: self.clock,
            vehicles: self
                .vehicles
                .values()
                .map(|v| VehicleSnapshot::of(v, self.config.lane_width))
                .collect(),
        }
    }

    /// The run artifact accumulated so far. Available mid-run and after
    /// an abort, carrying the trace up to the last completed tick.
    pub fn artifact(&self) -> RunArtifact {
        RunArtifact {
            run_id: self.run_id.clone(),
            config: self.config.clone(),
            statistics: RunStatistics {
                total_spawned: self.next_vehicle_id as usize,
                total_finished: self.finished.len(),
                total_active: self.vehicles.len(),
                total_lane_changes: self
                    .finished
                    .iter()
                    .map(|v| v.lane_changes as u64)
                    .chain(self.vehicles.values().map(|v| v.lane_changes as u64))
                    .sum(),
                total_anomalies: self.anomaly_logs.len(),
                total_transactions: self.detector.transactions().len(),
                total_detector_alerts: self.detector.alerts().len(),
                total_noise_events: self.noise_events.len(),
                total_rule_events: self.rule_engine.events().len(),
                total_queue_events: self.queue_events.len(),
                total_phantom_jam_events: self.phantom_jam_events.len(),
                ticks: self.tick,
            },
            anomaly_logs: self.anomaly_logs.clone(),
            trajectory_data: self.trajectory_data.clone(),
            segment_speed_history: self.segment_speed_history.clone(),
            queue_events: self.queue_events.clone(),
            phantom_jam_events: self.phantom_jam_events.clone(),
            safety_data: self.safety_data.clone(),
            vehicle_records: self.finished.iter().map(VehicleRecord::of).collect(),
            etc_detection: EtcDetectionOutput {
                transactions: self.detector.transactions().to_vec(),
                alerts: self.detector.alerts().to_vec(),
                gate_stats: self.detector.stats_snapshots(),
                noise_events: self.noise_events.clone(),
            },
            rule_engine: RuleEngineOutput {
                events: self.rule_engine.events().to_vec(),
                engine_stats: self.rule_engine.stats(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.road_length_km = 4.0;
        config.segment_length_km = 2.0;
        config.num_lanes = 2;
        config.total_vehicles = 6;
        config.max_simulation_time = 600.0;
        config.anomaly_ratio = 0.0;
        config.noise.enabled = false;
        config
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut config = small_config();
        config.num_lanes = 0;
        assert!(SimulationEngine::new(config).is_err());
    }

    #[test]
    fn test_invariants_hold_every_tick() {
        let mut engine = SimulationEngine::new(small_config()).unwrap();
        for _ in 0..600 {
            let out = engine.step().unwrap();
            for vehicle in engine.vehicles.values() {
                assert!(vehicle.lane < 2);
                assert!(vehicle.speed >= 0.0);
                assert!(vehicle.speed <= 1.1 * vehicle.v0 + 1e-9);
                assert!(vehicle.pos.is_finite());
            }
            if out.done {
                break;
            }
        }
    }

    #[test]
    fn test_all_vehicles_finish_small_run() {
        let mut engine = SimulationEngine::new(small_config()).unwrap();
        engine.run().unwrap();
        assert_eq!(engine.finished_count(), 6);
        assert_eq!(engine.active_count(), 0);
        for vehicle in &engine.finished {
            assert!(vehicle.exit_time.is_some());
            // Segment log covers both segments with out >= in.
            for timing in vehicle.segment_log.values() {
                assert!(timing.exit >= timing.entry);
            }
            assert!(vehicle.segment_log.contains_key(&0));
            assert!(vehicle.segment_log.contains_key(&1));
        }
    }

    #[test]
    fn test_no_anomalies_in_clean_run() {
        let mut engine = SimulationEngine::new(small_config()).unwrap();
        engine.run().unwrap();
        assert!(engine.artifact().anomaly_logs.is_empty());
    }

    #[test]
    fn test_gantry_credited_once_per_vehicle() {
        let mut engine = SimulationEngine::new(small_config()).unwrap();
        engine.run().unwrap();
        let artifact = engine.artifact();
        let mut seen = HashSet::new();
        for tx in &artifact.etc_detection.transactions {
            assert!(
                seen.insert((tx.vehicle_id, tx.gantry_id.clone())),
                "vehicle {} credited twice at {}",
                tx.vehicle_id,
                tx.gantry_id
            );
        }
        // Road has one gantry at km 2; every finished vehicle crossed it.
        assert_eq!(artifact.etc_detection.transactions.len(), 6);
    }

    #[test]
    fn test_stop_flag_honored_at_tick_boundary() {
        let mut engine = SimulationEngine::new(small_config()).unwrap();
        engine.step().unwrap();
        engine.request_stop();
        let out = engine.step().unwrap();
        assert!(out.done);
        assert_eq!(engine.state(), SimulationState::Stopped);
        // Partial artifact still readable.
        let artifact = engine.artifact();
        assert_eq!(artifact.statistics.ticks, 1);
    }

    #[test]
    fn test_injected_full_stop_blocks_lane() {
        let mut config = small_config();
        config.total_vehicles = 12;
        config.max_simulation_time = 900.0;
        let mut engine = SimulationEngine::new(config).unwrap();
        // Let the first vehicles get moving.
        let mut guard = 0;
        while engine.active_count() == 0 && guard < 1000 {
            engine.step().unwrap();
            guard += 1;
        }
        for _ in 0..10 {
            engine.step().unwrap();
        }
        let victim = *engine.vehicles.ids_by_position().last().expect("vehicles on road");
        assert!(engine.inject_anomaly(victim, AnomalyType::FullStop));
        for _ in 0..60 {
            engine.step().unwrap();
        }
        let stopped = engine.vehicles.get(&victim);
        if let Some(v) = stopped {
            assert!(v.anomaly.is_full_stop_active());
            assert!(v.speed < 1.0, "injected full stop must brake to a halt");
        }
        assert_eq!(engine.artifact().anomaly_logs.len(), 1);
    }

    #[test]
    fn test_reset_restores_fresh_state() {
        let mut engine = SimulationEngine::new(small_config()).unwrap();
        for _ in 0..50 {
            engine.step().unwrap();
        }
        assert!(engine.tick() > 0);
        engine.handle_command(EngineCommand::Reset).unwrap();
        assert_eq!(engine.tick(), 0);
        assert_eq!(engine.clock(), 0.0);
        assert_eq!(engine.active_count(), 0);
        assert!(engine.artifact().trajectory_data.is_empty());
    }

    #[test]
    fn test_progress_and_snapshot_frames() {
        let mut engine = SimulationEngine::new(small_config()).unwrap();
        for _ in 0..20 {
            engine.step().unwrap();
        }
        let progress = engine.progress();
        assert!(progress.progress > 0.0);
        assert_eq!(progress.active_vehicles, engine.active_count());
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.vehicles.len(), engine.active_count());
        for v in &snapshot.vehicles {
            assert!(v.y > 0.0);
        }
    }

    #[test]
    fn test_pause_and_resume() {
        let mut engine = SimulationEngine::new(small_config()).unwrap();
        engine.step().unwrap();
        engine.handle_command(EngineCommand::Pause).unwrap();
        assert_eq!(engine.state(), SimulationState::Paused);
        engine.handle_command(EngineCommand::Resume).unwrap();
        assert_eq!(engine.state(), SimulationState::Running);
    }
}
