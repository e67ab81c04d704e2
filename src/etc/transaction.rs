use crate::road::GantryId;
use crate::vehicles::vehicle::VehicleId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether the crossing vehicle was behaving anomalously at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    #[default]
    Normal,
    Anomaly,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Normal => "normal",
            TransactionStatus::Anomaly => "anomaly",
        };
        write!(f, "{}", s)
    }
}

/// One gantry read of one vehicle.
///
/// The noise stage may clone, perturb or annotate a transaction before
/// it reaches the detector; the optional fields record what it did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtcTransaction {
    pub vehicle_id: VehicleId,
    pub gantry_id: GantryId,
    pub gantry_position_km: f64,
    pub timestamp: f64,
    pub lane: usize,
    /// Speed at crossing, m/s
    pub speed: f64,
    pub status: TransactionStatus,
    /// Set by the duplicate-read injector on every copy after the first
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_duplicate: bool,
    /// Set by the delayed-upload injector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_delay: Option<f64>,
    /// Set by the delayed-upload injector: `timestamp + upload_delay`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_upload_time: Option<f64>,
    /// Set by the clock-drift injector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_drift: Option<f64>,
}

impl EtcTransaction {
    /// A clean transaction as produced at the gantry, before noise.
    pub fn raw(
        vehicle_id: VehicleId,
        gantry_id: GantryId,
        gantry_position_km: f64,
        timestamp: f64,
        lane: usize,
        speed: f64,
        status: TransactionStatus,
    ) -> Self {
        EtcTransaction {
            vehicle_id,
            gantry_id,
            gantry_position_km,
            timestamp,
            lane,
            speed,
            status,
            is_duplicate: false,
            upload_delay: None,
            actual_upload_time: None,
            clock_drift: None,
        }
    }
}
