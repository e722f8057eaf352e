//! Canonical vital-sign sample types.

use serde::{Deserialize, Serialize};

/// One instantaneous vital-signs sample.
///
/// Both transports produce this type. Push devices report `ecg` + `ppg`,
/// pull devices report `ecg` + `heart_rate` + `spo2`; channels a device does
/// not report are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// ECG amplitude in device units.
    pub ecg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppg: Option<f64>,
    /// Beats per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<f64>,
    /// Oxygen saturation, percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spo2: Option<f64>,
}

impl Reading {
    /// A push-mode sample carrying ECG and PPG.
    pub fn ecg_ppg(timestamp: i64, ecg: f64, ppg: f64) -> Self {
        Self {
            timestamp,
            ecg,
            ppg: Some(ppg),
            heart_rate: None,
            spo2: None,
        }
    }

    /// A pull-mode sample carrying ECG, heart rate and SpO2.
    pub fn ecg_vitals(
        timestamp: i64,
        ecg: f64,
        heart_rate: Option<f64>,
        spo2: Option<f64>,
    ) -> Self {
        Self {
            timestamp,
            ecg,
            ppg: None,
            heart_rate,
            spo2,
        }
    }

    /// Returns true if every present channel is a finite number.
    pub fn is_finite(&self) -> bool {
        self.ecg.is_finite()
            && [self.ppg, self.heart_rate, self.spo2]
                .iter()
                .all(|c| c.map_or(true, f64::is_finite))
    }
}

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}
