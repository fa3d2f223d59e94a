use serde::{Deserialize, Serialize};

use crate::telemetry::{Channel, ChannelSeries};

/// Reduced form of one channel's readings. `None` means unavailable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatistics {
    pub samples: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
}

impl ChannelStatistics {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn from_samples(watts: &[f64]) -> Self {
        if watts.is_empty() {
            return Self::unavailable();
        }

        let min = watts.iter().copied().fold(f64::INFINITY, f64::min);
        let max = watts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = watts.iter().sum::<f64>() / watts.len() as f64;

        Self {
            samples: watts.len() as u64,
            min: Some(min),
            max: Some(max),
            // Summation rounding can push the mean a ulp outside the range.
            avg: Some(mean.clamp(min, max)),
        }
    }

    pub fn is_available(&self) -> bool {
        self.samples > 0
    }
}

/// Per-channel statistics for one run. All three channel keys are always
/// serialized; only their values go null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerStatistics {
    pub cpu_watts: ChannelStatistics,
    pub gpu_watts: ChannelStatistics,
    pub ane_watts: ChannelStatistics,
    /// Sampler selector the log was recorded with.
    pub samplers: Option<String>,
}

impl PowerStatistics {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn from_series(series: &ChannelSeries, samplers: Option<String>) -> Self {
        Self {
            cpu_watts: ChannelStatistics::from_samples(series.get(Channel::Cpu)),
            gpu_watts: ChannelStatistics::from_samples(series.get(Channel::Gpu)),
            ane_watts: ChannelStatistics::from_samples(series.get(Channel::Ane)),
            samplers,
        }
    }

    pub fn channel(&self, channel: Channel) -> &ChannelStatistics {
        match channel {
            Channel::Cpu => &self.cpu_watts,
            Channel::Gpu => &self.gpu_watts,
            Channel::Ane => &self.ane_watts,
        }
    }

    /// Sum of the available channel averages, `None` if no channel has data.
    pub fn package_avg_watts(&self) -> Option<f64> {
        let avgs: Vec<f64> = Channel::ALL
            .iter()
            .filter_map(|c| self.channel(*c).avg)
            .collect();
        if avgs.is_empty() {
            None
        } else {
            Some(avgs.iter().sum())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_series_is_unavailable() {
        let stats = ChannelStatistics::from_samples(&[]);
        assert_eq!(stats.samples, 0);
        assert!(stats.min.is_none() && stats.max.is_none() && stats.avg.is_none());
        assert!(!stats.is_available());
    }

    #[test]
    fn test_min_avg_max_ordering() {
        let inputs: &[&[f64]] = &[
            &[1.0],
            &[0.1, 0.1, 0.1],
            &[3.5, 0.2, 9.75, 4.0],
            &[0.0, 0.0],
            &[1e-3, 1e6, 42.0],
        ];
        for watts in inputs {
            let stats = ChannelStatistics::from_samples(watts);
            let (min, avg, max) = (stats.min.unwrap(), stats.avg.unwrap(), stats.max.unwrap());
            assert!(min <= avg && avg <= max, "{:?}", watts);
            assert_eq!(stats.samples, watts.len() as u64);
        }
    }

    #[test]
    fn test_plain_arithmetic_mean() {
        let stats = ChannelStatistics::from_samples(&[1.0, 2.0, 6.0]);
        assert_eq!(stats.min, Some(1.0));
        assert_eq!(stats.max, Some(6.0));
        assert_eq!(stats.avg, Some(3.0));
    }

    #[test]
    fn test_unavailable_keys_still_serialized() {
        let json = serde_json::to_value(PowerStatistics::unavailable()).unwrap();
        for key in ["cpu_watts", "gpu_watts", "ane_watts"] {
            let channel = &json[key];
            assert_eq!(channel["samples"], 0);
            assert!(channel["avg"].is_null());
            assert!(channel.get("min").is_some());
            assert!(channel.get("max").is_some());
        }
        assert!(json.get("samplers").is_some());
    }

    #[test]
    fn test_package_average() {
        let series = ChannelSeries {
            cpu: vec![2.0, 4.0],
            gpu: vec![1.0],
            ane: vec![],
        };
        let power = PowerStatistics::from_series(&series, Some("cpu_power,gpu_power".into()));
        assert_eq!(power.package_avg_watts(), Some(4.0));
        assert_eq!(PowerStatistics::unavailable().package_avg_watts(), None);
    }
}
