// netatmo_exporter - Prometheus metrics exporter for Netatmo weather stations
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::client::{Device, DeviceReader};
use prometheus_client::collector::Collector;
use prometheus_client::encoding::{
    DescriptorEncoder, EncodeLabelSet, EncodeLabelValue, EncodeMetric, LabelValueEncoder, MetricEncoder,
};
use prometheus_client::metrics::gauge::ConstGauge;
use prometheus_client::metrics::MetricType;
use prometheus_client::registry::Registry;
use std::error;
use std::fmt::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Readings older than this are from a device that has stopped reporting.
const STALE_DATA_THRESHOLD_SECS: i64 = 30 * 60;

const LABEL_MODULE: &str = "module";
const LABEL_STATION: &str = "station";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    /// Type written to the exposition.
    ///
    /// OpenMetrics counter samples always get a `_total` suffix. Counter-shaped metrics are
    /// written as `unknown` instead so that the series keep their catalog name.
    fn metric_type(self) -> MetricType {
        match self {
            Self::Counter => MetricType::Unknown,
            Self::Gauge => MetricType::Gauge,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
}

pub static UP: Descriptor = Descriptor {
    name: "netatmo_up",
    help: "Zero if there was an error scraping the Netatmo API",
    kind: MetricKind::Gauge,
};

pub static UPDATED: Descriptor = Descriptor {
    name: "netatmo_aircare_updated",
    help: "Timestamp of last update",
    kind: MetricKind::Counter,
};

pub static LAST_MEASURE_UTC: Descriptor = Descriptor {
    name: "netatmo_aircare_last_measure_utc",
    help: "Measurement time UTC",
    kind: MetricKind::Gauge,
};

pub static TEMPERATURE: Descriptor = Descriptor {
    name: "netatmo_aircare_temperature_celsius",
    help: "Temperature measurement in celsius",
    kind: MetricKind::Gauge,
};

pub static HUMIDITY: Descriptor = Descriptor {
    name: "netatmo_aircare_humidity_percent",
    help: "Relative humidity measurement in percent",
    kind: MetricKind::Gauge,
};

pub static CO2: Descriptor = Descriptor {
    name: "netatmo_aircare_co2_ppm",
    help: "Carbon dioxide measurement in parts per million",
    kind: MetricKind::Gauge,
};

pub static NOISE: Descriptor = Descriptor {
    name: "netatmo_aircare_noise_db",
    help: "Noise measurement in decibels",
    kind: MetricKind::Gauge,
};

pub static PRESSURE: Descriptor = Descriptor {
    name: "netatmo_aircare_pressure_mb",
    help: "Atmospheric pressure measurement in millibar",
    kind: MetricKind::Gauge,
};

pub static ABSOLUTE_PRESSURE: Descriptor = Descriptor {
    name: "netatmo_aircare_absolute_pressure",
    help: "Absolute pressure in millibar",
    kind: MetricKind::Gauge,
};

pub static HEALTH_INDEX: Descriptor = Descriptor {
    name: "netatmo_aircare_health_index",
    help: "Health index: 0 = Healthy, 1 = Fine, 2 = Fair, 3 = Poor, 4 = Unhealthy",
    kind: MetricKind::Gauge,
};

pub static WIFI_SIGNAL_STRENGTH: Descriptor = Descriptor {
    name: "netatmo_aircare_wifi_signal_strength",
    help: "Wifi signal strength (86: bad, 71: avg, 56: good)",
    kind: MetricKind::Gauge,
};

pub static RF_SIGNAL_STRENGTH: Descriptor = Descriptor {
    name: "netatmo_aircare_rf_signal_strength",
    help: "RF signal strength (90: lowest, 60: highest)",
    kind: MetricKind::Gauge,
};

/// Every metric that may be emitted during a scrape, in exposition order.
pub static DESCRIPTORS: [&Descriptor; 12] = [
    &UP,
    &UPDATED,
    &LAST_MEASURE_UTC,
    &TEMPERATURE,
    &HUMIDITY,
    &CO2,
    &NOISE,
    &PRESSURE,
    &ABSOLUTE_PRESSURE,
    &HEALTH_INDEX,
    &WIFI_SIGNAL_STRENGTH,
    &RF_SIGNAL_STRENGTH,
];

/// Station or module name used as a label value, escaped when encoded.
///
/// Names are chosen by users in the Netatmo app and may contain quotes, backslashes
/// or newlines, any of which would otherwise break the text exposition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelValue(String);

impl From<&str> for LabelValue {
    fn from(s: &str) -> Self {
        LabelValue(s.to_owned())
    }
}

impl EncodeLabelValue for LabelValue {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        for c in self.0.chars() {
            match c {
                '\\' => encoder.write_str("\\\\")?,
                '"' => encoder.write_str("\\\"")?,
                '\n' => encoder.write_str("\\n")?,
                _ => encoder.write_char(c)?,
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct DeviceLabels {
    pub module: LabelValue,
    pub station: LabelValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    EmptyLabel(&'static str),
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyLabel(l) => write!(f, "empty value for label {}", l),
        }
    }
}

impl error::Error for SampleError {}

/// Single observation of a metric, created during a scrape and discarded after encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub descriptor: &'static Descriptor,
    pub value: f64,
    pub labels: Option<DeviceLabels>,
}

impl Sample {
    pub fn up(success: bool) -> Self {
        Sample {
            descriptor: &UP,
            value: if success { 1.0 } else { 0.0 },
            labels: None,
        }
    }

    /// Create a sample for a station or module, failing if either label would be empty.
    pub fn device(
        descriptor: &'static Descriptor,
        value: f64,
        module: &str,
        station: &str,
    ) -> Result<Self, SampleError> {
        if module.is_empty() {
            return Err(SampleError::EmptyLabel(LABEL_MODULE));
        }

        if station.is_empty() {
            return Err(SampleError::EmptyLabel(LABEL_STATION));
        }

        Ok(Sample {
            descriptor,
            value,
            labels: Some(DeviceLabels {
                module: module.into(),
                station: station.into(),
            }),
        })
    }

    // Counter-shaped metrics are written untyped, see MetricKind::metric_type
    fn encode_value(&self, encoder: MetricEncoder) -> Result<(), fmt::Error> {
        ConstGauge::new(self.value).encode(encoder)
    }
}

/// Converts the current state of all stations and modules into metric samples.
///
/// Nothing is cached between calls: every `collect()` fetches the device tree
/// again and builds samples only from that result.
#[derive(Debug)]
pub struct ReadingTranslator<R> {
    reader: R,
}

impl<R> ReadingTranslator<R>
where
    R: DeviceReader,
{
    pub fn new(reader: R) -> Self {
        ReadingTranslator { reader }
    }

    /// All metric descriptors that `collect()` may emit.
    pub fn describe(&self) -> &'static [&'static Descriptor] {
        &DESCRIPTORS
    }

    pub async fn collect(&self) -> Vec<Sample> {
        self.collect_at(SystemTime::now()).await
    }

    /// Fetch the device tree and translate it, judging freshness against `now`.
    ///
    /// If the fetch fails, the only sample returned is `netatmo_up` set to zero.
    pub async fn collect_at(&self, now: SystemTime) -> Vec<Sample> {
        let mut samples = Vec::new();
        let tree = match self.reader.read().await {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(message = "failed to fetch station data", error = %e);
                samples.push(Sample::up(false));
                return samples;
            }
        };

        samples.push(Sample::up(true));
        for station in &tree.devices {
            let station_name = station.name();
            translate(&mut samples, station, station_name, now);

            for module in &station.linked_modules {
                translate(&mut samples, module, station_name, now);
            }
        }

        samples
    }
}

/// Append samples for all present fields of a single device, if its reading is fresh.
///
/// Devices that have never reported or whose last measurement is older than thirty
/// minutes produce no samples at all.
pub fn translate(ch: &mut Vec<Sample>, device: &Device, station_name: &str, now: SystemTime) {
    let module_name = device.name();
    let data = &device.dashboard_data;

    let last_measure = match data.last_measure {
        Some(t) => t,
        None => return,
    };

    if is_stale(last_measure, now) {
        tracing::debug!(
            message = "skipping stale device",
            module = %module_name,
            station = %station_name,
            last_measure = last_measure,
        );
        return;
    }

    let timestamp = last_measure as f64;
    send_metric(ch, &UPDATED, timestamp, module_name, station_name);
    send_metric(ch, &LAST_MEASURE_UTC, timestamp, module_name, station_name);

    let fields: [(&'static Descriptor, Option<f64>); 9] = [
        (&TEMPERATURE, data.temperature),
        (&HUMIDITY, data.humidity),
        (&CO2, data.co2),
        (&NOISE, data.noise),
        (&PRESSURE, data.pressure),
        (&ABSOLUTE_PRESSURE, data.absolute_pressure),
        (&HEALTH_INDEX, data.health_index),
        (&WIFI_SIGNAL_STRENGTH, device.wifi_status.map(|v| v as f64)),
        (&RF_SIGNAL_STRENGTH, device.rf_status.map(|v| v as f64)),
    ];

    for (descriptor, value) in fields {
        if let Some(v) = value {
            send_metric(ch, descriptor, v, module_name, station_name);
        }
    }
}

fn is_stale(last_measure: i64, now: SystemTime) -> bool {
    let now_secs = match now.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    };

    now_secs.saturating_sub(last_measure) > STALE_DATA_THRESHOLD_SECS
}

fn send_metric(ch: &mut Vec<Sample>, descriptor: &'static Descriptor, value: f64, module: &str, station: &str) {
    match Sample::device(descriptor, value, module, station) {
        Ok(s) => ch.push(s),
        Err(e) => {
            tracing::warn!(
                message = "error creating metric",
                metric = descriptor.name,
                module = %module,
                station = %station,
                error = %e,
            );
        }
    }
}

/// Adapter exposing the samples from a single scrape to a `prometheus_client` registry.
///
/// Samples are grouped into one family per descriptor, in the order of `DESCRIPTORS`.
/// Descriptors without any samples are skipped.
#[derive(Debug)]
pub struct SampleCollector {
    samples: Vec<Sample>,
}

impl SampleCollector {
    pub fn new(samples: Vec<Sample>) -> Self {
        SampleCollector { samples }
    }
}

impl Collector for SampleCollector {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), fmt::Error> {
        for descriptor in DESCRIPTORS.iter() {
            let family: Vec<&Sample> = self.samples.iter().filter(|s| s.descriptor == *descriptor).collect();
            if family.is_empty() {
                continue;
            }

            let mut metric_encoder =
                encoder.encode_descriptor(descriptor.name, descriptor.help, None, descriptor.kind.metric_type())?;

            for sample in family {
                match &sample.labels {
                    Some(labels) => sample.encode_value(metric_encoder.encode_family(labels)?)?,
                    None => {
                        // Unlabeled metrics only ever have a single sample
                        sample.encode_value(metric_encoder)?;
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Encode the samples from a single scrape in the OpenMetrics text format.
pub fn encode_samples(samples: Vec<Sample>) -> Result<String, fmt::Error> {
    let mut registry = Registry::default();
    registry.register_collector(Box::new(SampleCollector::new(samples)));

    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &registry)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, DeviceTree, Reading};
    use reqwest::StatusCode;
    use std::time::Duration;

    const NOW_SECS: u64 = 1_700_000_000;

    struct StaticReader {
        tree: Option<DeviceTree>,
    }

    impl DeviceReader for StaticReader {
        async fn read(&self) -> Result<DeviceTree, ClientError> {
            self.tree
                .clone()
                .ok_or(ClientError::Unauthorized(StatusCode::FORBIDDEN))
        }
    }

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(NOW_SECS)
    }

    fn minutes_ago(mins: u64) -> Option<i64> {
        Some((NOW_SECS - mins * 60) as i64)
    }

    fn device(name: &str, reading: Reading) -> Device {
        Device {
            module_name: Some(name.to_owned()),
            dashboard_data: reading,
            ..Default::default()
        }
    }

    fn reported(name: &str, last_measure: Option<i64>) -> Device {
        device(
            name,
            Reading {
                last_measure,
                ..Default::default()
            },
        )
    }

    fn fully_populated(last_measure: Option<i64>) -> Device {
        Device {
            module_name: Some("Kitchen".to_owned()),
            wifi_status: Some(56),
            rf_status: Some(60),
            dashboard_data: Reading {
                last_measure,
                temperature: Some(22.0),
                humidity: Some(45.0),
                co2: Some(800.0),
                noise: Some(40.0),
                pressure: Some(1012.0),
                absolute_pressure: Some(1000.0),
                health_index: Some(1.0),
            },
            ..Default::default()
        }
    }

    fn labels(module: &str, station: &str) -> Option<DeviceLabels> {
        Some(DeviceLabels {
            module: module.into(),
            station: station.into(),
        })
    }

    fn names(samples: &[Sample]) -> Vec<&'static str> {
        samples.iter().map(|s| s.descriptor.name).collect()
    }

    #[test]
    fn test_translate_no_timestamp() {
        let mut samples = Vec::new();
        translate(&mut samples, &fully_populated(None), "Home", now());
        assert!(samples.is_empty());
    }

    #[test]
    fn test_translate_stale() {
        let mut samples = Vec::new();
        translate(&mut samples, &fully_populated(minutes_ago(45)), "Home", now());
        assert!(samples.is_empty());
    }

    #[test]
    fn test_translate_freshness_boundary() {
        let mut samples = Vec::new();
        translate(&mut samples, &reported("Kitchen", minutes_ago(30)), "Home", now());
        assert_eq!(2, samples.len());

        let mut samples = Vec::new();
        let just_stale = Some(NOW_SECS as i64 - STALE_DATA_THRESHOLD_SECS - 1);
        translate(&mut samples, &reported("Kitchen", just_stale), "Home", now());
        assert!(samples.is_empty());
    }

    #[test]
    fn test_translate_future_timestamp_is_fresh() {
        let mut samples = Vec::new();
        let future = Some(NOW_SECS as i64 + 120);
        translate(&mut samples, &reported("Kitchen", future), "Home", now());
        assert_eq!(vec![UPDATED.name, LAST_MEASURE_UTC.name], names(&samples));
    }

    #[test]
    fn test_translate_all_fields() {
        let mut samples = Vec::new();
        let last_measure = minutes_ago(5);
        translate(&mut samples, &fully_populated(last_measure), "Home", now());

        assert_eq!(11, samples.len());
        assert_eq!(
            vec![
                UPDATED.name,
                LAST_MEASURE_UTC.name,
                TEMPERATURE.name,
                HUMIDITY.name,
                CO2.name,
                NOISE.name,
                PRESSURE.name,
                ABSOLUTE_PRESSURE.name,
                HEALTH_INDEX.name,
                WIFI_SIGNAL_STRENGTH.name,
                RF_SIGNAL_STRENGTH.name,
            ],
            names(&samples)
        );

        let expected_ts = last_measure.unwrap() as f64;
        assert_eq!(expected_ts, samples[0].value);
        assert_eq!(expected_ts, samples[1].value);
        assert_eq!(56.0, samples[9].value);
        assert_eq!(60.0, samples[10].value);
        assert!(samples.iter().all(|s| s.labels == labels("Kitchen", "Home")));
    }

    #[test]
    fn test_translate_field_count_matches_present_fields() {
        let reading = Reading {
            last_measure: minutes_ago(1),
            co2: Some(450.0),
            health_index: Some(0.0),
            ..Default::default()
        };
        let dev = Device {
            rf_status: Some(75),
            ..device("Bedroom", reading)
        };

        let mut samples = Vec::new();
        translate(&mut samples, &dev, "Home", now());

        assert_eq!(
            vec![
                UPDATED.name,
                LAST_MEASURE_UTC.name,
                CO2.name,
                HEALTH_INDEX.name,
                RF_SIGNAL_STRENGTH.name
            ],
            names(&samples)
        );
    }

    #[test]
    fn test_translate_empty_name_drops_samples() {
        let mut samples = Vec::new();
        let unnamed = Device {
            dashboard_data: Reading {
                last_measure: minutes_ago(1),
                temperature: Some(19.0),
                ..Default::default()
            },
            ..Default::default()
        };

        translate(&mut samples, &unnamed, "Home", now());
        assert!(samples.is_empty());

        // A bad sample must not prevent other devices from being translated
        translate(&mut samples, &fully_populated(minutes_ago(1)), "Home", now());
        assert_eq!(11, samples.len());
    }

    #[test]
    fn test_sample_device_rejects_empty_labels() {
        assert_eq!(
            Err(SampleError::EmptyLabel("module")),
            Sample::device(&TEMPERATURE, 1.0, "", "Home")
        );
        assert_eq!(
            Err(SampleError::EmptyLabel("station")),
            Sample::device(&TEMPERATURE, 1.0, "Kitchen", "")
        );
    }

    #[tokio::test]
    async fn test_collect_fetch_failure() {
        let translator = ReadingTranslator::new(StaticReader { tree: None });
        let samples = translator.collect_at(now()).await;

        assert_eq!(vec![Sample::up(false)], samples);
    }

    #[tokio::test]
    async fn test_collect_empty_tree() {
        let translator = ReadingTranslator::new(StaticReader {
            tree: Some(DeviceTree::default()),
        });
        let samples = translator.collect_at(now()).await;

        assert_eq!(vec![Sample::up(true)], samples);
    }

    #[tokio::test]
    async fn test_collect_station_and_module() {
        let outdoor = device(
            "Outdoor",
            Reading {
                last_measure: minutes_ago(2),
                temperature: Some(5.0),
                ..Default::default()
            },
        );

        let living = Device {
            station_name: Some("Living".to_owned()),
            module_name: Some("Living".to_owned()),
            dashboard_data: Reading {
                last_measure: minutes_ago(1),
                temperature: Some(21.5),
                humidity: Some(40.0),
                ..Default::default()
            },
            linked_modules: vec![outdoor],
            ..Default::default()
        };

        let translator = ReadingTranslator::new(StaticReader {
            tree: Some(DeviceTree { devices: vec![living] }),
        });
        let samples = translator.collect_at(now()).await;

        let living_ts = minutes_ago(1).unwrap() as f64;
        let outdoor_ts = minutes_ago(2).unwrap() as f64;
        let expected = vec![
            Sample::up(true),
            Sample::device(&UPDATED, living_ts, "Living", "Living").unwrap(),
            Sample::device(&LAST_MEASURE_UTC, living_ts, "Living", "Living").unwrap(),
            Sample::device(&TEMPERATURE, 21.5, "Living", "Living").unwrap(),
            Sample::device(&HUMIDITY, 40.0, "Living", "Living").unwrap(),
            Sample::device(&UPDATED, outdoor_ts, "Outdoor", "Living").unwrap(),
            Sample::device(&LAST_MEASURE_UTC, outdoor_ts, "Outdoor", "Living").unwrap(),
            Sample::device(&TEMPERATURE, 5.0, "Outdoor", "Living").unwrap(),
        ];

        assert_eq!(expected, samples);
    }

    #[tokio::test]
    async fn test_collect_module_uses_station_name() {
        let station = Device {
            station_name: Some("Home".to_owned()),
            module_name: Some("Indoor".to_owned()),
            linked_modules: vec![
                reported("Garden", minutes_ago(3)),
                fully_populated(minutes_ago(90)),
            ],
            ..Default::default()
        };

        let translator = ReadingTranslator::new(StaticReader {
            tree: Some(DeviceTree { devices: vec![station] }),
        });
        let samples = translator.collect_at(now()).await;

        // Station itself has no reading, the stale module is suppressed
        assert_eq!(3, samples.len());
        assert_eq!(Sample::up(true), samples[0]);
        assert!(samples[1..].iter().all(|s| s.labels == labels("Garden", "Home")));
    }

    #[test]
    fn test_describe_covers_emitted_metrics() {
        let translator = ReadingTranslator::new(StaticReader { tree: None });
        let described = translator.describe();

        assert_eq!(12, described.len());
        assert!(described.contains(&&UP));

        let mut samples = Vec::new();
        translate(&mut samples, &fully_populated(minutes_ago(1)), "Home", now());
        for s in samples {
            assert!(described.contains(&s.descriptor), "{} not described", s.descriptor.name);
        }
    }

    #[test]
    fn test_encode_samples() {
        let samples = vec![
            Sample::up(true),
            Sample::device(&UPDATED, 1.0, "Living", "Living").unwrap(),
            Sample::device(&TEMPERATURE, 21.5, "Living", "Living").unwrap(),
            Sample::device(&UPDATED, 2.0, "Outdoor", "Living").unwrap(),
            Sample::device(&TEMPERATURE, 5.0, "Outdoor", "Living").unwrap(),
        ];

        let out = encode_samples(samples).unwrap();

        assert!(out.contains("# TYPE netatmo_up gauge"));
        assert!(out.contains("# TYPE netatmo_aircare_updated unknown"));
        assert!(out.contains("\nnetatmo_aircare_updated{module=\"Outdoor\",station=\"Living\"} "));
        assert!(!out.contains("_total"));
        assert!(out.contains("netatmo_aircare_temperature_celsius{module=\"Living\",station=\"Living\"} "));
        assert!(!out.contains("netatmo_aircare_humidity_percent"));
        assert!(out.ends_with("# EOF\n"));

        // Both temperature samples are written under a single family
        assert_eq!(1, out.matches("# TYPE netatmo_aircare_temperature_celsius gauge").count());
        let living = out.find("module=\"Living\",station=\"Living\"} 21.5").unwrap();
        let outdoor = out.find("module=\"Outdoor\",station=\"Living\"} 5").unwrap();
        assert!(living < outdoor);
    }

    #[test]
    fn test_encode_samples_escapes_label_values() {
        let samples = vec![
            Sample::up(true),
            Sample::device(&TEMPERATURE, 1.0, "Kid's \"room\"\nA\\B", "Home").unwrap(),
            Sample::device(&TEMPERATURE, 2.0, "Hall", "Home").unwrap(),
        ];

        let out = encode_samples(samples).unwrap();

        assert!(out.contains(r#"netatmo_aircare_temperature_celsius{module="Kid's \"room\"\nA\\B",station="Home"} "#));
        assert!(out.contains(r#"netatmo_aircare_temperature_celsius{module="Hall",station="Home"} "#));
        // Every sample stays on its own line
        assert!(out.lines().all(|l| l.starts_with('#') || l.starts_with("netatmo_")));
    }

    #[test]
    fn test_encode_samples_fetch_failure() {
        let out = encode_samples(vec![Sample::up(false)]).unwrap();

        assert!(out.contains("# TYPE netatmo_up gauge"));
        assert!(out.contains("netatmo_up 0"));
        assert!(!out.contains("netatmo_aircare"));
    }
}
