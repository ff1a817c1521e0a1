//! Narrowed metric records
//!
//! Series entries keep an allow-listed subset of fields with reduced
//! numeric precision so that jitter below that precision does not produce a
//! new entry.

use mesh_shared::{CanonicalType, RawEvent};
use serde_json::{Map, Number, Value};

/// Precision used when comparing numbers of two records
const COMPARE_DECIMALS: u32 = 5;

/// Field kept in a narrowed record
struct FieldSpec {
    name: &'static str,
    /// `None` copies the value as is
    decimals: Option<u32>,
    max: Option<f64>,
}

const fn copy(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        decimals: None,
        max: None,
    }
}

const fn round(name: &'static str, decimals: u32) -> FieldSpec {
    FieldSpec {
        name,
        decimals: Some(decimals),
        max: None,
    }
}

const POSITION_FIELDS: &[FieldSpec] = &[
    round("latitudeI", 0),
    round("longitudeI", 0),
    round("altitude", 0),
    round("satsInView", 0),
    round("groundSpeed", 0),
    round("groundTrack", 0),
    round("precisionBits", 0),
];

const DEVICE_METRICS_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "batteryLevel",
        decimals: Some(0),
        max: Some(100.0),
    },
    round("voltage", 2),
    round("channelUtilization", 1),
    round("airUtilTx", 1),
];

const ENVIRONMENT_METRICS_FIELDS: &[FieldSpec] = &[
    round("temperature", 1),
    round("relativeHumidity", 0),
    round("barometricPressure", 0),
    round("gasResistance", 0),
    round("voltage", 2),
    round("current", 2),
    round("iaq", 0),
];

const MESSAGE_FIELDS: &[FieldSpec] = &[
    copy("data"),
    copy("gatewayId"),
    copy("hopLimit"),
    round("rxRssi", 0),
    round("rxSnr", 2),
];

const DEVICE_METADATA_FIELDS: &[FieldSpec] = &[
    copy("firmwareVersion"),
    copy("deviceStateVersion"),
    copy("hwModel"),
    copy("role"),
    copy("hasWifi"),
    copy("hasBluetooth"),
    copy("hasEthernet"),
];

/// Round to a fixed number of decimals
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

fn narrow_value(field: &FieldSpec, value: &Value) -> Option<Value> {
    if value.is_null() {
        return None;
    }

    let Some(decimals) = field.decimals else {
        return Some(value.clone());
    };

    let mut number = round_to(value.as_f64()?, decimals);
    if let Some(max) = field.max {
        number = number.min(max);
    }

    if decimals == 0 {
        Some(Value::from(number as i64))
    } else {
        Number::from_f64(number).map(Value::Number)
    }
}

fn narrow_object(fields: &[FieldSpec], source: &Value) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|field| {
            let value = narrow_value(field, source.get(field.name)?)?;
            Some((field.name.to_string(), value))
        })
        .collect()
}

/// Build the narrowed record of a series-eligible event
///
/// Returns `None` for types without a series.
pub fn narrow(kind: CanonicalType, event: &RawEvent) -> Option<Map<String, Value>> {
    let record = match kind {
        CanonicalType::Position => narrow_object(POSITION_FIELDS, &event.payload),
        CanonicalType::DeviceMetrics => {
            narrow_object(DEVICE_METRICS_FIELDS, telemetry_value(&event.payload))
        }
        CanonicalType::EnvironmentMetrics => {
            narrow_object(ENVIRONMENT_METRICS_FIELDS, telemetry_value(&event.payload))
        }
        CanonicalType::Message => {
            let source = serde_json::json!({
                "data": event.payload,
                "gatewayId": event.gateway_id,
                "hopLimit": event.hop_limit,
                "rxRssi": event.rx_rssi,
                "rxSnr": event.rx_snr,
            });
            narrow_object(MESSAGE_FIELDS, &source)
        }
        CanonicalType::DeviceMetadata => narrow_object(DEVICE_METADATA_FIELDS, &event.payload),
        CanonicalType::User | CanonicalType::RangeTest => return None,
    };

    Some(record)
}

/// Telemetry payloads nest their metrics under `variant.value`
fn telemetry_value(payload: &Value) -> &Value {
    payload
        .get("variant")
        .and_then(|variant| variant.get("value"))
        .unwrap_or(payload)
}

/// Position reports without a fix carry zero coordinates
pub fn is_no_fix(event: &RawEvent) -> bool {
    let coordinate = |name: &str| {
        event
            .payload
            .get(name)
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    };

    coordinate("latitudeI") == 0.0 || coordinate("longitudeI") == 0.0
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => {
            round_to(x, COMPARE_DECIMALS) == round_to(y, COMPARE_DECIMALS)
        }
        _ => a == b,
    }
}

/// Compare two records field by field, ignoring `timestamp`
///
/// A field present in only one of them counts as a difference.
pub fn records_equal(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    let fields = a.keys().chain(b.keys()).filter(|key| *key != "timestamp");

    for field in fields {
        match (a.get(field), b.get(field)) {
            (Some(x), Some(y)) if values_equal(x, y) => {}
            _ => return false,
        }
    }
    true
}
