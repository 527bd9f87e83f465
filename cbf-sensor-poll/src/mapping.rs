//! Mapping resolver
//!
//! Builds the two lookup tables the normalizer joins against:
//! - `HostnameMap`: logical host (`fhost03`) -> functional host (`skarab020709-01`)
//! - `InputLabelMap`: functional host -> canonical input code (`ant0_xy`)
//!
//! Both come from sensors whose values are structured literals, parsed with
//! `crate::literal`.

use crate::error::{PollError, Result};
use crate::katcp::KatcpSession;
use crate::literal::{self, Literal};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

pub const INPUT_LABELLING_SENSOR: &str = "input-labelling";
pub const HOSTNAME_MAPPING_SENSOR: &str = "hostname-functional-mapping";

pub type InputLabelMap = BTreeMap<String, String>;
pub type HostnameMap = BTreeMap<String, String>;

/// Both tables for one array, resolved together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mappings {
    pub input_labels: InputLabelMap,
    pub hostnames: HostnameMap,
}

/// Collapse the two polarizations of an input onto one key:
/// `ant0_x`/`ant0_y` -> `ant0_xy`, `m000v`/`m000h` -> `m000_vh`.
/// Codes that are already canonical come back unchanged.
pub fn canonical_input_code(code: &str) -> String {
    if code.ends_with("_xy") || code.ends_with("_vh") {
        return code.to_string();
    }
    if let Some(stem) = code.strip_suffix("_x").or_else(|| code.strip_suffix("_y")) {
        return format!("{stem}_xy");
    }
    if let Some(stem) = code.strip_suffix('v').or_else(|| code.strip_suffix('h')) {
        if !stem.is_empty() {
            return format!("{stem}_vh");
        }
    }
    code.to_string()
}

/// `[(label, _, functional_host, ...), ...]` -> functional_host -> canonical label
pub fn parse_input_labels(text: &str) -> Result<InputLabelMap> {
    let value = literal::parse(text)?;
    let records = value
        .as_seq()
        .ok_or_else(|| PollError::missing_sensor(INPUT_LABELLING_SENSOR, "payload is not a sequence"))?;

    let mut map = InputLabelMap::new();
    for record in records {
        let fields = record.as_seq().filter(|f| f.len() >= 3).ok_or_else(|| {
            PollError::missing_sensor(INPUT_LABELLING_SENSOR, format!("malformed record {record}"))
        })?;
        let label = expect_str(&fields[0], INPUT_LABELLING_SENSOR)?;
        let host = expect_str(&fields[2], INPUT_LABELLING_SENSOR)?;
        map.insert(host.to_string(), canonical_input_code(label));
    }
    Ok(map)
}

/// `{functional: logical}` -> logical -> functional
pub fn parse_hostname_mapping(text: &str) -> Result<HostnameMap> {
    let value = literal::parse(text)?;
    let pairs = value
        .as_dict()
        .ok_or_else(|| PollError::missing_sensor(HOSTNAME_MAPPING_SENSOR, "payload is not a dict"))?;

    pairs
        .iter()
        .map(|(functional, logical)| {
            Ok((
                expect_str(logical, HOSTNAME_MAPPING_SENSOR)?.to_string(),
                expect_str(functional, HOSTNAME_MAPPING_SENSOR)?.to_string(),
            ))
        })
        .collect()
}

fn expect_str<'a>(value: &'a Literal, sensor: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| PollError::missing_sensor(sensor, format!("expected a string, found {value}")))
}

/// Fetch one sensor's value: last argument of the last inform
async fn fetch_sensor_text(session: &KatcpSession, sensor: &str, timeout: Duration) -> Result<String> {
    let reply = session
        .request("sensor-value", Some(sensor), timeout)
        .await
        .map_err(|e| match e {
            e if e.is_connection_lost() => e,
            other => PollError::missing_sensor(sensor, other.to_string()),
        })?;
    if !reply.ok {
        return Err(PollError::missing_sensor(
            sensor,
            format!("request rejected: {}", reply.arguments.join(" ")),
        ));
    }
    reply
        .informs
        .last()
        .and_then(|inform| inform.last())
        .cloned()
        .ok_or_else(|| PollError::missing_sensor(sensor, "no sensor-value informs"))
}

pub async fn resolve_input_labels(data_session: &KatcpSession, timeout: Duration) -> Result<InputLabelMap> {
    let text = fetch_sensor_text(data_session, INPUT_LABELLING_SENSOR, timeout).await?;
    let map = parse_input_labels(&text).map_err(|e| as_missing(INPUT_LABELLING_SENSOR, e))?;
    debug!("Resolved {} input labels", map.len());
    Ok(map)
}

pub async fn resolve_hostnames(sensor_session: &KatcpSession, timeout: Duration) -> Result<HostnameMap> {
    let text = fetch_sensor_text(sensor_session, HOSTNAME_MAPPING_SENSOR, timeout).await?;
    let map = parse_hostname_mapping(&text).map_err(|e| as_missing(HOSTNAME_MAPPING_SENSOR, e))?;
    debug!("Resolved {} hostname mappings", map.len());
    Ok(map)
}

/// Resolve both tables; either failing fails the whole resolution
pub async fn resolve_mappings(
    data_session: &KatcpSession,
    sensor_session: &KatcpSession,
    timeout: Duration,
) -> Result<Mappings> {
    let hostnames = resolve_hostnames(sensor_session, timeout).await?;
    let input_labels = resolve_input_labels(data_session, timeout).await?;
    Ok(Mappings {
        input_labels,
        hostnames,
    })
}

fn as_missing(sensor: &str, error: PollError) -> PollError {
    match error {
        PollError::MissingSensor { .. } => error,
        other => PollError::missing_sensor(sensor, other.to_string()),
    }
}
