//! Topology discovery for a CBF instrument
//!
//! This module handles:
//! - Listing running sub-arrays on the primary KATCP port (`?array-list`)
//! - Parsing each array's `data_port,sensor_port` pair
//! - Opening the per-array data and sensor sessions

use crate::error::{PollError, Result};
use crate::katcp::{Endpoint, KatcpSession};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One running sub-array and its secondary ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayDescriptor {
    pub array_name: String,
    pub data_port: u16,
    pub sensor_port: u16,
}

/// Live sessions for one array. The data session serves
/// `input-labelling`; the sensor session serves the full sensor table and
/// `hostname-functional-mapping`.
pub struct ArraySessions {
    pub data: KatcpSession,
    pub sensors: KatcpSession,
}

impl ArraySessions {
    pub fn is_connected(&self) -> bool {
        self.data.is_connected() && self.sensors.is_connected()
    }

    pub async fn close(&self) {
        self.data.close().await;
        self.sensors.close().await;
    }
}

/// Parse one `#array-list` inform: `[name, "data_port,sensor_port", ...]`
pub fn parse_array_inform(arguments: &[String]) -> Result<ArrayDescriptor> {
    let name = arguments
        .first()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PollError::protocol("array-list", "inform without array name"))?;
    let ports = arguments
        .get(1)
        .ok_or_else(|| PollError::protocol("array-list", format!("no ports for {name}")))?;

    let parsed: Vec<u16> = ports
        .split(',')
        .map(|p| p.trim().parse::<u16>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| PollError::protocol("array-list", format!("bad port pair {ports:?} for {name}: {e}")))?;

    match parsed.as_slice() {
        [data_port, sensor_port] => Ok(ArrayDescriptor {
            array_name: name.clone(),
            data_port: *data_port,
            sensor_port: *sensor_port,
        }),
        _ => Err(PollError::protocol(
            "array-list",
            format!("expected data_port,sensor_port for {name}, got {ports:?}"),
        )),
    }
}

/// Build descriptors from `#array-list` informs; unparsable ones are skipped
pub fn descriptors_from_informs(informs: &[Vec<String>]) -> BTreeMap<String, ArrayDescriptor> {
    let mut arrays = BTreeMap::new();
    for inform in informs {
        match parse_array_inform(inform) {
            Ok(descriptor) => {
                debug!(
                    "Array {}: data port {}, sensor port {}",
                    descriptor.array_name, descriptor.data_port, descriptor.sensor_port
                );
                arrays.insert(descriptor.array_name.clone(), descriptor);
            }
            Err(e) => warn!("Skipping array: {}", e),
        }
    }
    arrays
}

/// List the running arrays behind the primary session. No ok reply, or no
/// usable array, is `NoRunningArray`.
pub async fn discover_arrays(
    primary: &KatcpSession,
    array_filter: Option<&str>,
    timeout: Duration,
) -> Result<BTreeMap<String, ArrayDescriptor>> {
    let endpoint = primary.endpoint().clone();
    let reply = match primary.request("array-list", array_filter, timeout).await {
        Ok(reply) => reply,
        Err(e) if e.is_connection_lost() => return Err(e),
        Err(e) => {
            warn!("array-list on {} failed: {}", endpoint, e);
            return Err(PollError::NoRunningArray(endpoint));
        }
    };

    if !reply.ok {
        warn!("array-list rejected by {}: {}", endpoint, reply.arguments.join(" "));
        return Err(PollError::NoRunningArray(endpoint));
    }

    let arrays = descriptors_from_informs(&reply.informs);
    if arrays.is_empty() {
        return Err(PollError::NoRunningArray(endpoint));
    }

    info!("Discovered {} running array(s) on {}", arrays.len(), endpoint);
    Ok(arrays)
}

/// Open both secondary sessions for one array. If the second connection
/// fails the first one is closed again.
pub async fn open_array(primary: &Endpoint, descriptor: &ArrayDescriptor, timeout: Duration) -> Result<ArraySessions> {
    let data = KatcpSession::connect(&primary.with_port(descriptor.data_port), timeout).await?;
    let sensors = match KatcpSession::connect(&primary.with_port(descriptor.sensor_port), timeout).await {
        Ok(session) => session,
        Err(e) => {
            data.close().await;
            return Err(e);
        }
    };

    info!(
        "KATCP connections established for {}: primary {}, array port {}, sensor port {}",
        descriptor.array_name, primary, descriptor.data_port, descriptor.sensor_port
    );
    Ok(ArraySessions { data, sensors })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_array_inform() {
        let descriptor = parse_array_inform(&args(&["array0", "7148,7149"])).unwrap();
        assert_eq!(
            descriptor,
            ArrayDescriptor {
                array_name: "array0".into(),
                data_port: 7148,
                sensor_port: 7149,
            }
        );
    }

    #[test]
    fn test_bad_port_pairs_are_rejected() {
        assert!(parse_array_inform(&args(&["array0", "badport"])).is_err());
        assert!(parse_array_inform(&args(&["array0", "7148"])).is_err());
        assert!(parse_array_inform(&args(&["array0", "7148,7149,7150"])).is_err());
        assert!(parse_array_inform(&args(&["array0"])).is_err());
        assert!(parse_array_inform(&args(&[])).is_err());
    }

    #[test]
    fn test_bad_array_is_skipped_not_fatal() {
        let informs = vec![args(&["array0", "badport"]), args(&["array1", "7150,7151"])];
        let arrays = descriptors_from_informs(&informs);
        assert_eq!(arrays.len(), 1);
        assert_eq!(arrays["array1"].sensor_port, 7151);

        assert!(descriptors_from_informs(&[args(&["array0", "badport"])]).is_empty());
    }
}
