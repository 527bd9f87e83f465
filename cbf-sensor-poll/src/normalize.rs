//! Sensor normalizer
//!
//! Turns the raw `?sensor-value` table of one array into display-ready
//! per-host signal chains:
//! - keep only `device-status` sensors of one host class (`fhost`/`xhost`)
//! - shorten verbose mnemonics so they fit a dashboard button
//! - attach the host's display name, identity and (fhost) input label
//! - reorder every host's entries into the class's canonical signal chain
//!
//! A second view, the non-nominal index, lists every host sensor that is
//! not `nominal` with its raw value.

use crate::error::{PollError, Result};
use crate::katcp::KatcpSession;
use crate::mapping::{canonical_input_code, Mappings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEVICE_STATUS: &str = "device-status";
pub const NOMINAL: &str = "nominal";
/// Status slot of the input-label entry
pub const INPUT_LABEL_TAG: &str = "inputlabel";
const UNKNOWN_STATUS: &str = "unknown";

pub const FHOST_CHAIN: [&str; 9] = [
    "-02", "input", "network", "spead-rx", "Net-ReOrd", "cd", "pfb", "ct", "spead-tx",
];
pub const XHOST_CHAIN: [&str; 8] = [
    "-02", "network", "spead-rx", "Net-ReOrd", "hmcReOrd", "bramReOrd", "vacc", "spead-tx",
];

/// Engine-level leaves an xhost row shows
const XENG_LEAVES: [&str; 3] = ["vacc", "spead-tx", "bramReOrd"];

/// Current status and value of one sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReading {
    pub status: String,
    pub value: String,
}

impl SensorReading {
    pub fn new(status: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            value: value.into(),
        }
    }
}

/// Sorted by sensor name, so iteration is lexicographic
pub type RawSensorTable = BTreeMap<String, SensorReading>;

/// `[label, status]`, serialized as a two element JSON array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorEntry(pub String, pub String);

impl SensorEntry {
    pub fn new(label: impl Into<String>, status: impl Into<String>) -> Self {
        Self(label.into(), status.into())
    }

    pub fn label(&self) -> &str {
        &self.0
    }

    pub fn status(&self) -> &str {
        &self.1
    }

    /// A chain token matches by label substring; the input-label entry is
    /// matched through its tag.
    fn matches(&self, token: &str) -> bool {
        self.0.contains(token) || (self.1 == INPUT_LABEL_TAG && INPUT_LABEL_TAG.starts_with(token))
    }
}

/// `[sensor_name, status, value]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonNominalSensor(pub String, pub String, pub String);

pub type NormalizedHostSensors = BTreeMap<String, Vec<SensorEntry>>;
pub type NonNominalIndex = BTreeMap<String, Vec<NonNominalSensor>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostClass {
    FHost,
    XHost,
}

impl HostClass {
    pub const ALL: [HostClass; 2] = [HostClass::FHost, HostClass::XHost];

    pub fn prefix(self) -> &'static str {
        match self {
            HostClass::FHost => "fhost",
            HostClass::XHost => "xhost",
        }
    }

    pub fn chain(self) -> &'static [&'static str] {
        match self {
            HostClass::FHost => &FHOST_CHAIN,
            HostClass::XHost => &XHOST_CHAIN,
        }
    }
}

/// Display-sized names for verbose sensor leaves. Exact match only.
pub fn shorten_mnemonic(leaf: &str) -> &str {
    match leaf {
        "network-reorder" => "Net-ReOrd",
        "missing-pkts" => "hmcReOrd",
        "bram-reorder" => "bramReOrd",
        other => other,
    }
}

/// Key used for a host in the snapshot: the class letter is dropped,
/// `fhost00` -> `host00`. Hosts of another class are returned as-is.
pub fn display_host_id(logical_host: &str, class: HostClass) -> String {
    if logical_host.starts_with(class.prefix()) {
        logical_host[1..].to_string()
    } else {
        logical_host.to_string()
    }
}

/// Slot number plus the board serial: `fhost00` on `skarab020709-01`
/// becomes `00-020709`.
pub fn display_name(logical_host: &str, functional_host: &str, class: HostClass) -> String {
    let slot = logical_host.replace(class.prefix(), "");
    let board = functional_host.replace("skarab", "-");
    let board = board.strip_suffix("-01").unwrap_or(&board);
    format!("{slot}{board}")
}

/// What one device-status sensor contributes to its host's row
#[derive(Debug, Clone, PartialEq, Eq)]
enum Decoded {
    /// `<host>.device-status`: the host's own status
    HostStatus(String),
    Entry(SensorEntry),
}

/// Decode `<host>[.<engine>].<leaf>` with a `device-status` segment
/// anywhere after the host. Returns the lowercased host.
fn decode_device_status(name: &str, status: &str, class: HostClass) -> Option<(String, Decoded)> {
    let mut segments = name.split('.');
    let host = segments.next()?.to_lowercase();
    if !host.starts_with(class.prefix()) {
        return None;
    }
    let rest: Vec<&str> = segments.collect();
    if !rest.contains(&DEVICE_STATUS) {
        return None;
    }
    let path: Vec<&str> = rest
        .into_iter()
        .filter(|s| *s != DEVICE_STATUS)
        .map(shorten_mnemonic)
        .collect();

    let decoded = match path.as_slice() {
        [] => Decoded::HostStatus(status.to_string()),
        [leaf] => Decoded::Entry(SensorEntry::new(*leaf, status)),
        [engine, leaf] if class == HostClass::XHost && engine.starts_with("xeng") && XENG_LEAVES.contains(leaf) => {
            Decoded::Entry(SensorEntry::new(*leaf, status))
        }
        _ => {
            debug!("Dropping nested sensor {} from the {} chain", name, class.prefix());
            return None;
        }
    };
    Some((host, decoded))
}

#[derive(Debug, Default)]
struct HostGroup {
    host_status: Option<String>,
    entries: Vec<SensorEntry>,
}

fn group_by_host(table: &RawSensorTable, class: HostClass) -> BTreeMap<String, HostGroup> {
    let mut groups: BTreeMap<String, HostGroup> = BTreeMap::new();
    for (name, reading) in table {
        let Some((host, decoded)) = decode_device_status(name, &reading.status, class) else {
            continue;
        };
        let group = groups.entry(host).or_default();
        match decoded {
            Decoded::HostStatus(status) => group.host_status = Some(status),
            Decoded::Entry(entry) => group.entries.push(entry),
        }
    }
    groups
}

/// Put `[display_name, host_status]` and `[host_id, functional_host]` at
/// the front. Does nothing if the row already starts with the display name.
pub fn attach_host_identity(
    entries: &mut Vec<SensorEntry>,
    display_name: &str,
    host_status: &str,
    host_id: &str,
    functional_host: &str,
) {
    if entries.first().map(|e| e.label() == display_name).unwrap_or(false) {
        return;
    }
    entries.insert(0, SensorEntry::new(host_id, functional_host));
    entries.insert(0, SensorEntry::new(display_name, host_status));
}

/// Order entries along `chain`: each token claims the first unclaimed
/// entry that matches it; unmatched entries follow in their original order.
/// Missing tokens leave no gap. The result holds at most `chain.len()`
/// entries; the cap applies after ordering, so chain members are never
/// displaced by the identity or input label entries. Applying it twice
/// changes nothing.
pub fn canonical_reorder(entries: Vec<SensorEntry>, chain: &[&str]) -> Vec<SensorEntry> {
    let mut remaining: Vec<Option<SensorEntry>> = entries.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(remaining.len());
    for token in chain {
        let slot = remaining
            .iter_mut()
            .find(|slot| matches!(slot, Some(entry) if entry.matches(token)));
        if let Some(slot) = slot {
            ordered.extend(slot.take());
        }
    }
    ordered.extend(remaining.into_iter().flatten());
    ordered.truncate(chain.len());
    ordered
}

/// Normalize one host class. Hosts without a hostname mapping, or fhosts
/// without an input label, are skipped with a warning.
pub fn normalize_class(table: &RawSensorTable, mappings: &Mappings, class: HostClass) -> NormalizedHostSensors {
    let mut normalized = NormalizedHostSensors::new();
    for (host, group) in group_by_host(table, class) {
        let Some(functional) = mappings.hostnames.get(&host) else {
            warn!("No hostname mapping for {}, skipping host", host);
            continue;
        };
        let host_id = display_host_id(&host, class);
        let name = display_name(&host, functional, class);
        let status = group.host_status.as_deref().unwrap_or(UNKNOWN_STATUS);

        let mut entries = group.entries;
        attach_host_identity(&mut entries, &name, status, &host_id, functional);

        if class == HostClass::FHost {
            let Some(label) = mappings.input_labels.get(functional) else {
                warn!("No input label for {} ({}), skipping host", host, functional);
                continue;
            };
            entries.push(SensorEntry::new(canonical_input_code(label), INPUT_LABEL_TAG));
        }

        normalized.insert(host_id, canonical_reorder(entries, class.chain()));
    }
    normalized
}

/// Merge two class outputs. When both classes produce the same key (the f-
/// and x-boards of one slot), the second row is appended to the first.
pub fn merge(mut primary: NormalizedHostSensors, secondary: NormalizedHostSensors) -> NormalizedHostSensors {
    for (host, entries) in secondary {
        primary.entry(host).or_default().extend(entries);
    }
    primary
}

/// Both host classes, merged
pub fn normalize_array(table: &RawSensorTable, mappings: &Mappings) -> NormalizedHostSensors {
    HostClass::ALL
        .iter()
        .map(|class| normalize_class(table, mappings, *class))
        .fold(NormalizedHostSensors::new(), merge)
}

/// Every `?host*` sensor whose status is not nominal, keyed by host
pub fn non_nominal_index(table: &RawSensorTable) -> NonNominalIndex {
    let mut index = NonNominalIndex::new();
    for (name, reading) in table {
        let host = name.split('.').next().unwrap_or_default().to_lowercase();
        let is_host = host.get(1..).map(|h| h.starts_with("host")).unwrap_or(false);
        if !is_host || reading.status == NOMINAL {
            continue;
        }
        index.entry(host).or_default().push(NonNominalSensor(
            name.clone(),
            reading.status.clone(),
            reading.value.clone(),
        ));
    }
    index
}

/// `#sensor-value <timestamp> <count> <name> <status> [<value>]`
pub fn table_from_informs(informs: &[Vec<String>]) -> RawSensorTable {
    informs
        .iter()
        .filter_map(|args| match args.as_slice() {
            [_, _, name, status, rest @ ..] => Some((
                name.clone(),
                SensorReading::new(status.clone(), rest.first().cloned().unwrap_or_default()),
            )),
            _ => {
                debug!("Ignoring short sensor-value inform {:?}", args);
                None
            }
        })
        .collect()
}

/// Fetch the full sensor table from the array's sensor port
pub async fn fetch_raw_sensors(session: &KatcpSession, timeout: Duration) -> Result<RawSensorTable> {
    let reply = session.request_ok("sensor-value", None, timeout).await?;
    let count = reply
        .arguments
        .first()
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(reply.informs.len());
    if count == 0 || reply.informs.is_empty() {
        return Err(PollError::protocol("sensor-value", "no sensors"));
    }
    let table = table_from_informs(&reply.informs);
    debug!("Fetched {} sensors", table.len());
    Ok(table)
}
