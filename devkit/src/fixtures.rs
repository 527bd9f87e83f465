/*!
Line and payload builders for scripting `MockKatcpServer`

Informs carry the layout the poller parses:
`#sensor-value <timestamp> <count> <name> <status> <value>` and
`#array-list <name> <data_port>,<sensor_port>`.
*/

use chrono::Utc;

/// KATCP argument escaping (space, backslash, control chars, empty)
pub fn escape_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "\\@".to_string();
    }
    let mut out = String::with_capacity(arg.len());
    for c in arg.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\_"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1b' => out.push_str("\\e"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn timestamp() -> String {
    format!("{:.3}", Utc::now().timestamp_millis() as f64 / 1000.0)
}

pub fn sensor_value_inform(name: &str, status: &str, value: &str) -> String {
    format!(
        "#sensor-value {} 1 {} {} {}",
        timestamp(),
        escape_arg(name),
        escape_arg(status),
        escape_arg(value)
    )
}

/// Full-table answer: one inform per sensor, then `!sensor-value ok <n>`
pub fn sensor_table(sensors: &[(&str, &str, &str)]) -> Vec<String> {
    let mut lines: Vec<String> = sensors
        .iter()
        .map(|(name, status, value)| sensor_value_inform(name, status, value))
        .collect();
    lines.push(format!("!sensor-value ok {}", sensors.len()));
    lines
}

/// Answer for `?sensor-value <name>`
pub fn single_sensor(name: &str, value: &str) -> Vec<String> {
    vec![sensor_value_inform(name, "nominal", value), "!sensor-value ok 1".to_string()]
}

pub fn array_list(arrays: &[(&str, u16, u16)]) -> Vec<String> {
    let mut lines: Vec<String> = arrays
        .iter()
        .map(|(name, data_port, sensor_port)| format!("#array-list {} {data_port},{sensor_port}", escape_arg(name)))
        .collect();
    lines.push(format!("!array-list ok {}", arrays.len()));
    lines
}

pub fn array_list_fail(reason: &str) -> Vec<String> {
    vec![format!("!array-list fail {}", escape_arg(reason))]
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// `input-labelling` value: `[('ant0_x', 0, 'skarab020709-01', 0), ...]`
/// from `(label, functional_host)` pairs
pub fn input_labelling_payload(labels: &[(&str, &str)]) -> String {
    let records: Vec<String> = labels
        .iter()
        .enumerate()
        .map(|(i, (label, host))| format!("({}, {}, {}, {})", quote(label), i, quote(host), i % 2))
        .collect();
    format!("[{}]", records.join(", "))
}

/// `hostname-functional-mapping` value: `{'skarab020709-01': 'fhost00', ...}`
/// from `(functional_host, logical_host)` pairs
pub fn hostname_mapping_payload(hosts: &[(&str, &str)]) -> String {
    let pairs: Vec<String> = hosts
        .iter()
        .map(|(functional, logical)| format!("{}: {}", quote(functional), quote(logical)))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shapes() {
        assert_eq!(
            input_labelling_payload(&[("ant0_x", "skarab020709-01"), ("ant0_y", "skarab020709-01")]),
            "[('ant0_x', 0, 'skarab020709-01', 0), ('ant0_y', 1, 'skarab020709-01', 1)]"
        );
        assert_eq!(
            hostname_mapping_payload(&[("skarab020709-01", "fhost00")]),
            "{'skarab020709-01': 'fhost00'}"
        );
    }

    #[test]
    fn test_sensor_lines_are_escaped() {
        let line = sensor_value_inform("input-labelling", "nominal", "[('a', 0)]");
        assert!(line.ends_with(" input-labelling nominal [('a',\\_0)]"));
        assert_eq!(sensor_table(&[]).last().unwrap(), "!sensor-value ok 0");
        assert_eq!(escape_arg(""), "\\@");
    }
}
