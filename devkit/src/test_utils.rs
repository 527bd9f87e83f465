/*!
Test harness for the sensor poller

Wires up a complete fake instrument:
- A primary `MockKatcpServer` answering `?array-list`
- Per array, a data server (`input-labelling`) and a sensor server
  (`hostname-functional-mapping` and the full sensor table)
- A temporary `json_dumps` directory for the snapshots
*/

use crate::fixtures;
use crate::katcp_stub::MockKatcpServer;
use anyhow::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub struct MockArray {
    pub name: String,
    pub data: MockKatcpServer,
    pub sensors: MockKatcpServer,
}

impl MockArray {
    /// Replace the full sensor table served by this array
    pub fn set_sensors(&self, sensors: &[(&str, &str, &str)]) {
        self.sensors.on_request("sensor-value", fixtures::sensor_table(sensors));
    }
}

pub struct TestHarness {
    pub primary: MockKatcpServer,
    pub arrays: Vec<MockArray>,
    dumps: TempDir,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        env_logger::try_init().ok();

        let primary = MockKatcpServer::start().await?;
        primary.on_request("array-list", fixtures::array_list_fail("no running arrays"));
        Ok(Self {
            primary,
            arrays: Vec::new(),
            dumps: tempfile::tempdir()?,
        })
    }

    /// Start the servers for one array and list it on the primary.
    /// `hosts` are `(functional, logical)`, `labels` are `(label, functional)`.
    pub async fn add_array(
        &mut self,
        name: &str,
        hosts: &[(&str, &str)],
        labels: &[(&str, &str)],
        sensors: &[(&str, &str, &str)],
    ) -> Result<&MockArray> {
        let data = MockKatcpServer::start().await?;
        data.on_request(
            "sensor-value input-labelling",
            fixtures::single_sensor("input-labelling", &fixtures::input_labelling_payload(labels)),
        );

        let sensor_server = MockKatcpServer::start().await?;
        sensor_server.on_request(
            "sensor-value hostname-functional-mapping",
            fixtures::single_sensor(
                "hostname-functional-mapping",
                &fixtures::hostname_mapping_payload(hosts),
            ),
        );

        let array = MockArray {
            name: name.to_string(),
            data,
            sensors: sensor_server,
        };
        array.set_sensors(sensors);
        self.arrays.push(array);
        self.publish_array_list();

        log::info!("🧪 Added mock array {}", name);
        Ok(&self.arrays[self.arrays.len() - 1])
    }

    fn publish_array_list(&self) {
        let listed: Vec<(&str, u16, u16)> = self
            .arrays
            .iter()
            .map(|a| (a.name.as_str(), a.data.port(), a.sensors.port()))
            .collect();
        self.primary.on_request("array-list", fixtures::array_list(&listed));
    }

    pub fn array(&self, name: &str) -> Option<&MockArray> {
        self.arrays.iter().find(|a| a.name == name)
    }

    /// Primary endpoint, `127.0.0.1:<port>`
    pub fn katcp_endpoint(&self) -> String {
        self.primary.endpoint()
    }

    pub fn dumps_dir(&self) -> &Path {
        self.dumps.path()
    }

    pub fn snapshot_path(&self, instrument: &str, array: &str, ordered: bool) -> PathBuf {
        let suffix = if ordered { "ordered_sensor_values.json" } else { "sensor_values.json" };
        self.dumps_dir().join(format!("{instrument}.{array}.{suffix}"))
    }

    /// Poll until the file exists and parses as JSON
    pub async fn wait_for_snapshot(&self, path: &Path, timeout: Duration) -> Result<Value> {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if let Ok(text) = tokio::fs::read_to_string(path).await {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    log::info!("✅ Snapshot available at {}", path.display());
                    return Ok(value);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        anyhow::bail!("Timeout waiting for snapshot {}", path.display());
    }

    /// Poll `condition` every 20ms until it holds
    pub async fn wait_until<F: Fn() -> bool>(&self, condition: F, timeout: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        anyhow::bail!("Condition not met within {:?}", timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_array_list_follows_added_arrays() {
        let mut harness = TestHarness::new().await.unwrap();
        harness.add_array("array0", &[], &[], &[]).await.unwrap();
        harness.add_array("array1", &[], &[], &[]).await.unwrap();

        let data_port = harness.array("array1").unwrap().data.port();
        let state = harness.primary.requests();
        assert!(state.is_empty());
        assert!(harness.array("array2").is_none());
        assert_ne!(data_port, harness.primary.port());
        assert!(harness
            .snapshot_path("inst", "array0", true)
            .ends_with("inst.array0.ordered_sensor_values.json"));
    }
}
