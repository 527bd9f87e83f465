/*!
# CBF DevKit - KATCP stubs and fixtures for poller tests

Helpers for testing the sensor poller without a live correlator:
- Scripted KATCP server on a loopback port
- Builders for `#sensor-value` / `#array-list` lines and literal payloads
- A harness wiring a primary endpoint to per-array servers
*/

pub mod fixtures;
pub mod katcp_stub;
pub mod test_utils;

pub use katcp_stub::MockKatcpServer;
pub use test_utils::{MockArray, TestHarness};
