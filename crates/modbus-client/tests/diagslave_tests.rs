use std::time::Duration;

use modbus_client::{ClientConfig, ConnectionManager};

/// Opt-in integration test against a real Modbus TCP simulator (e.g.
/// `diagslave -m tcp -p 1502`). No-ops unless `MODBUS_TEST_HOST` is set.
#[tokio::test]
async fn diagslave_integration_read() {
    let host = match std::env::var("MODBUS_TEST_HOST") {
        Ok(value) => value,
        Err(_) => return,
    };

    let port = env_u16("MODBUS_TEST_PORT").unwrap_or(1502);
    let unit_id = env_u16("MODBUS_TEST_UNIT_ID").unwrap_or(1);
    let start = env_u16("MODBUS_TEST_START").unwrap_or(0);
    let count = env_u16("MODBUS_TEST_COUNT").unwrap_or(8);

    let config = ClientConfig {
        connection_string: format!("modbus:tcp://{host}:{port}?unit-identifier={unit_id}"),
        request_timeout: Duration::from_millis(env_u64("MODBUS_TEST_TIMEOUT_MS").unwrap_or(1_000)),
        max_retries: env_usize("MODBUS_TEST_RETRY_COUNT").unwrap_or(1),
        initial_backoff: Duration::from_millis(env_u64("MODBUS_TEST_RETRY_BACKOFF_MS").unwrap_or(100)),
        max_backoff: Duration::from_millis(env_u64("MODBUS_TEST_RETRY_MAX_BACKOFF_MS").unwrap_or(500)),
        jitter: 0.0,
    };

    let manager = ConnectionManager::new(config).expect("valid config");
    manager.start().await.expect("start");

    // give the reconnect loop a moment to establish the first connection.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let values = manager.read_holding_registers(start, count).await.expect("read");
    assert_eq!(values.len() as u16, count);

    manager.close().await;
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
