// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

/// Time a condition gets to become true before the test fails.
const WAIT_FOR_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls the condition until it holds, panics when it doesn't in time.
pub async fn wait_for(condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(WAIT_FOR_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;

    assert!(result.is_ok(), "Condition not met within {:?}", WAIT_FOR_TIMEOUT);
}

/// Enables log output for tests, run them with `RUST_LOG=streamsync=debug` to see it.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
