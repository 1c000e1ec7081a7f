/*! Integration tests for siteagent.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - wire: Frame layout as seen by a foreign agent
 * - peer: Upstream links and the downstream listener over real sockets
 * - vsite: The update state machine against the in-memory database
 * - site: Whole reactor scenarios (bootstrap, refreshes, failures, heartbeat)
 */

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("siteagent=info".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

mod helpers;
mod peer;
mod vsite;
mod wire;
