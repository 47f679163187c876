// SPDX-License-Identifier: Apache-2.0

//! The diagnostic side channel end to end: every live component shows up
//! in its statistics table through the command registry.

use corun::coroutine::CoroutineManager;
use corun::mcache::{Cache, CacheHooks};
use corun::threading::ThreadPool;

#[test]
fn stats_channels_track_component_lifetimes() {
    let mgr = CoroutineManager::new("itDiagCo", 16, 2).expect("manager");
    let pool = ThreadPool::new("itDiagTp", 2, None).expect("pool");
    let cache: Cache<u64, u64> = Cache::new("itDiagMc", 32, CacheHooks {
        freeable: Box::new(|_| true),
        clean: None,
        dump: None,
    })
    .expect("cache");

    let out = corun::admin::handle(&["costat", "get"]);
    assert!(out.contains("itDiagCo"));
    assert!(out.contains("LwtSemup"));

    let out = corun::admin::handle(&["tpstat", "get"]);
    assert!(out.contains("itDiagTp"));

    let out = corun::admin::handle(&["mcstat", "get"]);
    assert!(out.contains("itDiagMc"));

    // Help aggregates every registered command.
    let out = corun::admin::handle(&["help"]);
    assert!(out.contains("costat"));
    assert!(out.contains("tpstat"));
    assert!(out.contains("mcstat"));

    // Unknown commands fall back to the help listing.
    let out = corun::admin::handle(&["nonsense"]);
    assert!(out.contains("costat"));

    drop(cache);
    drop(pool);
    drop(mgr);

    // With the last component gone the channels unregister themselves.
    let out = corun::admin::handle(&["costat", "get"]);
    assert!(!out.contains("itDiagCo"));
}
