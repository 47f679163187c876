// SPDX-License-Identifier: Apache-2.0

//! `mcstat` diagnostic channel: per-cache occupancy and depth tables.

use crate::cache::CacheCore;
use corun_admin::Printer;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::{Arc, LazyLock, Weak};

const MCSTAT_CMD: &str = "mcstat";

/// Type-erased view of a registered cache.
trait StatSource: Send + Sync {
    fn info(&self) -> crate::cache::CacheInfo;
}

impl<K, V> StatSource for CacheCore<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Default + Send + Sync + 'static,
{
    fn info(&self) -> crate::cache::CacheInfo {
        CacheCore::info(self)
    }
}

static CACHES: LazyLock<Mutex<BTreeMap<String, Weak<dyn StatSource>>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

pub(crate) fn register<K, V>(core: &Arc<CacheCore<K, V>>)
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Default + Send + Sync + 'static,
{
    let name = core.info().name;
    let mut caches = CACHES.lock();
    if caches.contains_key(&name) {
        tracing::error!(cache = %name, "cache already registered");
        return;
    }

    if caches.is_empty() {
        if let Err(e) = corun_admin::register(MCSTAT_CMD, help, handler) {
            tracing::error!(error = %e, "failed to register mcstat command");
        }
    }

    let core: Arc<dyn StatSource> = core.clone();
    let source: Weak<dyn StatSource> = Arc::downgrade(&core);
    let _ = caches.insert(name, source);
}

pub(crate) fn unregister(name: &str) {
    let mut caches = CACHES.lock();
    let _ = caches.remove(name);
    if caches.is_empty() {
        corun_admin::unregister(MCSTAT_CMD);
    }
}

fn help(p: &mut Printer) {
    p.line(&format!(
        "Usage: \t{MCSTAT_CMD:<10} {:<10}{{help information}}",
        "help"
    ));
    p.line(&format!(
        "\t{MCSTAT_CMD:<10} {:<10}{{get statistic data}}",
        "get"
    ));
}

fn handler(p: &mut Printer, args: &[&str]) {
    if args.len() != 2 || !args[1].eq_ignore_ascii_case("get") {
        help(p);
        return;
    }

    print_all(p);
}

fn print_all(p: &mut Printer) {
    p.line("-------------------------------------------------------------------------------------");
    p.line(&format!(
        "| {:<8} | {:^33} | {:^30} |",
        " ", "Hash Map", "Item"
    ));
    p.line(&format!(
        "| {:<8} | {:>7} | {:>8} | {:>3} | {:>3} | {:>3} | {:>4} | {:>8} | {:>8} |",
        "Name", "Bucket", "Total", "Min", "Max", "Avg", "Size", "Free", "InUse"
    ));
    p.line("-------------------------------------------------------------------------------------");

    for cache in CACHES.lock().values().filter_map(Weak::upgrade) {
        let info = cache.info();
        p.line(&format!(
            "| {:<8} | {:>7} | {:>8} | {:>3} | {:>3} | {:>3} | {:>4} | {:>8} | {:>8} |",
            info.name,
            info.map.buckets,
            info.map.total_keys,
            info.map.min_depth,
            info.map.max_depth,
            info.map.avg_depth,
            info.item_size,
            info.free_count,
            info.inuse_count,
        ));
    }

    p.line("-------------------------------------------------------------------------------------");
}

#[cfg(test)]
mod tests {
    use crate::cache::{Cache, CacheHooks};

    #[test]
    fn mcstat_lists_live_caches() {
        let cache: Cache<u64, u64> = Cache::new(
            "mcStatT",
            32,
            CacheHooks {
                freeable: Box::new(|_| true),
                clean: None,
                dump: None,
            },
        )
        .expect("cache");

        let out = corun_admin::handle(&["mcstat", "get"]);
        assert!(out.contains("mcStatT"));
        drop(cache);
    }
}
