// SPDX-License-Identifier: Apache-2.0

//! `tpstat` diagnostic channel: per-pool, per-thread job gauges.

use crate::pool::PoolShared;
use corun_admin::Printer;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Weak};

const TPSTAT_CMD: &str = "tpstat";
/// Gauges per table row.
const TPCOUNT: usize = 8;

static POOLS: LazyLock<Mutex<BTreeMap<String, Weak<PoolShared>>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

pub(crate) fn register(shared: &Arc<PoolShared>) {
    let mut pools = POOLS.lock();
    if pools.contains_key(&shared.name) {
        tracing::error!(pool = %shared.name, "pool already registered");
        return;
    }

    if pools.is_empty() {
        if let Err(e) = corun_admin::register(TPSTAT_CMD, help, handler) {
            tracing::error!(error = %e, "failed to register tpstat command");
        }
    }

    let _ = pools.insert(shared.name.clone(), Arc::downgrade(shared));
}

pub(crate) fn unregister(name: &str) {
    let mut pools = POOLS.lock();
    let _ = pools.remove(name);
    if pools.is_empty() {
        corun_admin::unregister(TPSTAT_CMD);
    }
}

fn help(p: &mut Printer) {
    p.line(&format!(
        "Usage: \t{TPSTAT_CMD:<10} {:<10}{{help information}}",
        "help"
    ));
    p.line(&format!(
        "\t{TPSTAT_CMD:<10} {:<10}{{get statistic data}}",
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
    p.line("---------------------------------------------------------------------");
    p.line(&format!(
        "| {:<12} | {:>5} | {:^48} |",
        "Name", "Total", "JobsPerThread"
    ));
    p.line("---------------------------------------------------------------------");

    for pool in POOLS.lock().values().filter_map(Weak::upgrade) {
        let queued = pool.queued_jobs();
        for (row, chunk) in queued.chunks(TPCOUNT).enumerate() {
            let mut cols = String::new();
            for i in 0..TPCOUNT {
                let cell = chunk
                    .get(i)
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                cols.push_str(&format!(" {cell:>4} |"));
            }

            if row == 0 {
                p.line(&format!(
                    "| {:<12} | {:>5} |{}",
                    pool.name,
                    queued.len(),
                    cols
                ));
            } else {
                p.line(&format!("| {:<12} | {:>5} |{}", " ", " ", cols));
            }
        }
    }

    p.line("---------------------------------------------------------------------");
}

#[cfg(test)]
mod tests {
    use crate::pool::ThreadPool;

    #[test]
    fn tpstat_lists_live_pools() {
        let pool = ThreadPool::new("tpStat", 2, None).expect("pool");
        let out = corun_admin::handle(&["tpstat", "get"]);
        assert!(out.contains("tpStat"));
        drop(pool);
    }

    #[test]
    fn tpstat_rejects_bad_args_with_help() {
        let pool = ThreadPool::new("tpHelp", 1, None).expect("pool");
        let out = corun_admin::handle(&["tpstat", "bogus"]);
        assert!(out.contains("Usage:"));
        drop(pool);
    }
}
