// SPDX-License-Identifier: Apache-2.0

//! `costat` diagnostic channel: per-manager operation latency and task
//! distribution tables.

use crate::manager::ManagerCore;
use corun_admin::Printer;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Weak};

const COSTAT_CMD: &str = "costat";
/// Workers per distribution-table row.
const COCOUNT: usize = 6;

static MANAGERS: LazyLock<Mutex<BTreeMap<String, Weak<ManagerCore>>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

pub(crate) fn register(core: &Arc<ManagerCore>) {
    let mut managers = MANAGERS.lock();
    if managers.contains_key(&core.name) {
        tracing::error!(manager = %core.name, "manager already registered");
        return;
    }

    if managers.is_empty() {
        if let Err(e) = corun_admin::register(COSTAT_CMD, help, handler) {
            tracing::error!(error = %e, "failed to register costat command");
        }
    }

    let _ = managers.insert(core.name.clone(), Arc::downgrade(core));
}

pub(crate) fn unregister(name: &str) {
    let mut managers = MANAGERS.lock();
    let _ = managers.remove(name);
    if managers.is_empty() {
        corun_admin::unregister(COSTAT_CMD);
    }
}

fn help(p: &mut Printer) {
    p.line(&format!(
        "Usage: \t{COSTAT_CMD:<10} {:<10}{{help information}}",
        "help"
    ));
    p.line(&format!(
        "\t{COSTAT_CMD:<10} {:<10}{{get statistic data}}",
        "get"
    ));
    p.line(&format!(
        "\t{COSTAT_CMD:<10} {:<10}{{reset statistic data}}",
        "reset"
    ));
}

fn handler(p: &mut Printer, args: &[&str]) {
    if args.len() != 2 {
        help(p);
        return;
    }

    if args[1].eq_ignore_ascii_case("get") {
        print_all(p);
        return;
    }

    if args[1].eq_ignore_ascii_case("reset") {
        for core in MANAGERS.lock().values().filter_map(Weak::upgrade) {
            core.reset_info();
        }
        return;
    }

    help(p);
}

fn print_all(p: &mut Printer) {
    // Operation latency table.
    p.line("---------------------------------------------------------------------");
    p.line(&format!(
        "| {:<10} | {:<10} | {:>8} | {:>8} | {:>10} |",
        "Name", "Operation", "Doing", "Average", "Max"
    ));

    for core in MANAGERS.lock().values().filter_map(Weak::upgrade) {
        p.line("|------------|------------|----------|----------|------------|");
        let info = core.info();
        for (i, op) in info.ops.iter().enumerate() {
            let label = if i == 0 { info.name.as_str() } else { " " };
            p.line(&format!(
                "| {:<10} | {:<10} | {:>8} | {:>8} | {:>10} |",
                label, op.name, op.doing, op.avg_us, op.max_us
            ));
        }
    }
    p.line("---------------------------------------------------------------------");

    // Task distribution table.
    p.line("");
    p.line("---------------------------------------------------------------------");
    p.line(&format!(
        "| {:<10} | {:>5} | {:>5} | {:>5} | {:^29} |",
        "Name", "WMax", "LMax", "LUse", "LwtPerWorker"
    ));

    for core in MANAGERS.lock().values().filter_map(Weak::upgrade) {
        p.line("|------------|-------|-------|-------|-------------------------------|");
        let info = core.info();
        for (row, chunk) in info.per_worker.chunks(COCOUNT).enumerate() {
            let mut cols = String::new();
            for i in 0..COCOUNT {
                let cell = chunk.get(i).map(|v| v.to_string()).unwrap_or_default();
                cols.push_str(&format!(" {cell:>4} |"));
            }

            if row == 0 {
                p.line(&format!(
                    "| {:<10} | {:>5} | {:>5} | {:>5} |{}",
                    info.name, info.worker_total, info.lwt_total, info.lwt_used, cols
                ));
            } else {
                p.line(&format!(
                    "| {:<10} | {:>5} | {:>5} | {:>5} |{}",
                    " ", " ", " ", " ", cols
                ));
            }
        }
    }
    p.line("---------------------------------------------------------------------");
}

#[cfg(test)]
mod tests {
    use crate::manager::CoroutineManager;

    #[test]
    fn costat_lists_live_managers() {
        let mgr = CoroutineManager::new("coStatT", 16, 1).expect("manager");
        let out = corun_admin::handle(&["costat", "get"]);
        assert!(out.contains("coStatT"));
        assert!(out.contains("LwtRun"));

        let out = corun_admin::handle(&["costat", "reset"]);
        assert!(out.is_empty());
        drop(mgr);
    }
}
