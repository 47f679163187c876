// SPDX-License-Identifier: Apache-2.0

//! Global command table and dispatch.

use crate::error::Error;
use crate::session::Printer;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::LazyLock;

type HelpFn = Box<dyn Fn(&mut Printer) + Send + Sync>;
type HandlerFn = Box<dyn Fn(&mut Printer, &[&str]) + Send + Sync>;

struct Command {
    help: HelpFn,
    handler: HandlerFn,
}

/// Commands keyed by lower-cased name; names are case-insensitive-unique.
static COMMANDS: LazyLock<RwLock<BTreeMap<String, Command>>> =
    LazyLock::new(|| RwLock::new(BTreeMap::new()));

/// Register a command under `name`.
///
/// `help` prints usage rows; `handler` receives the full argument vector
/// (including the command name at position 0).
///
/// # Errors
///
/// [`Error::Reserved`] for the name `help`, [`Error::Duplicate`] if the name
/// is already taken.
pub fn register<H, F>(name: &str, help: H, handler: F) -> Result<(), Error>
where
    H: Fn(&mut Printer) + Send + Sync + 'static,
    F: Fn(&mut Printer, &[&str]) + Send + Sync + 'static,
{
    let key = name.to_ascii_lowercase();
    if key == "help" {
        return Err(Error::Reserved);
    }

    let mut commands = COMMANDS.write();
    if commands.contains_key(&key) {
        tracing::error!(command = name, "command already registered");
        return Err(Error::Duplicate {
            name: name.to_string(),
        });
    }

    let _ = commands.insert(
        key,
        Command {
            help: Box::new(help),
            handler: Box::new(handler),
        },
    );
    Ok(())
}

/// Remove a command. Unknown names are ignored.
pub fn unregister(name: &str) {
    let _ = COMMANDS.write().remove(&name.to_ascii_lowercase());
}

enum HelpMode {
    All,
    One(String),
    None,
}

fn help_mode(args: &[&str]) -> HelpMode {
    let Some(first) = args.first() else {
        return HelpMode::All;
    };

    let commands = COMMANDS.read();
    if first.eq_ignore_ascii_case("help") {
        return match args.get(1) {
            Some(topic) if commands.contains_key(&topic.to_ascii_lowercase()) => {
                HelpMode::One(topic.to_ascii_lowercase())
            }
            _ => HelpMode::All,
        };
    }

    if commands.contains_key(&first.to_ascii_lowercase()) {
        HelpMode::None
    } else {
        HelpMode::All
    }
}

/// Resolve and run a command line, returning its accumulated output.
///
/// An empty argument vector, an unknown command, or a leading `help` all
/// produce help output instead of dispatching.
pub fn handle(args: &[&str]) -> String {
    let mut printer = Printer::new();

    match help_mode(args) {
        HelpMode::All => {
            let commands = COMMANDS.read();
            for cmd in commands.values() {
                (cmd.help)(&mut printer);
            }
        }
        HelpMode::One(key) => {
            let commands = COMMANDS.read();
            if let Some(cmd) = commands.get(&key) {
                (cmd.help)(&mut printer);
            }
        }
        HelpMode::None => {
            let key = args[0].to_ascii_lowercase();
            let commands = COMMANDS.read();
            if let Some(cmd) = commands.get(&key) {
                (cmd.handler)(&mut printer, args);
            }
        }
    }

    printer.into_output()
}
