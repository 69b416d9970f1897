//! `state` and `creds` report commands.

use chrono::{DateTime, Utc};
use std::io::Write;
use tsnode_secrets::CredentialStore;
use tsnode_state::StateStore;

use crate::error::CliResult;

/// `state list`: node count, then one line per node in id order.
pub fn list(store: &StateStore, now: DateTime<Utc>, out: &mut impl Write) -> CliResult<()> {
    let state = store.load()?;
    let noun = if state.len() == 1 { "node" } else { "nodes" };
    writeln!(out, "You have {} {noun} deployed.", state.len())?;
    for record in state.list() {
        writeln!(
            out,
            "  {:>3}  {:<40}  {}",
            record.id,
            record.name,
            format_age(record.age(now))
        )?;
    }
    Ok(())
}

/// `state dump`: the whole state container as pretty JSON.
pub fn dump(store: &StateStore, out: &mut impl Write) -> CliResult<()> {
    let state = store.load()?;
    writeln!(out, "{}", serde_json::to_string_pretty(&state)?)?;
    Ok(())
}

/// `creds delete`
pub fn delete_credentials(store: &CredentialStore, out: &mut impl Write) -> CliResult<()> {
    if store.delete()? {
        writeln!(out, "Credentials deleted.")?;
    } else {
        writeln!(out, "No stored credentials.")?;
    }
    Ok(())
}

fn format_age(age: chrono::Duration) -> String {
    let minutes = age.num_minutes().max(0);
    let (days, hours, mins) = (minutes / 1440, (minutes / 60) % 24, minutes % 60);
    match (days, hours) {
        (0, 0) => format!("{mins}m"),
        (0, _) => format!("{hours}h {mins}m"),
        _ => format!("{days}d {hours}h"),
    }
}
