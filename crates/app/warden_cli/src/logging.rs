use flexi_logger::{DeferredNow, Logger};
use log::Record;

use crate::Error;

/// `LEVEL message`, without timestamps. Stdout is reserved for command output.
fn cli_format(w: &mut dyn std::io::Write, _now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    write!(w, "{:<5} {}", record.level(), record.args())
}

pub fn init() -> Result<(), Error> {
    Logger::try_with_env_or_str("info")?
        .format(cli_format)
        .log_to_stderr()
        .start()?;

    Ok(())
}
