use anyhow::Result;
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use std::io::{IsTerminal, Write};

/// Print `ERROR: <message>` to stderr, the prefix in red on a terminal.
pub fn error(message: &str) -> Result<()> {
    write_prefixed(&mut std::io::stderr(), "ERROR:", Color::Red, message)
}

/// Print `Warn: <message>` to stderr, the prefix in yellow on a terminal.
pub fn warn(message: &str) -> Result<()> {
    write_prefixed(&mut std::io::stderr(), "Warn:", Color::Yellow, message)
}

/// Print `Success: <message>` to stdout.
pub fn success(message: &str) -> Result<()> {
    write_prefixed(&mut std::io::stdout(), "Success:", Color::Green, message)
}

fn write_prefixed<W>(out: &mut W, prefix: &str, color: Color, message: &str) -> Result<()>
where
    W: Write + IsTerminal,
{
    if out.is_terminal() {
        execute!(
            out,
            SetForegroundColor(color),
            Print(prefix),
            ResetColor,
            Print(format!(" {}\n", message))
        )?;
    } else {
        writeln!(out, "{} {}", prefix, message)?;
    }
    out.flush()?;
    Ok(())
}
