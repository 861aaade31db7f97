//! Signal name parsing for the CLI and control requests.

/// Parses a signal given as a number (`15`) or a name (`TERM`, `SIGTERM`,
/// `sigterm`).
#[cfg(unix)]
pub fn parse_signal(signal_str: &str) -> anyhow::Result<i32> {
    use std::str::FromStr;

    use nix::sys::signal::Signal;

    let trimmed = signal_str.trim();

    // Handle numeric signals
    if let Ok(num) = trimmed.parse::<i32>() {
        return Signal::try_from(num)
            .map(|signal| signal as i32)
            .map_err(|_| anyhow::anyhow!("Invalid signal number: {}", num));
    }

    // Handle named signals (with or without SIG prefix)
    let upper = trimmed.to_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };

    Signal::from_str(&name)
        .map(|signal| signal as i32)
        .map_err(|_| anyhow::anyhow!("Unknown signal: {}", signal_str))
}

/// Parses a signal given as a number or a name. Without POSIX signals only
/// the termination signals are understood.
#[cfg(not(unix))]
pub fn parse_signal(signal_str: &str) -> anyhow::Result<i32> {
    let trimmed = signal_str.trim();
    if let Ok(num) = trimmed.parse::<i32>() {
        if num > 0 && num < 32 {
            return Ok(num);
        }
        anyhow::bail!("Invalid signal number: {} (must be 1-31)", num);
    }

    let name = trimmed.to_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);

    match name {
        "INT" => Ok(2),
        "KILL" => Ok(9),
        "TERM" => Ok(15),
        _ => anyhow::bail!("Unknown signal: {}", signal_str),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric() {
        assert_eq!(parse_signal("9").unwrap(), 9);
        assert_eq!(parse_signal(" 15 ").unwrap(), 15);
        assert!(parse_signal("0").is_err());
        assert!(parse_signal("999").is_err());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(parse_signal("TERM").unwrap(), 15);
        assert_eq!(parse_signal("SIGKILL").unwrap(), 9);
        assert_eq!(parse_signal("hup").unwrap(), 1);
        assert_eq!(parse_signal("sigint").unwrap(), 2);
        assert_eq!(
            parse_signal("USR1").unwrap(),
            nix::sys::signal::Signal::SIGUSR1 as i32
        );
    }

    #[test]
    fn test_parse_unknown() {
        assert!(parse_signal("NOPE").is_err());
        assert!(parse_signal("").is_err());
    }
}
