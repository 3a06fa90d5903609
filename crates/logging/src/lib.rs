//! Helpers for logging.
//!
//! The library crates only ever talk to the `log` facade.  Binaries and tests pick where the output goes by calling
//! one of these once at startup.

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Log to stderr, filtered by `RUST_LOG` or [DEFAULT_FILTER].
///
/// If called multiple times in the same process, only applies once.
pub fn log_to_stderr() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    log_to_stderr_with_filter(&filter);
}

/// Log to stderr using an explicit `env_logger` filter string, e.g. `"strand_net=debug"`.
///
/// Only the first call of this or [log_to_stderr] in a process has any effect.
pub fn log_to_stderr_with_filter(filter: &str) {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let res = env_logger::Builder::new()
            .parse_filters(filter)
            .format(|buf, record| {
                use std::io::Write;

                let now = time::OffsetDateTime::now_utc();

                writeln!(
                    buf,
                    "{} {} time={} target={}",
                    record.level(),
                    record.args(),
                    now,
                    record.target()
                )
            })
            .is_test(cfg!(test))
            .try_init();

        // Someone else installed a logger first; theirs wins.
        if let Err(e) = res {
            log::debug!("Not installing stderr logger: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        log_to_stderr_with_filter("debug");
        log_to_stderr();
        log::info!("still logging");
    }
}
