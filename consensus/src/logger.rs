use slog::{o, Drain, Logger};

const LOGGER_CHANNEL_SIZE: usize = 4096; // Size of logger channel buffer

/// Root logger for Raft instances: a terminal drain behind an async queue,
/// or the `log` facade when terminal output is compiled out.
#[cfg(feature = "slog-term")]
pub fn root_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    Logger::root(drain, o!())
}

#[cfg(not(feature = "slog-term"))]
pub fn root_logger() -> Logger {
    let drain = slog_async::Async::new(slog_stdlog::StdLog.fuse())
        .chan_size(LOGGER_CHANNEL_SIZE)
        .build()
        .fuse();
    Logger::root(drain, o!())
}

/// Logger that drops everything.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
